//! STUN Codec (RFC 5389 subset)
//!
//! Builds Binding Requests and extracts the mapped address from Binding
//! Responses. Only what a NAT traversal client needs is implemented: the
//! 20-byte header, the attribute walk, and the three mapped-address
//! attribute flavours servers use in the wild.
//!
//! # Mapped address precedence
//!
//! Servers may send several mapped-address attributes. The decoder keeps
//! the last *accepted* one, where:
//!
//! - `XOR-MAPPED-ADDRESS` is always accepted,
//! - `MS-XOR-MAPPED-ADDRESS` is rejected once an `XOR-MAPPED-ADDRESS` was accepted,
//! - `MAPPED-ADDRESS` is rejected once either XOR flavour was accepted.
//!
//! A plain address is therefore overridden by any later XOR flavour, and an
//! MS flavour is overridden by a later standard XOR one. The rule is
//! deliberately asymmetric; tests pin every ordering down.
//!
//! # Example
//!
//! ```
//! use natter_traversal::nat::stun::{StunHeader, MAGIC_COOKIE};
//!
//! let request = StunHeader::binding_request();
//! let bytes = request.encode();
//! let header = StunHeader::decode(&bytes).unwrap();
//! assert_eq!(header.magic_cookie, MAGIC_COOKIE);
//! assert_eq!(header.transaction_id, request.transaction_id);
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tracing::{debug, info};

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Attribute header size (type + length)
const ATTRIBUTE_HEADER_SIZE: usize = 4;

/// Binding method
pub const METHOD_BINDING: u16 = 0x0001;

/// MAPPED-ADDRESS
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
/// RESPONSE-ADDRESS
pub const ATTR_RESPONSE_ADDRESS: u16 = 0x0002;
/// CHANGE-REQUEST (historically CHANGE-ADDRESS)
pub const ATTR_CHANGE_ADDRESS: u16 = 0x0003;
/// SOURCE-ADDRESS
pub const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
/// CHANGED-ADDRESS
pub const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
/// USERNAME
pub const ATTR_USERNAME: u16 = 0x0006;
/// PASSWORD
pub const ATTR_PASSWORD: u16 = 0x0007;
/// MESSAGE-INTEGRITY
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
/// ERROR-CODE
pub const ATTR_ERROR_CODE: u16 = 0x0009;
/// UNKNOWN-ATTRIBUTES
pub const ATTR_UNKNOWN_ATTRIBUTES: u16 = 0x000A;
/// REFLECTED-FROM
pub const ATTR_REFLECTED_FROM: u16 = 0x000B;
/// REALM
pub const ATTR_REALM: u16 = 0x0014;
/// NONCE
pub const ATTR_NONCE: u16 = 0x0015;
/// XOR-MAPPED-ADDRESS
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
/// MS-VERSION (vendor)
pub const ATTR_MS_VERSION: u16 = 0x8008;
/// MS-XOR-MAPPED-ADDRESS (vendor variant of XOR-MAPPED-ADDRESS)
pub const ATTR_MS_XOR_MAPPED_ADDRESS: u16 = 0x8020;
/// SOFTWARE
pub const ATTR_SOFTWARE: u16 = 0x8022;
/// ALTERNATE-SERVER
pub const ATTR_ALTERNATE_SERVER: u16 = 0x8023;
/// FINGERPRINT
pub const ATTR_FINGERPRINT: u16 = 0x8028;

/// Address family value for IPv4 in mapped-address attributes
const FAMILY_IPV4: u8 = 0x01;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Indication (no response expected)
    Indication,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
}

impl StunMessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    /// Human-readable class name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::Indication => "Indication",
            Self::SuccessResponse => "Response",
            Self::ErrorResponse => "Error Response",
        }
    }
}

/// Encode message class and method into a 16-bit message type
///
/// RFC 5389 Section 6 encoding:
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[must_use]
pub fn encode_message(class: StunMessageClass, method: u16) -> u16 {
    let class_bits = class.bits();

    // Bits 0-3: M0-M3
    let m0_m3 = method & 0x0F;
    // Bit 4: C0
    let c0 = (class_bits & 0x01) << 4;
    // Bits 5-7: M4-M6
    let m4_m6 = (method & 0x70) << 1;
    // Bit 8: C1
    let c1 = (class_bits & 0x02) << 7;
    // Bits 9-13: M7-M11
    let m7_m11 = (method & 0xF80) << 2;

    m0_m3 | c0 | m4_m6 | c1 | m7_m11
}

/// Extract the message class from a message type
#[must_use]
pub fn decode_class(message_type: u16) -> StunMessageClass {
    StunMessageClass::from_bits(((message_type & 0x0010) >> 4) | ((message_type & 0x0100) >> 7))
}

/// Extract the method from a message type
#[must_use]
pub fn decode_method(message_type: u16) -> u16 {
    (message_type & 0x000F) | ((message_type & 0x00E0) >> 1) | ((message_type & 0x3E00) >> 2)
}

/// Human-readable name of a message type, e.g. `"Binding Response"`
#[must_use]
pub fn message_name(message_type: u16) -> String {
    let method = match decode_method(message_type) {
        METHOD_BINDING => "Binding",
        _ => "Unknown Method",
    };
    format!("{method} {}", decode_class(message_type).name())
}

/// Human-readable name of an attribute type
#[must_use]
pub fn attribute_name(attr_type: u16) -> &'static str {
    match attr_type {
        ATTR_MAPPED_ADDRESS => "Mapped Address",
        ATTR_RESPONSE_ADDRESS => "Response Address",
        ATTR_CHANGE_ADDRESS => "Change Address",
        ATTR_SOURCE_ADDRESS => "Source Address",
        ATTR_CHANGED_ADDRESS => "Changed Address",
        ATTR_USERNAME => "Username",
        ATTR_PASSWORD => "Password",
        ATTR_MESSAGE_INTEGRITY => "Message Integrity",
        ATTR_ERROR_CODE => "Error Code",
        ATTR_UNKNOWN_ATTRIBUTES => "Unknown Attributes",
        ATTR_REFLECTED_FROM => "Reflected From",
        ATTR_REALM => "Realm",
        ATTR_NONCE => "Nonce",
        ATTR_XOR_MAPPED_ADDRESS => "XOR Mapped Address",
        ATTR_MS_VERSION => "MS Version",
        ATTR_MS_XOR_MAPPED_ADDRESS => "MS XOR Mapped Address",
        ATTR_SOFTWARE => "Software",
        ATTR_ALTERNATE_SERVER => "Alternate Server",
        ATTR_FINGERPRINT => "Fingerprint",
        _ => "Unknown Attribute",
    }
}

/// STUN message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunHeader {
    /// Encoded class and method
    pub message_type: u16,
    /// Length of the attribute section in bytes
    pub message_length: u16,
    /// Always [`MAGIC_COOKIE`] for accepted messages
    pub magic_cookie: u32,
    /// Transaction ID (96 bits)
    pub transaction_id: [u32; 3],
}

impl StunHeader {
    /// Create a Binding Request header with a fresh random transaction id
    #[must_use]
    pub fn binding_request() -> Self {
        Self {
            message_type: encode_message(StunMessageClass::Request, METHOD_BINDING),
            message_length: 0,
            magic_cookie: MAGIC_COOKIE,
            transaction_id: rand::random(),
        }
    }

    /// Encode header to bytes
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.message_type.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.message_length.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.magic_cookie.to_be_bytes());
        for (i, word) in self.transaction_id.iter().enumerate() {
            let start = 8 + i * 4;
            bytes[start..start + 4].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    /// Decode and validate a header
    ///
    /// # Errors
    ///
    /// Returns [`StunError::MessageTooShort`] for buffers under 20 bytes and
    /// [`StunError::InvalidMagicCookie`] when the cookie does not match.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort(bytes.len()));
        }

        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic_cookie));
        }

        let word = |i: usize| {
            let start = 8 + i * 4;
            u32::from_be_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        };

        Ok(Self {
            message_type: u16::from_be_bytes([bytes[0], bytes[1]]),
            message_length: u16::from_be_bytes([bytes[2], bytes[3]]),
            magic_cookie,
            transaction_id: [word(0), word(1), word(2)],
        })
    }

    /// Message class encoded in the header
    #[must_use]
    pub fn class(&self) -> StunMessageClass {
        decode_class(self.message_type)
    }

    /// Method encoded in the header
    #[must_use]
    pub fn method(&self) -> u16 {
        decode_method(self.message_type)
    }
}

/// Encode a Binding Request with a random transaction id
#[must_use]
pub fn encode_binding_request() -> Vec<u8> {
    StunHeader::binding_request().encode().to_vec()
}

/// One type/length/value attribute, borrowing its value from the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunAttribute<'a> {
    /// Attribute type
    pub attr_type: u16,
    /// Attribute value, `value.len()` is the declared length
    pub value: &'a [u8],
}

/// Iterator over the attributes of a message body
///
/// Stops when fewer than 4 bytes remain or an attribute's declared length
/// overruns the body. Values are not padded on read.
#[derive(Debug, Clone)]
pub struct StunAttributes<'a> {
    body: &'a [u8],
}

impl<'a> StunAttributes<'a> {
    /// Walk `body`, which must already be clamped to the declared length
    #[must_use]
    pub fn new(body: &'a [u8]) -> Self {
        Self { body }
    }
}

impl<'a> Iterator for StunAttributes<'a> {
    type Item = StunAttribute<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }
        if self.body.len() < ATTRIBUTE_HEADER_SIZE {
            info!(
                "STUN attribute too short (got {}, expecting {})",
                self.body.len(),
                ATTRIBUTE_HEADER_SIZE
            );
            self.body = &[];
            return None;
        }

        let attr_type = u16::from_be_bytes([self.body[0], self.body[1]]);
        let length = u16::from_be_bytes([self.body[2], self.body[3]]) as usize;
        let total = ATTRIBUTE_HEADER_SIZE + length;
        if total > self.body.len() {
            info!(
                "Inconsistent STUN attribute (length {} exceeds remaining {})",
                total,
                self.body.len()
            );
            self.body = &[];
            return None;
        }

        let value = &self.body[ATTRIBUTE_HEADER_SIZE..total];
        self.body = &self.body[total..];
        Some(StunAttribute { attr_type, value })
    }
}

/// Externally visible IPv4 address reported by a STUN server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedAddress {
    /// Address family (always IPv4)
    pub family: u8,
    /// Port
    pub port: u16,
    /// IPv4 address
    pub ipv4: Ipv4Addr,
}

impl MappedAddress {
    /// Decode an address attribute value, un-XORing with `magic` (0 for plain)
    fn from_value(value: &[u8], magic: u32) -> Option<Self> {
        if value.len() < 8 || value[1] != FAMILY_IPV4 {
            return None;
        }
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (magic >> 16) as u16;
        let addr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ magic;
        Some(Self {
            family: value[1],
            port,
            ipv4: Ipv4Addr::from(addr),
        })
    }

    /// Address as a socket address
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ipv4, self.port))
    }
}

impl std::fmt::Display for MappedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ipv4, self.port)
    }
}

/// Decode a STUN response and extract its mapped address
///
/// # Errors
///
/// Fails when the header is short or carries the wrong cookie, or with
/// [`StunError::NotFound`] when no mapped-address attribute could be used.
pub fn decode_response(bytes: &[u8]) -> Result<MappedAddress, StunError> {
    let header = StunHeader::decode(bytes)?;
    debug!(
        "STUN packet, msg {} ({:04x}), length: {}",
        message_name(header.message_type),
        header.message_type,
        header.message_length
    );

    let remaining = &bytes[HEADER_SIZE..];
    let declared = header.message_length as usize;
    if declared > remaining.len() {
        info!(
            "Scrambled STUN packet length (got {}, expecting {})",
            remaining.len(),
            declared
        );
    }
    let body = &remaining[..declared.min(remaining.len())];

    let mut accepted: Option<(u16, MappedAddress)> = None;
    for attr in StunAttributes::new(body) {
        let last = accepted.map(|(attr_type, _)| attr_type);
        let (allowed, magic) = match attr.attr_type {
            ATTR_MAPPED_ADDRESS => (
                !matches!(
                    last,
                    Some(ATTR_XOR_MAPPED_ADDRESS | ATTR_MS_XOR_MAPPED_ADDRESS)
                ),
                0,
            ),
            ATTR_MS_XOR_MAPPED_ADDRESS => (last != Some(ATTR_XOR_MAPPED_ADDRESS), MAGIC_COOKIE),
            ATTR_XOR_MAPPED_ADDRESS => (true, MAGIC_COOKIE),
            other => {
                debug!(
                    "Ignoring STUN attribute {} ({:04x}), length {}",
                    attribute_name(other),
                    other,
                    attr.value.len()
                );
                continue;
            }
        };

        if !allowed {
            debug!(
                "Skipping {} superseded by earlier {}",
                attribute_name(attr.attr_type),
                last.map_or("none", attribute_name)
            );
            continue;
        }

        match MappedAddress::from_value(attr.value, magic) {
            Some(address) => accepted = Some((attr.attr_type, address)),
            None => debug!(
                "Unusable {} (length {})",
                attribute_name(attr.attr_type),
                attr.value.len()
            ),
        }
    }

    accepted
        .map(|(_, address)| address)
        .ok_or(StunError::NotFound)
}

/// STUN error types
#[derive(Debug, Error)]
pub enum StunError {
    /// Buffer shorter than a STUN header
    #[error("STUN message too short ({0} bytes)")]
    MessageTooShort(usize),

    /// Magic cookie mismatch
    #[error("Invalid STUN magic cookie {0:#010x}")]
    InvalidMagicCookie(u32),

    /// No usable mapped-address attribute
    #[error("No mapped address in STUN response")]
    NotFound,

    /// Server name did not resolve to an IPv4 address
    #[error("Could not resolve STUN server {0}")]
    Resolve(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-imposed deadline expired
    #[error("STUN query timeout")]
    Timeout,
}
