//! IGD description and SOAP reply parsers
//!
//! Both parsers are [`XmlHandler`]s fed by the micro-parser in
//! [`super::xml`]. Field values are silently truncated to the fixed bounds
//! devices have historically been tested against (128-byte URL fields,
//! 64-byte SOAP names and values, one byte of each reserved as in a C
//! string buffer).

use super::xml::{self, XmlHandler};

/// Capacity of URL and service-type fields in a device description
pub const URL_FIELD_CAPACITY: usize = 128;

/// Capacity of element names and values in a SOAP reply
pub const SOAP_FIELD_CAPACITY: usize = 64;

/// Service type of the WAN common interface configuration service
pub const SERVICE_WAN_COMMON_IFC: &str =
    "urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1";

/// Service type of the WAN IP connection service
pub const SERVICE_WAN_IP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// Service type of the WAN PPP connection service
pub const SERVICE_WAN_PPP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

/// Returns `true` for the WANIPConnection / WANPPPConnection service types.
#[must_use]
pub fn is_wan_connection_service(service_type: &str) -> bool {
    service_type == SERVICE_WAN_IP_CONNECTION || service_type == SERVICE_WAN_PPP_CONNECTION
}

/// Copy at most `capacity - 1` bytes of `data` into an owned string.
pub(crate) fn bounded(data: &[u8], capacity: usize) -> String {
    let keep = data.len().min(capacity.saturating_sub(1));
    String::from_utf8_lossy(&data[..keep]).into_owned()
}

/// URLs and type of one service block of a device description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgdService {
    /// `controlURL`, as written in the description
    pub control_url: String,
    /// `eventSubURL`
    pub event_sub_url: String,
    /// `SCPDURL`
    pub scpd_url: String,
    /// `serviceType`
    pub service_type: String,
}

/// Parsed IGD device description
///
/// Only the services NAT traversal cares about are kept: the
/// WANCommonInterfaceConfig service lands in [`IgdData::cif`], the
/// WANIPConnection / WANPPPConnection service in [`IgdData::connection`].
/// When several matching services appear, the last one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgdData {
    /// `URLBase` of the device, empty when absent
    pub base_url: String,
    /// WANCommonInterfaceConfig service
    pub cif: IgdService,
    /// WANIPConnection or WANPPPConnection service
    pub connection: IgdService,
}

impl IgdData {
    /// Parse a device description document.
    ///
    /// Never fails: malformed documents yield whatever was committed before
    /// the tokenizer stopped.
    #[must_use]
    pub fn parse(description: &[u8]) -> Self {
        let mut parser = IgdParser::default();
        xml::parse(description, &mut parser);
        parser.data
    }

    /// Absolute control URL for this device.
    ///
    /// The connection service is preferred over the CIF service. Relative
    /// URLs are resolved against `URLBase`, or against the directory of
    /// `description_url` when the device has no `URLBase`. Returns an empty
    /// string when neither service has a control URL.
    #[must_use]
    pub fn control_url(&self, description_url: &str) -> String {
        let raw = if !self.connection.control_url.is_empty() {
            &self.connection.control_url
        } else if !self.cif.control_url.is_empty() {
            &self.cif.control_url
        } else {
            return String::new();
        };

        if self.base_url.is_empty() {
            absolute_url(parent_of(description_url), raw)
        } else {
            absolute_url(&self.base_url, raw)
        }
    }

    /// Service type to drive commands with: connection service first, then CIF.
    #[must_use]
    pub fn service_type(&self) -> &str {
        if !self.connection.service_type.is_empty() {
            &self.connection.service_type
        } else {
            &self.cif.service_type
        }
    }
}

/// Strip the last path segment of a description URL.
fn parent_of(description_url: &str) -> &str {
    let path_start = description_url
        .find("://")
        .map_or(0, |scheme_end| scheme_end + 3);
    match description_url[path_start..].rfind('/') {
        Some(slash) => &description_url[..path_start + slash],
        None => description_url,
    }
}

/// Join `raw` onto `base` unless it is already an absolute `http://` URL.
fn absolute_url(base: &str, raw: &str) -> String {
    if raw.starts_with("http://") {
        return raw.to_string();
    }
    let base = base.trim_end_matches('/');
    let raw = raw.trim_start_matches('/');
    format!("{base}/{raw}")
}

#[derive(Default)]
struct IgdParser {
    data: IgdData,
    current: Vec<u8>,
    pending: IgdService,
}

impl XmlHandler for IgdParser {
    fn start_element(&mut self, name: &[u8]) {
        self.current.clear();
        self.current
            .extend_from_slice(&name[..name.len().min(SOAP_FIELD_CAPACITY - 1)]);
        if name == b"service" {
            self.pending = IgdService::default();
        }
    }

    fn end_element(&mut self, name: &[u8]) {
        if name != b"service" {
            return;
        }
        let service = std::mem::take(&mut self.pending);
        if service.service_type == SERVICE_WAN_COMMON_IFC {
            self.data.cif = service;
        } else if is_wan_connection_service(&service.service_type) {
            self.data.connection = service;
        }
    }

    fn text(&mut self, data: &[u8]) {
        let slot = match self.current.as_slice() {
            b"URLBase" => &mut self.data.base_url,
            b"serviceType" => &mut self.pending.service_type,
            b"controlURL" => &mut self.pending.control_url,
            b"eventSubURL" => &mut self.pending.event_sub_url,
            b"SCPDURL" => &mut self.pending.scpd_url,
            _ => return,
        };
        *slot = bounded(data, URL_FIELD_CAPACITY);
    }
}

/// Ordered (element name, value) pairs of a SOAP reply
///
/// Duplicates are kept; [`NameValueList::get`] returns the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameValueList {
    pairs: Vec<(String, String)>,
}

impl NameValueList {
    /// Parse a SOAP reply. HTTP headers in front of the body are ignored by
    /// the tokenizer, so the raw response can be passed as-is.
    #[must_use]
    pub fn parse(reply: &[u8]) -> Self {
        let mut parser = ReplyParser::default();
        xml::parse(reply, &mut parser);
        parser.list
    }

    /// First value recorded for element `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// UPnP `errorCode`, if the reply carries one.
    ///
    /// A present but non-numeric code maps to -1.
    #[must_use]
    pub fn error_code(&self) -> Option<i32> {
        self.get("errorCode").map(parse_leading_int)
    }

    /// Iterate over all pairs in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of recorded pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the reply contained no character data at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// `sscanf("%d")` style: optional sign followed by digits, anything after ignored.
fn parse_leading_int(value: &str) -> i32 {
    let trimmed = value.trim_start();
    let digits_end = trimmed
        .char_indices()
        .skip_while(|&(i, c)| i == 0 && (c == '-' || c == '+'))
        .find(|&(_, c)| !c.is_ascii_digit())
        .map_or(trimmed.len(), |(i, _)| i);
    trimmed[..digits_end].parse().unwrap_or(-1)
}

#[derive(Default)]
struct ReplyParser {
    list: NameValueList,
    current: String,
}

impl XmlHandler for ReplyParser {
    fn start_element(&mut self, name: &[u8]) {
        self.current = bounded(name, SOAP_FIELD_CAPACITY);
    }

    fn text(&mut self, data: &[u8]) {
        self.list
            .pairs
            .push((self.current.clone(), bounded(data, SOAP_FIELD_CAPACITY)));
    }
}
