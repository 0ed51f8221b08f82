//! SSDP M-SEARCH requests and reply parsing

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SSDP port
pub const SSDP_PORT: u16 = 1900;

/// IPv4 SSDP multicast group
pub const SSDP_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// IPv6 link-local SSDP multicast group
pub const SSDP_MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c);

/// Search targets, queried in this order
pub const SEARCH_TARGETS: [&str; 4] = [
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
    "upnp:rootdevice",
];

/// Seconds devices may wait before answering
pub const MX_SECONDS: u8 = 3;

/// Multicast destination for the address family of `local`
#[must_use]
pub fn multicast_addr(local: IpAddr) -> SocketAddr {
    match local {
        IpAddr::V4(_) => SocketAddr::new(SSDP_MULTICAST_V4.into(), SSDP_PORT),
        IpAddr::V6(_) => SocketAddr::new(SSDP_MULTICAST_V6.into(), SSDP_PORT),
    }
}

/// M-SEARCH datagram for `search_target`
#[must_use]
pub fn msearch_request(search_target: &str, destination: SocketAddr) -> String {
    let host = match destination {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    };
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {host}\r\n\
         ST: {search_target}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {MX_SECONDS}\r\n\
         \r\n"
    )
}

/// Headers of interest in an M-SEARCH reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpReply {
    /// `LOCATION:` - URL of the device description
    pub location: String,
    /// `ST:` - search target the device answered for
    pub search_target: String,
}

/// Extract `LOCATION` and `ST` from a reply
///
/// Header lines are split at their first `:`, names compared
/// case-insensitively, and values trimmed of leading spaces. Only lines
/// terminated by CR or LF are considered. Returns `None` unless both
/// headers were present and the location is non-empty.
#[must_use]
pub fn parse_msearch_reply(reply: &[u8]) -> Option<SsdpReply> {
    let mut location = None;
    let mut search_target = None;

    let mut line_start = 0;
    for (i, &b) in reply.iter().enumerate() {
        if b != b'\r' && b != b'\n' {
            continue;
        }
        let line = &reply[line_start..i];
        line_start = i + 1;

        let Some(colon) = line.iter().position(|&c| c == b':') else {
            continue;
        };
        let name = line[..colon].trim_ascii();
        let value = trim_leading_spaces(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"location") {
            location = Some(value);
        } else if name.eq_ignore_ascii_case(b"st") {
            search_target = Some(value);
        }
    }

    let location = location.filter(|l| !l.is_empty())?;
    let search_target = search_target?;
    Some(SsdpReply {
        location: String::from_utf8_lossy(location).into_owned(),
        search_target: String::from_utf8_lossy(search_target).into_owned(),
    })
}

fn trim_leading_spaces(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|&b| b != b' ').unwrap_or(value.len());
    &value[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_msearch_request_v4() {
        let request = msearch_request(SEARCH_TARGETS[0], multicast_addr(Ipv4Addr::UNSPECIFIED.into()));
        assert_eq!(
            request,
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 3\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_msearch_request_v6() {
        let destination = multicast_addr(Ipv6Addr::UNSPECIFIED.into());
        assert_eq!(destination.to_string(), "[ff02::c]:1900");
        let request = msearch_request("upnp:rootdevice", destination);
        assert!(request.contains("HOST: [ff02::c]:1900\r\n"));
    }

    #[test]
    fn test_parse_reply() {
        let reply = b"HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age=120\r\n\
            Location:   http://192.168.1.1:5431/dyndev/uuid:0000e068\r\n\
            SERVER: Linux/2.6 UPnP/1.0 miniupnpd/1.0\r\n\
            st: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
            USN: uuid:0000e068::upnp:rootdevice\r\n\
            \r\n";
        let parsed = parse_msearch_reply(reply).unwrap();
        assert_eq!(parsed.location, "http://192.168.1.1:5431/dyndev/uuid:0000e068");
        assert_eq!(
            parsed.search_target,
            "urn:schemas-upnp-org:device:InternetGatewayDevice:1"
        );
    }

    #[test]
    fn test_parse_reply_lf_only() {
        let parsed =
            parse_msearch_reply(b"HTTP/1.1 200 OK\nLOCATION: http://h/d.xml\nST:upnp:rootdevice\n")
                .unwrap();
        assert_eq!(parsed.location, "http://h/d.xml");
        assert_eq!(parsed.search_target, "upnp:rootdevice");
    }

    #[test]
    fn test_reply_without_st_dropped() {
        assert_eq!(
            parse_msearch_reply(b"HTTP/1.1 200 OK\r\nLOCATION: http://h/d.xml\r\n\r\n"),
            None
        );
    }

    #[test]
    fn test_unterminated_line_ignored() {
        assert_eq!(parse_msearch_reply(b"ST: x\r\nLOCATION: http://h/d.xml"), None);
    }

    #[test]
    fn test_reply_without_location_dropped() {
        assert_eq!(parse_msearch_reply(b"HTTP/1.1 200 OK\r\nST: x\r\n\r\n"), None);
        assert_eq!(parse_msearch_reply(b"ST: x\r\nLOCATION:   \r\n"), None);
        assert_eq!(parse_msearch_reply(b""), None);
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(reply in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = parse_msearch_reply(&reply);
        }
    }
}
