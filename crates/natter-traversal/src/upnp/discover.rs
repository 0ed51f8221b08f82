//! UPnP IGD discovery engine
//!
//! A [`DiscoverySession`] walks through four phases:
//!
//! 1. **Searching**: one M-SEARCH per entry of [`SEARCH_TARGETS`], in order.
//!    Each waits up to the probe timeout for a `LOCATION`/`ST` reply, then
//!    takes whatever other replies are already queued and moves on.
//! 2. **Awaiting descriptions**: every candidate's description document is
//!    downloaded and parsed concurrently, then `GetStatusInfo` is asked of
//!    the resulting control URL.
//! 3. **Selecting best**: connected devices first, then any WAN connection
//!    service, then whatever answered first. See [`select_device`].
//! 4. **Done**: the winner's control URL and service type are returned and
//!    the candidate list is released.
//!
//! Only socket setup can fail the run. Malformed replies are dropped,
//! unusable descriptions degrade a candidate to "not connected", and an
//! empty network yields `Ok(None)`.

use super::http;
use super::igd::{IgdData, is_wan_connection_service};
use super::soap::{CommandConfig, SoapClient};
use super::ssdp::{self, SEARCH_TARGETS, SsdpReply};
use crate::task::OperationHandle;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default receive window after each M-SEARCH
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default pause between two M-SEARCH probes
pub const DEFAULT_SEARCH_DELAY: Duration = Duration::from_millis(100);

/// Default deadline for downloading one device description
pub const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default capacity for a device description; longer documents are
/// truncated to one byte less
pub const DESCRIPTION_BUFFER_SIZE: usize = 2048;

/// Receive buffer for SSDP replies
const DISCOVER_BUFFER_SIZE: usize = 1536;

/// Discovery error types
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The SSDP socket could not be created, configured or bound
    #[error("SSDP socket setup failed: {0}")]
    Socket(#[from] io::Error),

    /// Bind address and SSDP destination belong to different families
    #[error("Unsupported address family")]
    UnsupportedAddressFamily,
}

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Interface for multicast: an IPv4 address, or an interface name or
    /// index for IPv6
    pub interface: Option<String>,
    /// Local address to bind; its family selects IPv4 or IPv6 SSDP
    pub bind_addr: Option<IpAddr>,
    /// M-SEARCH destination; defaults to the SSDP group of the bind family
    pub ssdp_target: Option<SocketAddr>,
    /// Receive window after each M-SEARCH
    pub probe_timeout: Duration,
    /// Pause between probes
    pub search_delay: Duration,
    /// Deadline for each description download
    pub description_timeout: Duration,
    /// Description buffer capacity; at most `capacity - 1` bytes are kept
    pub description_capacity: usize,
    /// Settings for the `GetStatusInfo` probes
    pub command: CommandConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interface: None,
            bind_addr: None,
            ssdp_target: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            search_delay: DEFAULT_SEARCH_DELAY,
            description_timeout: DESCRIPTION_TIMEOUT,
            description_capacity: DESCRIPTION_BUFFER_SIZE,
            command: CommandConfig::default(),
        }
    }
}

/// Phase of a discovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started
    Idle,
    /// Probing for the search target at this index of [`SEARCH_TARGETS`]
    Searching(usize),
    /// Waiting for this many description downloads
    AwaitingDescriptions(usize),
    /// Choosing among the candidates
    SelectingBest,
    /// Finished; candidates released
    Done,
}

/// A device that answered an M-SEARCH
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpnpDevice {
    /// `LOCATION` of the reply
    pub description_url: String,
    /// `ST` of the reply
    pub search_target: String,
    /// Parsed description; empty until downloaded
    pub description: IgdData,
    /// Absolute control URL of the preferred service
    pub control_url: String,
    /// Service type of the preferred service
    pub service_type: String,
    /// Whether `GetStatusInfo` reported `Connected`
    pub is_connected: bool,
}

impl UpnpDevice {
    /// Candidate from an SSDP reply, not yet described
    #[must_use]
    pub fn new(reply: SsdpReply) -> Self {
        Self {
            description_url: reply.location,
            search_target: reply.search_target,
            ..Self::default()
        }
    }
}

/// The selected gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgdDevice {
    /// Control URL to send SOAP commands to
    pub control_url: String,
    /// Service type to address them to
    pub service_type: String,
}

impl From<&UpnpDevice> for IgdDevice {
    fn from(device: &UpnpDevice) -> Self {
        Self {
            control_url: device.control_url.clone(),
            service_type: device.service_type.clone(),
        }
    }
}

/// Pick the best candidate
///
/// Three passes over the list in discovery order: the first connected
/// device; otherwise the first offering a WAN IP or PPP connection service;
/// otherwise the first candidate at all.
#[must_use]
pub fn select_device(candidates: &[UpnpDevice]) -> Option<&UpnpDevice> {
    candidates
        .iter()
        .find(|d| d.is_connected)
        .or_else(|| {
            candidates
                .iter()
                .find(|d| is_wan_connection_service(&d.service_type))
        })
        .or_else(|| candidates.first())
}

/// What a description download contributes to a candidate
struct Description {
    data: IgdData,
    control_url: String,
    service_type: String,
    is_connected: bool,
}

/// One discovery run
#[derive(Debug)]
pub struct DiscoverySession {
    config: DiscoveryConfig,
    soap: SoapClient,
    state: DiscoveryState,
    candidates: Vec<UpnpDevice>,
}

impl DiscoverySession {
    /// Create an idle session
    #[must_use]
    pub fn new(config: DiscoveryConfig) -> Self {
        let soap = SoapClient::new(config.command.clone());
        Self {
            config,
            soap,
            state: DiscoveryState::Idle,
            candidates: Vec::new(),
        }
    }

    /// Current phase
    #[must_use]
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Candidates collected so far
    #[must_use]
    pub fn candidates(&self) -> &[UpnpDevice] {
        &self.candidates
    }

    /// Run discovery to completion
    ///
    /// # Errors
    ///
    /// Only when the SSDP socket cannot be set up. Finding no gateway is
    /// `Ok(None)`.
    pub async fn run(&mut self) -> Result<Option<IgdDevice>, DiscoveryError> {
        let (socket, destination) = match self.open_socket() {
            Ok(opened) => opened,
            Err(e) => {
                warn!("UPnP discovery aborted: {}", e);
                self.state = DiscoveryState::Done;
                return Err(e);
            }
        };

        self.search(&socket, destination).await;
        drop(socket);

        self.describe_candidates().await;

        self.state = DiscoveryState::SelectingBest;
        let candidates = std::mem::take(&mut self.candidates);
        let selected = select_device(&candidates).map(IgdDevice::from);
        match &selected {
            Some(device) => info!(
                "Selected UPnP IGD {} ({}) out of {} candidate(s)",
                device.control_url,
                device.service_type,
                candidates.len()
            ),
            None => info!("No UPnP IGD found"),
        }

        self.state = DiscoveryState::Done;
        Ok(selected)
    }

    fn open_socket(&self) -> Result<(UdpSocket, SocketAddr), DiscoveryError> {
        let local_ip = self
            .config
            .bind_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let destination = self
            .config
            .ssdp_target
            .unwrap_or_else(|| ssdp::multicast_addr(local_ip));
        if destination.is_ipv4() != local_ip.is_ipv4() {
            return Err(DiscoveryError::UnsupportedAddressFamily);
        }

        let domain = if local_ip.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        match local_ip {
            _ if !destination.ip().is_multicast() => {}
            IpAddr::V4(addr) => {
                let interface = self
                    .config
                    .interface
                    .as_deref()
                    .and_then(|name| name.parse::<Ipv4Addr>().ok())
                    .unwrap_or(addr);
                if !interface.is_unspecified() {
                    socket.set_multicast_if_v4(&interface)?;
                }
            }
            IpAddr::V6(_) => {
                if let Some(name) = self.config.interface.as_deref() {
                    match interface_index(name) {
                        Some(index) => socket.set_multicast_if_v6(index)?,
                        None => debug!("Unknown interface {}, using default", name),
                    }
                }
            }
        }

        socket.bind(&SocketAddr::new(local_ip, 0).into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        debug!("SSDP socket bound to {}", socket.local_addr()?);
        Ok((socket, destination))
    }

    async fn search(&mut self, socket: &UdpSocket, destination: SocketAddr) {
        let mut buf = [0u8; DISCOVER_BUFFER_SIZE];

        for (index, target) in SEARCH_TARGETS.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.search_delay).await;
            }
            self.state = DiscoveryState::Searching(index);

            let request = ssdp::msearch_request(target, destination);
            match socket.send_to(request.as_bytes(), destination).await {
                Ok(sent) if sent < request.len() => {
                    debug!("Short M-SEARCH send for {}: {} bytes", target, sent);
                }
                Ok(_) => debug!("Sent M-SEARCH for {} to {}", target, destination),
                Err(e) => {
                    info!("Failed to send M-SEARCH to {}: {}", destination, e);
                    continue;
                }
            }

            let deadline = Instant::now() + self.config.probe_timeout;
            loop {
                let received =
                    tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
                let (len, from) = match received {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        debug!("SSDP receive failed: {}", e);
                        break;
                    }
                    Ok(Ok(received)) => received,
                };
                if self.add_candidate(&buf[..len], from) {
                    break;
                }
            }

            // Other replies already queued are taken without waiting
            loop {
                match socket.try_recv_from(&mut buf) {
                    Ok((len, from)) => {
                        self.add_candidate(&buf[..len], from);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("SSDP receive failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Record a usable M-SEARCH reply; returns whether one was recorded
    fn add_candidate(&mut self, datagram: &[u8], from: SocketAddr) -> bool {
        match ssdp::parse_msearch_reply(datagram) {
            Some(reply) => {
                debug!(
                    "Found device {} when looking for {}",
                    reply.location, reply.search_target
                );
                self.candidates.push(UpnpDevice::new(reply));
                true
            }
            None => {
                debug!("Dropping unusable SSDP reply from {}", from);
                false
            }
        }
    }

    async fn describe_candidates(&mut self) {
        let mut pending = self.candidates.len();
        self.state = DiscoveryState::AwaitingDescriptions(pending);

        let mut tasks = JoinSet::new();
        for (index, device) in self.candidates.iter().enumerate() {
            let url = device.description_url.clone();
            let config = self.config.clone();
            let soap = self.soap.clone();
            tasks.spawn(async move { (index, describe(&url, &config, &soap).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            pending -= 1;
            self.state = DiscoveryState::AwaitingDescriptions(pending);
            match joined {
                Ok((index, Some(description))) => {
                    let device = &mut self.candidates[index];
                    device.description = description.data;
                    device.control_url = description.control_url;
                    device.service_type = description.service_type;
                    device.is_connected = description.is_connected;
                }
                Ok((_, None)) => {}
                Err(e) => warn!("Description task failed: {}", e),
            }
        }
    }
}

/// Download and parse one description, then probe the connection state
async fn describe(url: &str, config: &DiscoveryConfig, soap: &SoapClient) -> Option<Description> {
    let limit = config.description_capacity.saturating_sub(1);
    let body = match http::get(url, limit, config.description_timeout).await {
        Ok(body) if !body.is_empty() => body,
        Ok(_) => {
            info!("Empty UPnP description at {}", url);
            return None;
        }
        Err(e) => {
            info!("Failed to download UPnP description {}: {}", url, e);
            return None;
        }
    };

    let data = IgdData::parse(&body);
    let control_url = data.control_url(url);
    let service_type = data.service_type().to_string();
    if control_url.is_empty() {
        debug!("Description {} names no control URL", url);
        return Some(Description {
            data,
            control_url,
            service_type,
            is_connected: false,
        });
    }

    let is_connected = match soap.get_status_info(&control_url, &service_type).await {
        Ok(status) => {
            debug!("{} reports status {:?}", control_url, status.status);
            status.is_connected()
        }
        Err(e) => {
            info!("Could not get UPnP device status from {}: {}", control_url, e);
            false
        }
    };

    Some(Description {
        data,
        control_url,
        service_type,
        is_connected,
    })
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    if let Ok(index) = name.parse() {
        return Some(index);
    }
    let name = std::ffi::CString::new(name).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string for the whole call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    (index != 0).then_some(index)
}

#[cfg(not(unix))]
fn interface_index(name: &str) -> Option<u32> {
    name.parse().ok()
}

/// Discover the best IGD on the local network
///
/// # Errors
///
/// Only when the SSDP socket cannot be set up.
pub async fn discover_igd(config: DiscoveryConfig) -> Result<Option<IgdDevice>, DiscoveryError> {
    DiscoverySession::new(config).run().await
}

/// Run [`discover_igd`] in the background
///
/// `on_result` receives the selected device, or `None` when nothing was
/// found or the socket could not be set up.
pub fn spawn_discover_igd<C>(config: DiscoveryConfig, on_result: C) -> OperationHandle
where
    C: FnOnce(Option<IgdDevice>) + Send + 'static,
{
    OperationHandle::spawn(
        async move { discover_igd(config).await.ok().flatten() },
        on_result,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upnp::igd::IgdService;
    use tokio::sync::oneshot;

    const WANIP: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

    fn device(name: &str, connected: bool, service_type: &str) -> UpnpDevice {
        UpnpDevice {
            description_url: format!("http://{name}/desc.xml"),
            control_url: format!("http://{name}/ctl"),
            service_type: service_type.to_string(),
            is_connected: connected,
            ..UpnpDevice::default()
        }
    }

    fn quick_config(target: SocketAddr) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_addr: Some(Ipv4Addr::LOCALHOST.into()),
            ssdp_target: Some(target),
            probe_timeout: Duration::from_millis(50),
            search_delay: Duration::from_millis(1),
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_selection_order() {
        let a = device("a", true, WANIP);
        let b = device("b", false, WANIP);
        let c = device("c", false, "upnp:rootdevice");

        let all = vec![a.clone(), b.clone(), c.clone()];
        assert_eq!(select_device(&all), Some(&a));

        let without_a = vec![b.clone(), c.clone()];
        assert_eq!(select_device(&without_a), Some(&b));

        let only_c = vec![c.clone()];
        assert_eq!(select_device(&only_c), Some(&c));

        assert_eq!(select_device(&[]), None);
    }

    #[test]
    fn test_selection_prefers_later_connected_device() {
        let candidates = vec![
            device("a", false, WANIP),
            device("b", false, "urn:schemas-upnp-org:service:WANPPPConnection:1"),
            device("c", true, "upnp:rootdevice"),
        ];
        assert_eq!(
            select_device(&candidates).map(|d| d.description_url.as_str()),
            Some("http://c/desc.xml")
        );
    }

    #[test]
    fn test_selection_skips_cif_for_wan_service() {
        let candidates = vec![
            device(
                "a",
                false,
                "urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1",
            ),
            device("b", false, WANIP),
        ];
        assert_eq!(
            select_device(&candidates).map(|d| d.description_url.as_str()),
            Some("http://b/desc.xml")
        );
    }

    #[test]
    fn test_device_from_reply() {
        let d = UpnpDevice::new(SsdpReply {
            location: "http://10.0.0.1/igd.xml".to_string(),
            search_target: "upnp:rootdevice".to_string(),
        });
        assert_eq!(d.description_url, "http://10.0.0.1/igd.xml");
        assert_eq!(d.search_target, "upnp:rootdevice");
        assert!(!d.is_connected);
        assert!(d.control_url.is_empty());
    }

    #[tokio::test]
    async fn test_no_replies_yields_none() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();

        let mut session = DiscoverySession::new(quick_config(target));
        assert_eq!(session.state(), DiscoveryState::Idle);

        let result = session.run().await.unwrap();
        assert_eq!(result, None);
        assert_eq!(session.state(), DiscoveryState::Done);
        assert!(session.candidates().is_empty());

        // One probe per search target reached the destination
        let mut buf = [0u8; 512];
        for target in SEARCH_TARGETS {
            let (len, _) = silent.recv_from(&mut buf).await.unwrap();
            let request = std::str::from_utf8(&buf[..len]).unwrap();
            assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
            assert!(request.contains(&format!("ST: {target}\r\n")));
        }
    }

    #[tokio::test]
    async fn test_spawned_discovery_reports_none() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();

        let (tx, rx) = oneshot::channel();
        let _handle = spawn_discover_igd(quick_config(target), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), None);
    }

    /// Serve `body` to every connection
    async fn serve_description(body: String) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://127.0.0.1:{port}/igd.xml")
    }

    #[tokio::test]
    async fn test_description_keeps_one_byte_less_than_capacity() {
        let service = format!(
            "<service><serviceType>{WANIP}</serviceType><controlURL>/ctl</controlURL></service>"
        );
        let padding = " ".repeat(DESCRIPTION_BUFFER_SIZE - "<root>".len() - service.len());
        let body = format!("<root>{padding}{service}");
        assert_eq!(body.len(), DESCRIPTION_BUFFER_SIZE);
        let url = serve_description(body).await;

        // The closing '>' of </service> is the dropped byte, so nothing commits
        let config = DiscoveryConfig::default();
        let soap = SoapClient::new(config.command.clone());
        let described = describe(&url, &config, &soap).await.unwrap();
        assert_eq!(described.data.connection, IgdService::default());
        assert!(described.control_url.is_empty());
        assert!(!described.is_connected);

        let config = DiscoveryConfig {
            description_capacity: DESCRIPTION_BUFFER_SIZE + 1,
            ..DiscoveryConfig::default()
        };
        let described = describe(&url, &config, &soap).await.unwrap();
        assert_eq!(described.data.connection.control_url, "/ctl");
        assert_eq!(described.service_type, WANIP);
    }

    #[tokio::test]
    async fn test_search_moves_on_after_reply() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();
        let dead_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            for _ in SEARCH_TARGETS {
                let (_, from) = responder.recv_from(&mut buf).await.unwrap();
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nLOCATION: http://127.0.0.1:{dead_port}/igd.xml\r\nST: upnp:rootdevice\r\n\r\n"
                );
                responder.send_to(reply.as_bytes(), from).await.unwrap();
            }
        });

        let mut config = quick_config(target);
        config.probe_timeout = Duration::from_millis(500);
        config.description_timeout = Duration::from_secs(2);

        let started = Instant::now();
        let device = discover_igd(config).await.unwrap();
        let elapsed = started.elapsed();
        assert!(device.is_some());
        assert!(
            elapsed < Duration::from_secs(1),
            "search took {elapsed:?} with an instant responder"
        );
    }

    #[tokio::test]
    async fn test_unreachable_candidate_is_kept_as_last_resort() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();
        // Bind then drop to get a port nothing listens on
        let dead_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            let reply = format!(
                "HTTP/1.1 200 OK\r\nLOCATION: http://127.0.0.1:{dead_port}/igd.xml\r\nST: upnp:rootdevice\r\n\r\n"
            );
            responder.send_to(reply.as_bytes(), from).await.unwrap();
            // A second, malformed reply is dropped
            responder.send_to(b"garbage", from).await.unwrap();
        });

        let mut config = quick_config(target);
        config.probe_timeout = Duration::from_millis(200);
        config.description_timeout = Duration::from_secs(2);

        let device = discover_igd(config).await.unwrap().unwrap();
        assert_eq!(device.control_url, "");
        assert_eq!(device.service_type, "");
    }

    #[tokio::test]
    async fn test_family_mismatch_rejected() {
        let config = DiscoveryConfig {
            bind_addr: Some(Ipv4Addr::LOCALHOST.into()),
            ssdp_target: Some("[::1]:1900".parse().unwrap()),
            ..DiscoveryConfig::default()
        };
        let result = DiscoverySession::new(config).run().await;
        assert!(matches!(
            result,
            Err(DiscoveryError::UnsupportedAddressFamily)
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_aborts() {
        // TEST-NET-1 is never assigned to a local interface
        let config = DiscoveryConfig {
            bind_addr: Some("192.0.2.1".parse().unwrap()),
            probe_timeout: Duration::from_millis(10),
            ..DiscoveryConfig::default()
        };
        let result = DiscoverySession::new(config).run().await;
        assert!(matches!(result, Err(DiscoveryError::Socket(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_interface_index() {
        assert_eq!(interface_index("3"), Some(3));
        assert_eq!(interface_index("no-such-interface0"), None);
        assert!(interface_index("lo").is_some());
    }
}
