//! Typed WANIPConnection / WANPPPConnection actions
//!
//! Each action builds its argument list, sends it through the
//! [`SoapClient`] and interprets the reply: an `errorCode` element becomes
//! [`SoapError::Upnp`], otherwise the expected output arguments are
//! extracted. Missing required inputs are rejected with
//! [`UpnpErrorCode::INVALID_ARGS`] before any I/O.

use super::igd::{NameValueList, bounded};
use super::soap::{SoapClient, SoapError, UpnpErrorCode};
use crate::task::OperationHandle;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Lease duration sent with every mapping (0 = until removed)
pub const LEASE_DURATION: &str = "0";

/// Description used when a mapping request has none
pub const DEFAULT_MAPPING_DESCRIPTION: &str = "natter";

/// Capacity of address fields in replies
const ADDRESS_FIELD_CAPACITY: usize = 128;

/// Capacity of port fields in replies (five digits)
const PORT_FIELD_CAPACITY: usize = 6;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// Wire spelling, `"TCP"` or `"UDP"`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(format!("unknown protocol: {s}"))
        }
    }
}

/// Port forwarding to install on the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingRequest {
    /// Port opened on the gateway's external interface
    pub external_port: u16,
    /// Port on the internal client
    pub internal_port: u16,
    /// Internal client IP address
    pub internal_client: String,
    /// Protocol
    pub protocol: Protocol,
    /// Human readable description, [`DEFAULT_MAPPING_DESCRIPTION`] when `None`
    pub description: Option<String>,
    /// Restrict to one remote host; `None` for any
    pub remote_host: Option<String>,
}

impl PortMappingRequest {
    /// Create a request for any remote host with the default description
    #[must_use]
    pub fn new(
        external_port: u16,
        internal_port: u16,
        internal_client: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            external_port,
            internal_port,
            internal_client: internal_client.into(),
            protocol,
            description: None,
            remote_host: None,
        }
    }

    /// Set the mapping description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Restrict the mapping to one remote host
    #[must_use]
    pub fn with_remote_host(mut self, remote_host: impl Into<String>) -> Self {
        self.remote_host = Some(remote_host.into());
        self
    }
}

/// Reply of `GetStatusInfo`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// `NewConnectionStatus`, e.g. `Connected` or `Disconnected`
    pub status: String,
    /// `NewLastConnectionError`
    pub last_connection_error: Option<String>,
    /// `NewUptime` in seconds, as reported
    pub uptime: Option<String>,
}

impl ConnectionStatus {
    /// Whether the WAN connection is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == "Connected"
    }
}

/// Reply of `GetSpecificPortMappingEntry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingEntry {
    /// Internal client the port is forwarded to
    pub internal_client: String,
    /// Internal port
    pub internal_port: u16,
}

/// Parse a reply and turn an `errorCode` into an error
fn check_reply(action: &str, raw: &[u8]) -> Result<NameValueList, SoapError> {
    let reply = NameValueList::parse(raw);
    match reply.error_code() {
        Some(code) => {
            warn!(
                "UPnP action {} failed with error {} ({})",
                action,
                code,
                UpnpErrorCode::describe(code)
            );
            Err(SoapError::Upnp(code))
        }
        None => Ok(reply),
    }
}

fn required<'a>(reply: &'a NameValueList, name: &str) -> Result<&'a str, SoapError> {
    reply.get(name).ok_or_else(|| {
        debug!("UPnP reply lacks {}", name);
        SoapError::Upnp(UpnpErrorCode::UNKNOWN_ERROR)
    })
}

impl SoapClient {
    /// `GetStatusInfo`: WAN connection state of the device
    ///
    /// # Errors
    ///
    /// Transport failures or the device's UPnP error code.
    pub async fn get_status_info(
        &self,
        control_url: &str,
        service_type: &str,
    ) -> Result<ConnectionStatus, SoapError> {
        let raw = self
            .send_command(control_url, service_type, "GetStatusInfo", &[])
            .await?;
        let reply = check_reply("GetStatusInfo", &raw)?;
        Ok(ConnectionStatus {
            status: reply.get("NewConnectionStatus").unwrap_or_default().to_string(),
            last_connection_error: reply.get("NewLastConnectionError").map(str::to_string),
            uptime: reply.get("NewUptime").map(str::to_string),
        })
    }

    /// `GetExternalIPAddress`: the gateway's public address
    ///
    /// # Errors
    ///
    /// Transport failures, the device's UPnP error code, or
    /// [`UpnpErrorCode::UNKNOWN_ERROR`] when the reply lacks the address.
    pub async fn get_external_ip(
        &self,
        control_url: &str,
        service_type: &str,
    ) -> Result<String, SoapError> {
        let raw = self
            .send_command(control_url, service_type, "GetExternalIPAddress", &[])
            .await?;
        let reply = check_reply("GetExternalIPAddress", &raw)?;
        let address = required(&reply, "NewExternalIPAddress")?;
        Ok(bounded(address.as_bytes(), ADDRESS_FIELD_CAPACITY))
    }

    /// `AddPortMapping`: install a forwarding with an infinite lease
    ///
    /// # Errors
    ///
    /// [`UpnpErrorCode::INVALID_ARGS`] for zero ports or an empty internal
    /// client, transport failures, or the device's UPnP error code.
    pub async fn add_port_mapping(
        &self,
        control_url: &str,
        service_type: &str,
        request: &PortMappingRequest,
    ) -> Result<(), SoapError> {
        if request.external_port == 0
            || request.internal_port == 0
            || request.internal_client.is_empty()
        {
            return Err(SoapError::Upnp(UpnpErrorCode::INVALID_ARGS));
        }

        let external_port = request.external_port.to_string();
        let internal_port = request.internal_port.to_string();
        let args = [
            ("NewRemoteHost", request.remote_host.as_deref().unwrap_or("")),
            ("NewExternalPort", external_port.as_str()),
            ("NewProtocol", request.protocol.as_str()),
            ("NewInternalPort", internal_port.as_str()),
            ("NewInternalClient", request.internal_client.as_str()),
            ("NewEnabled", "1"),
            (
                "NewPortMappingDescription",
                request
                    .description
                    .as_deref()
                    .unwrap_or(DEFAULT_MAPPING_DESCRIPTION),
            ),
            ("NewLeaseDuration", LEASE_DURATION),
        ];

        let raw = self
            .send_command(control_url, service_type, "AddPortMapping", &args)
            .await?;
        check_reply("AddPortMapping", &raw)?;
        debug!(
            "Mapped external {} port {} to {}:{}",
            request.protocol, request.external_port, request.internal_client, request.internal_port
        );
        Ok(())
    }

    /// `DeletePortMapping`: remove a forwarding
    ///
    /// # Errors
    ///
    /// [`UpnpErrorCode::INVALID_ARGS`] for a zero port, transport failures,
    /// or the device's UPnP error code.
    pub async fn delete_port_mapping(
        &self,
        control_url: &str,
        service_type: &str,
        external_port: u16,
        protocol: Protocol,
        remote_host: Option<&str>,
    ) -> Result<(), SoapError> {
        if external_port == 0 {
            return Err(SoapError::Upnp(UpnpErrorCode::INVALID_ARGS));
        }

        let external_port = external_port.to_string();
        let args = [
            ("NewRemoteHost", remote_host.unwrap_or("")),
            ("NewExternalPort", external_port.as_str()),
            ("NewProtocol", protocol.as_str()),
        ];

        let raw = self
            .send_command(control_url, service_type, "DeletePortMapping", &args)
            .await?;
        check_reply("DeletePortMapping", &raw)?;
        Ok(())
    }

    /// `GetSpecificPortMappingEntry`: where an external port is forwarded to
    ///
    /// # Errors
    ///
    /// [`UpnpErrorCode::INVALID_ARGS`] for a zero port, transport failures,
    /// the device's UPnP error code (714 when there is no such mapping), or
    /// [`UpnpErrorCode::UNKNOWN_ERROR`] for an incomplete reply.
    pub async fn get_specific_port_mapping_entry(
        &self,
        control_url: &str,
        service_type: &str,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<PortMappingEntry, SoapError> {
        if external_port == 0 {
            return Err(SoapError::Upnp(UpnpErrorCode::INVALID_ARGS));
        }

        let external_port = external_port.to_string();
        let args = [
            ("NewRemoteHost", ""),
            ("NewExternalPort", external_port.as_str()),
            ("NewProtocol", protocol.as_str()),
        ];

        let raw = self
            .send_command(
                control_url,
                service_type,
                "GetSpecificPortMappingEntry",
                &args,
            )
            .await?;
        let reply = check_reply("GetSpecificPortMappingEntry", &raw)?;

        let internal_client = bounded(
            required(&reply, "NewInternalClient")?.as_bytes(),
            ADDRESS_FIELD_CAPACITY,
        );
        let internal_port = bounded(
            required(&reply, "NewInternalPort")?.as_bytes(),
            PORT_FIELD_CAPACITY,
        )
        .parse()
        .map_err(|_| SoapError::Upnp(UpnpErrorCode::UNKNOWN_ERROR))?;

        Ok(PortMappingEntry {
            internal_client,
            internal_port,
        })
    }

    /// Background [`SoapClient::get_external_ip`]
    pub fn spawn_get_external_ip<C>(
        &self,
        control_url: impl Into<String>,
        service_type: impl Into<String>,
        on_result: C,
    ) -> OperationHandle
    where
        C: FnOnce(Result<String, SoapError>) + Send + 'static,
    {
        let client = self.clone();
        let control_url = control_url.into();
        let service_type = service_type.into();
        OperationHandle::spawn(
            async move { client.get_external_ip(&control_url, &service_type).await },
            on_result,
        )
    }

    /// Background [`SoapClient::add_port_mapping`]
    pub fn spawn_add_port_mapping<C>(
        &self,
        control_url: impl Into<String>,
        service_type: impl Into<String>,
        request: PortMappingRequest,
        on_result: C,
    ) -> OperationHandle
    where
        C: FnOnce(Result<(), SoapError>) + Send + 'static,
    {
        let client = self.clone();
        let control_url = control_url.into();
        let service_type = service_type.into();
        OperationHandle::spawn(
            async move {
                client
                    .add_port_mapping(&control_url, &service_type, &request)
                    .await
            },
            on_result,
        )
    }

    /// Background [`SoapClient::delete_port_mapping`]
    pub fn spawn_delete_port_mapping<C>(
        &self,
        control_url: impl Into<String>,
        service_type: impl Into<String>,
        external_port: u16,
        protocol: Protocol,
        remote_host: Option<String>,
        on_result: C,
    ) -> OperationHandle
    where
        C: FnOnce(Result<(), SoapError>) + Send + 'static,
    {
        let client = self.clone();
        let control_url = control_url.into();
        let service_type = service_type.into();
        OperationHandle::spawn(
            async move {
                client
                    .delete_port_mapping(
                        &control_url,
                        &service_type,
                        external_port,
                        protocol,
                        remote_host.as_deref(),
                    )
                    .await
            },
            on_result,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upnp::http::HttpError;

    const CTL: &str = "http://127.0.0.1:1/ctl";
    const WANIP: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("sctp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }

    #[test]
    fn test_request_builder() {
        let request = PortMappingRequest::new(4000, 5000, "192.168.1.20", Protocol::Tcp)
            .with_description("game")
            .with_remote_host("203.0.113.1");
        assert_eq!(request.description.as_deref(), Some("game"));
        assert_eq!(request.remote_host.as_deref(), Some("203.0.113.1"));
    }

    #[test]
    fn test_check_reply() {
        let err = check_reply(
            "AddPortMapping",
            b"<s:Fault><detail><UPnPError><errorCode>718</errorCode>\
              <errorDescription>ConflictInMappingEntry</errorDescription></UPnPError></detail></s:Fault>",
        )
        .unwrap_err();
        assert_eq!(err.code(), UpnpErrorCode::CONFLICT_IN_MAPPING);

        let err = check_reply("X", b"<errorCode>oops</errorCode>").unwrap_err();
        assert_eq!(err.code(), UpnpErrorCode::UNKNOWN_ERROR);

        assert!(check_reply("X", b"<ok>1</ok>").is_ok());
    }

    #[test]
    fn test_connection_status() {
        let status = ConnectionStatus {
            status: "Connected".into(),
            ..ConnectionStatus::default()
        };
        assert!(status.is_connected());
        assert!(!ConnectionStatus::default().is_connected());
    }

    #[tokio::test]
    async fn test_missing_arguments_rejected_without_io() {
        // CTL points at a port nothing listens on; a connection attempt would
        // surface as an HTTP error instead of 402.
        let client = SoapClient::default();
        for request in [
            PortMappingRequest::new(0, 5000, "10.0.0.2", Protocol::Udp),
            PortMappingRequest::new(4000, 0, "10.0.0.2", Protocol::Udp),
            PortMappingRequest::new(4000, 5000, "", Protocol::Udp),
        ] {
            let err = client.add_port_mapping(CTL, WANIP, &request).await.unwrap_err();
            assert_eq!(err.code(), UpnpErrorCode::INVALID_ARGS);
        }

        let err = client
            .delete_port_mapping(CTL, WANIP, 0, Protocol::Tcp, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), UpnpErrorCode::INVALID_ARGS);

        let err = client
            .get_specific_port_mapping_entry(CTL, WANIP, 0, Protocol::Tcp)
            .await
            .unwrap_err();
        assert_eq!(err.code(), UpnpErrorCode::INVALID_ARGS);
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_as_http_error() {
        let client = SoapClient::default();
        let err = client
            .get_external_ip("ftp://10.0.0.1/ctl", WANIP)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SoapError::Http(HttpError::UnsupportedScheme(_))
        ));
    }
}
