//! UPnP Internet Gateway Device support
//!
//! - [`xml`]: event-driven XML scanner used by both parsers below
//! - [`igd`]: device description and SOAP reply parsers
//! - [`ssdp`]: M-SEARCH datagrams and reply headers
//! - [`http`]: the small slice of HTTP/1.1 UPnP devices need
//! - [`soap`]: SOAP envelopes and the command client
//! - [`commands`]: typed IGD actions (external address, port mappings)
//! - [`discover`]: finds and ranks gateways on the local network
//!
//! # Example
//!
//! ```rust,no_run
//! use natter_traversal::upnp::{DiscoveryConfig, PortMappingRequest, Protocol, SoapClient, discover_igd};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let Some(igd) = discover_igd(DiscoveryConfig::default()).await? else {
//!     return Ok(());
//! };
//!
//! let client = SoapClient::default();
//! let external = client.get_external_ip(&igd.control_url, &igd.service_type).await?;
//! println!("external address {external}");
//!
//! let request = PortMappingRequest::new(4000, 4000, "192.168.1.20", Protocol::Udp);
//! client
//!     .add_port_mapping(&igd.control_url, &igd.service_type, &request)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod discover;
pub mod http;
pub mod igd;
pub mod soap;
pub mod ssdp;
pub mod xml;

// Re-exports
pub use commands::{ConnectionStatus, PortMappingEntry, PortMappingRequest, Protocol};
pub use discover::{
    DiscoveryConfig, DiscoveryError, DiscoveryState, DiscoverySession, IgdDevice, UpnpDevice,
    discover_igd, select_device, spawn_discover_igd,
};
pub use http::HttpError;
pub use igd::{IgdData, IgdService, NameValueList};
pub use soap::{CommandConfig, SoapClient, SoapError, UpnpErrorCode};
