//! # natter traversal
//!
//! Best-effort NAT traversal for peer-to-peer transports.
//!
//! This crate provides:
//! - UPnP Internet Gateway Device discovery (SSDP + HTTP + XML)
//! - IGD control over SOAP: external address, port mappings
//! - STUN Binding Requests for server reflexive address discovery
//!
//! Both mechanisms are opportunistic. Finding no gateway, or getting no STUN
//! reply, are ordinary outcomes and are reported as such rather than as
//! errors.
//!
//! Every operation is an `async fn`. Most also come in a `spawn_*` flavour
//! that runs in the background, reports through a callback and returns an
//! [`OperationHandle`]; dropping the handle cancels the operation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use natter_traversal::nat::StunClient;
//! use natter_traversal::upnp::{DiscoveryConfig, SoapClient, discover_igd};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! if let Some(igd) = discover_igd(DiscoveryConfig::default()).await? {
//!     let ip = SoapClient::default()
//!         .get_external_ip(&igd.control_url, &igd.service_type)
//!         .await?;
//!     println!("gateway says {ip}");
//! }
//!
//! let stun = StunClient::bind("0.0.0.0:0").await?;
//! let mapped = stun
//!     .get_mapped_address("stun.l.google.com", 19302, Duration::from_secs(5))
//!     .await?;
//! println!("STUN says {mapped}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod nat;
pub mod task;
pub mod upnp;

// Re-export commonly used types
pub use nat::{MappedAddress, StunClient, StunError, stun_request};
pub use task::OperationHandle;
pub use upnp::{
    DiscoveryConfig, DiscoveryError, IgdDevice, PortMappingRequest, Protocol, SoapClient,
    SoapError, discover_igd, spawn_discover_igd,
};
