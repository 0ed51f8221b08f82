//! STUN based address discovery
//!
//! - [`stun`]: Binding Request encoder and response decoder
//! - [`client`]: sends a request to a STUN server and awaits the mapped address
//!
//! # Example
//!
//! ```rust,no_run
//! use natter_traversal::nat::StunClient;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), natter_traversal::nat::StunError> {
//! let client = StunClient::bind("0.0.0.0:0").await?;
//! let mapped = client
//!     .get_mapped_address("stun.l.google.com", 19302, Duration::from_secs(5))
//!     .await?;
//! println!("reachable at {mapped}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod stun;

// Re-exports
pub use client::{StunClient, StunRequest, resolve_ipv4, stun_request};
pub use stun::{
    MappedAddress, StunAttribute, StunError, StunHeader, StunMessageClass, decode_response,
    encode_binding_request,
};
