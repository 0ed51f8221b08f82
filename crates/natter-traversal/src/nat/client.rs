//! STUN client driver
//!
//! Resolves the STUN server, sends one Binding Request and decodes the reply.
//! There is no retransmission: timeout policy belongs to the caller, either
//! through [`StunClient::get_mapped_address`] or by wrapping
//! [`StunRequest::response`] in `tokio::time::timeout`.
//!
//! A [`StunRequest`] only accepts datagrams carrying its own transaction id.
//! Run one request at a time per socket; concurrent requests on a shared
//! socket would consume each other's replies.

use super::stun::{HEADER_SIZE, MappedAddress, StunError, StunHeader, decode_response};
use crate::task::OperationHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Receive buffer size for STUN replies
const RECV_BUFFER_SIZE: usize = 1500;

/// Resolve `server` to its first IPv4 address
///
/// # Errors
///
/// Returns [`StunError::Resolve`] when lookup fails or yields no IPv4 address.
pub async fn resolve_ipv4(server: &str, port: u16) -> Result<SocketAddr, StunError> {
    let addrs = tokio::net::lookup_host((server, port)).await.map_err(|e| {
        debug!("Failed to resolve STUN server {}: {}", server, e);
        StunError::Resolve(server.to_string())
    })?;

    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StunError::Resolve(server.to_string()))
}

/// STUN client for server reflexive address discovery
#[derive(Debug, Clone)]
pub struct StunClient {
    socket: Arc<UdpSocket>,
}

impl StunClient {
    /// Bind a new STUN client to a local address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound
    pub async fn bind(addr: &str) -> Result<Self, StunError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(Arc::new(socket)))
    }

    /// Use an existing socket, typically the one a transport already listens on
    #[must_use]
    pub fn from_socket(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    /// Get local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined
    pub fn local_addr(&self) -> Result<SocketAddr, StunError> {
        Ok(self.socket.local_addr()?)
    }

    /// Resolve `server` and send a Binding Request to it
    ///
    /// # Errors
    ///
    /// Returns an error if resolution or the send fails
    pub async fn request(&self, server: &str, port: u16) -> Result<StunRequest, StunError> {
        let server = resolve_ipv4(server, port).await?;
        self.request_to(server).await
    }

    /// Send a Binding Request to an already resolved server
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails
    pub async fn request_to(&self, server: SocketAddr) -> Result<StunRequest, StunError> {
        let header = StunHeader::binding_request();
        self.socket.send_to(&header.encode(), server).await?;
        debug!("Sent STUN Binding Request to {}", server);

        Ok(StunRequest {
            socket: self.socket.clone(),
            server,
            transaction_id: header.transaction_id,
        })
    }

    /// Get mapped address from STUN server
    ///
    /// # Errors
    ///
    /// Returns `StunError` if:
    /// - the server name does not resolve
    /// - network I/O fails
    /// - the server doesn't respond within `timeout`
    /// - the response has no usable mapped address
    pub async fn get_mapped_address(
        &self,
        server: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<MappedAddress, StunError> {
        tokio::time::timeout(timeout, async {
            let request = self.request(server, port).await?;
            request.response().await
        })
        .await
        .map_err(|_| {
            info!("No STUN reply from {}:{} within {:?}", server, port, timeout);
            StunError::Timeout
        })?
    }
}

/// An outstanding Binding Request
#[derive(Debug)]
pub struct StunRequest {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    transaction_id: [u32; 3],
}

impl StunRequest {
    /// Server the request was sent to
    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Transaction id of the request
    #[must_use]
    pub fn transaction_id(&self) -> [u32; 3] {
        self.transaction_id
    }

    /// Wait for the matching reply and decode its mapped address
    ///
    /// Datagrams that are not STUN, or carry another transaction id, are
    /// logged and skipped. Waits indefinitely; apply a timeout around it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the socket or the decode error of the
    /// matching reply.
    pub async fn response(&self) -> Result<MappedAddress, StunError> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            let packet = &buf[..len];

            match StunHeader::decode(packet) {
                Ok(header) if header.transaction_id == self.transaction_id => {
                    let result = decode_response(packet);
                    match &result {
                        Ok(mapped) => debug!("STUN server {} reports {}", from, mapped),
                        Err(e) => info!("Unusable STUN reply from {}: {}", from, e),
                    }
                    return result;
                }
                Ok(_) => debug!("Ignoring STUN packet from {} for another transaction", from),
                Err(e) => debug!(
                    "Ignoring {} byte datagram from {} (header {} bytes): {}",
                    len, from, HEADER_SIZE, e
                ),
            }
        }
    }

    /// Await the reply in the background and pass it to `on_result`
    pub fn spawn<C>(self, on_result: C) -> OperationHandle
    where
        C: FnOnce(Result<MappedAddress, StunError>) + Send + 'static,
    {
        OperationHandle::spawn(async move { self.response().await }, on_result)
    }
}

/// Send a Binding Request from `socket` to `server:port` and report the
/// mapped address to `on_result`
///
/// Resolution, send and receive all run in the background. Dropping the
/// returned handle cancels the request.
pub fn stun_request<C>(
    socket: Arc<UdpSocket>,
    server: impl Into<String>,
    port: u16,
    on_result: C,
) -> OperationHandle
where
    C: FnOnce(Result<MappedAddress, StunError>) + Send + 'static,
{
    let server = server.into();
    OperationHandle::spawn(
        async move {
            let request = StunClient::from_socket(socket)
                .request(&server, port)
                .await?;
            request.response().await
        },
        on_result,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::stun::tests::{response, xor_value};
    use crate::nat::stun::ATTR_XOR_MAPPED_ADDRESS;
    use std::net::Ipv4Addr;
    use tokio::sync::oneshot;

    /// Answer the first Binding Request with `mapped`, after sending some noise.
    async fn fake_server(mapped: SocketAddr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let request = StunHeader::decode(&buf[..len]).unwrap();

            // Not STUN at all
            socket.send_to(b"hello", from).await.unwrap();
            // STUN, wrong transaction
            let other = response([0xdead, 0, 0], &[]);
            socket.send_to(&other, from).await.unwrap();

            let SocketAddr::V4(v4) = mapped else {
                unreachable!()
            };
            let reply = response(
                request.transaction_id,
                &[(ATTR_XOR_MAPPED_ADDRESS, xor_value(*v4.ip(), v4.port()))],
            );
            socket.send_to(&reply, from).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_mapped_address_from_fake_server() {
        let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let server = fake_server(mapped).await;

        let client = StunClient::bind("127.0.0.1:0").await.unwrap();
        let request = client.request_to(server).await.unwrap();
        assert_eq!(request.server(), server);

        let got = request.response().await.unwrap();
        assert_eq!(got.socket_addr(), mapped);
    }

    #[tokio::test]
    async fn test_stun_request_callback() {
        let mapped: SocketAddr = "198.51.100.9:1234".parse().unwrap();
        let server = fake_server(mapped).await;
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let (tx, rx) = oneshot::channel();
        let handle = stun_request(socket, "127.0.0.1", server.port(), move |result| {
            let _ = tx.send(result);
        });

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.ipv4, Ipv4Addr::new(198, 51, 100, 9));
        assert_eq!(got.port, 1234);
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_when_server_silent() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = StunClient::bind("127.0.0.1:0").await.unwrap();
        let result = client
            .get_mapped_address("127.0.0.1", port, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(StunError::Timeout)));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve_ipv4("127.0.0.1", 3478).await.unwrap();
        assert_eq!(addr, "127.0.0.1:3478".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_ipv6_only_literal_fails() {
        assert!(matches!(
            resolve_ipv4("::1", 3478).await,
            Err(StunError::Resolve(_))
        ));
    }
}
