//! First-byte protocol multiplexer for the public port.
//!
//! SOCKS5 clients lead with `0x05`; SSH clients send their identification
//! string (`SSH-2.0-...`) unsolicited. One sniffed byte decides the backend;
//! clients that stay silent past the grace period are assumed to be SSH.

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

/// Grace period for the first client byte.
const SNIFF_TIMEOUT: Duration = Duration::from_millis(300);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_FIRST_BYTE: u8 = 0x05;

/// Public-port listener that routes each connection to the internal SSH or
/// SOCKS5 gateway. Stateless; authentication happens behind it.
pub struct MuxListener {
    listener: TcpListener,
    ssh_addr: SocketAddr,
    socks_addr: SocketAddr,
}

impl MuxListener {
    pub async fn bind(
        addr: SocketAddr,
        ssh_addr: SocketAddr,
        socks_addr: SocketAddr,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Protocol multiplexer listening on {} (ssh={}, socks={})",
            listener.local_addr()?,
            ssh_addr,
            socks_addr
        );
        Ok(Self {
            listener,
            ssh_addr,
            socks_addr,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and route connections until shutdown fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Mux accept error: {}", e);
                        continue;
                    }
                },
            };

            let ssh_addr = self.ssh_addr;
            let socks_addr = self.socks_addr;
            tokio::spawn(async move {
                if let Err(e) = route(stream, ssh_addr, socks_addr).await {
                    warn!("Mux connection from {} ended: {}", peer, e);
                }
            });
        }
        debug!("Protocol multiplexer stopped");
    }
}

/// Sniff, dial, replay, splice.
async fn route(
    mut client: TcpStream,
    ssh_addr: SocketAddr,
    socks_addr: SocketAddr,
) -> Result<(), GatewayError> {
    let mut first = [0u8; 1];
    let sniffed = match tokio::time::timeout(SNIFF_TIMEOUT, client.read(&mut first)).await {
        // Closed before sending anything.
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(_)) => Some(first[0]),
        Ok(Err(e)) => return Err(e.into()),
        // Silent client; assume SSH.
        Err(_) => None,
    };

    let backend = match sniffed {
        Some(SOCKS_FIRST_BYTE) => socks_addr,
        _ => ssh_addr,
    };
    debug!("Mux routing first byte {:?} to {}", sniffed, backend);

    let mut upstream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(backend))
        .await
        .map_err(|_| GatewayError::Dial(backend.to_string(), "connect timed out".to_string()))?
        .map_err(|e| GatewayError::Dial(backend.to_string(), e.to_string()))?;

    if let Some(byte) = sniffed {
        upstream.write_all(&[byte]).await?;
    }

    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that records everything it receives from one connection and
    /// replies with a marker first.
    async fn spawn_capture_backend(marker: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(marker).await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });
        (addr, handle)
    }

    async fn mux_on_loopback(
        ssh_addr: SocketAddr,
        socks_addr: SocketAddr,
    ) -> (SocketAddr, CancellationToken) {
        let mux = MuxListener::bind("127.0.0.1:0".parse().unwrap(), ssh_addr, socks_addr)
            .await
            .unwrap();
        let addr = mux.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(mux.run(shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_socks_byte_routes_to_socks_backend() {
        let (ssh_addr, _ssh) = spawn_capture_backend(b"ssh").await;
        let (socks_addr, socks) = spawn_capture_backend(b"socks").await;
        let (mux_addr, shutdown) = mux_on_loopback(ssh_addr, socks_addr).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let mut marker = [0u8; 5];
        client.read_exact(&mut marker).await.unwrap();
        assert_eq!(&marker, b"socks");

        client.shutdown().await.unwrap();
        // The backend saw the sniffed byte exactly once, in order.
        assert_eq!(socks.await.unwrap(), vec![0x05, 0x01, 0x02]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_ssh_banner_routes_to_ssh_backend() {
        let (ssh_addr, ssh) = spawn_capture_backend(b"ssh").await;
        let (socks_addr, _socks) = spawn_capture_backend(b"socks").await;
        let (mux_addr, shutdown) = mux_on_loopback(ssh_addr, socks_addr).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        client.write_all(b"SSH-2.0-client\r\n").await.unwrap();

        let mut marker = [0u8; 3];
        client.read_exact(&mut marker).await.unwrap();
        assert_eq!(&marker, b"ssh");

        client.shutdown().await.unwrap();
        assert_eq!(ssh.await.unwrap(), b"SSH-2.0-client\r\n".to_vec());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_silent_client_falls_through_to_ssh() {
        let (ssh_addr, ssh) = spawn_capture_backend(b"ssh").await;
        let (socks_addr, _socks) = spawn_capture_backend(b"socks").await;
        let (mux_addr, shutdown) = mux_on_loopback(ssh_addr, socks_addr).await;

        let mut client = TcpStream::connect(mux_addr).await.unwrap();
        // Say nothing; the grace period decides.
        let mut marker = [0u8; 3];
        client.read_exact(&mut marker).await.unwrap();
        assert_eq!(&marker, b"ssh");

        // The late first byte still arrives, exactly once.
        client.write_all(b"late").await.unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(ssh.await.unwrap(), b"late".to_vec());
        shutdown.cancel();
    }
}
