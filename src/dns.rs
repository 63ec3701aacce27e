//! DNS zone dispatcher.
//!
//! Forwards queries whose first question name falls under a configured zone
//! to that zone's tunnel backend, verbatim in both directions. Everything
//! else is dropped without a reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

/// Deadline for one query/response exchange with a backend.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Large enough for any EDNS datagram.
const MAX_DATAGRAM: usize = 64 * 1024;

/// One `(zone suffix, backend)` pair. The suffix is always a lowercased
/// fully-qualified name ending in `.`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRoute {
    pub suffix: String,
    pub backend: SocketAddr,
}

/// Ordered route table; lookup is first-suffix-match in input order.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<ZoneRoute>,
}

/// Trim, lowercase, and terminate a zone name with the root dot.
fn normalize_zone(zone: &str) -> String {
    let mut suffix = zone.trim().to_ascii_lowercase();
    if !suffix.ends_with('.') {
        suffix.push('.');
    }
    suffix
}

impl RouteTable {
    /// Build a table from parallel zone and backend lists.
    ///
    /// The backend list must contain either a single entry (shared by every
    /// zone) or exactly one entry per zone, paired in input order.
    pub fn new(zones: &[String], backends: &[SocketAddr]) -> Result<Self, GatewayError> {
        if zones.is_empty() {
            return Err(GatewayError::Config("DNS zone list is empty".to_string()));
        }
        if backends.is_empty() {
            return Err(GatewayError::Config(
                "DNS backend list is empty".to_string(),
            ));
        }
        if backends.len() != 1 && backends.len() != zones.len() {
            return Err(GatewayError::Config(format!(
                "DNS backend count must be 1 or match the zone count ({} zones, {} backends)",
                zones.len(),
                backends.len()
            )));
        }

        let routes = zones
            .iter()
            .enumerate()
            .map(|(i, zone)| ZoneRoute {
                suffix: normalize_zone(zone),
                backend: if backends.len() == 1 {
                    backends[0]
                } else {
                    backends[i]
                },
            })
            .collect();

        Ok(Self { routes })
    }

    /// First route whose suffix ends the (lowercased, dot-terminated)
    /// question name.
    pub fn resolve(&self, question_name: &str) -> Option<&ZoneRoute> {
        let name = normalize_zone(question_name);
        self.routes.iter().find(|r| name.ends_with(&r.suffix))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// UDP server dispatching matching queries to tunnel backends.
pub struct DnsDispatcher {
    table: Arc<RouteTable>,
    socket: Arc<UdpSocket>,
}

impl DnsDispatcher {
    pub async fn bind(table: RouteTable, addr: SocketAddr) -> Result<Self, GatewayError> {
        let socket = UdpSocket::bind(addr).await?;
        info!(
            "DNS dispatcher listening on {} ({} zones)",
            socket.local_addr()?,
            table.len()
        );
        Ok(Self {
            table: Arc::new(table),
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until shutdown fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, client) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("DNS recv error: {}", e);
                        continue;
                    }
                },
            };

            let Some(backend) = self.route_for(&buf[..len]) else {
                continue;
            };

            let query = buf[..len].to_vec();
            let socket = self.socket.clone();
            tokio::spawn(async move {
                if let Err(e) = exchange(socket, client, backend, query).await {
                    debug!("DNS exchange with {} failed: {}", backend, e);
                }
            });
        }
        debug!("DNS dispatcher stopped");
    }

    /// Backend for an inbound datagram, or None when it should be dropped.
    fn route_for(&self, wire: &[u8]) -> Option<SocketAddr> {
        let message = match Message::from_vec(wire) {
            Ok(m) => m,
            Err(e) => {
                debug!("Dropping undecodable DNS message: {}", e);
                return None;
            }
        };
        let question = message.queries().first()?;
        let name = question.name().to_ascii();
        let route = self.table.resolve(&name)?;
        debug!("DNS '{}' -> {}", name, route.backend);
        Some(route.backend)
    }
}

/// Forward one query to a backend and relay its reply, both verbatim. The
/// transaction id survives because the whole wire message is passed through.
async fn exchange(
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    backend: SocketAddr,
    query: Vec<u8>,
) -> Result<(), GatewayError> {
    let upstream = UdpSocket::bind("0.0.0.0:0").await?;
    upstream.connect(backend).await?;
    upstream.send(&query).await?;

    let mut reply = vec![0u8; MAX_DATAGRAM];
    let len = tokio::time::timeout(EXCHANGE_TIMEOUT, upstream.recv(&mut reply))
        .await
        .map_err(|_| {
            GatewayError::Dial(backend.to_string(), "exchange deadline exceeded".to_string())
        })??;

    listener.send_to(&reply[..len], client).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn zones(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Minimal A-record query in wire format.
    fn encode_query(name: &str, id: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x00]); // flags: RD
        buf.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]); // one question
        for label in name.trim_end_matches('.').split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&[0, 1, 0, 1]); // QTYPE=A, QCLASS=IN
        buf
    }

    #[test]
    fn test_table_rejects_empty_zones() {
        let err = RouteTable::new(&[], &[backend(5300)]).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_table_rejects_empty_backends() {
        let err = RouteTable::new(&zones(&["t.example.com"]), &[]).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_table_rejects_count_mismatch() {
        let err = RouteTable::new(
            &zones(&["a.example.com", "b.example.com", "c.example.com"]),
            &[backend(5300), backend(5301)],
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_table_broadcasts_single_backend() {
        let table = RouteTable::new(
            &zones(&["a.example.com", "b.example.com"]),
            &[backend(5300)],
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.resolve("x.b.example.com.").unwrap().backend,
            backend(5300)
        );
    }

    #[test]
    fn test_table_pairs_backends_in_order() {
        let table = RouteTable::new(
            &zones(&["a.example.com", "b.example.com"]),
            &[backend(5300), backend(5301)],
        )
        .unwrap();
        assert_eq!(
            table.resolve("x.a.example.com.").unwrap().backend,
            backend(5300)
        );
        assert_eq!(
            table.resolve("x.b.example.com.").unwrap().backend,
            backend(5301)
        );
    }

    #[test]
    fn test_normalization() {
        let table = RouteTable::new(&zones(&["  T.Example.COM  "]), &[backend(5300)]).unwrap();
        assert!(table.resolve("x.t.example.com.").is_some());
        assert!(table.resolve("X.T.EXAMPLE.COM").is_some());
    }

    #[test]
    fn test_first_match_wins() {
        let table = RouteTable::new(
            &zones(&["deep.t.example.com", "t.example.com"]),
            &[backend(5300), backend(5301)],
        )
        .unwrap();
        // A name under both zones takes the first in input order.
        assert_eq!(
            table.resolve("x.deep.t.example.com.").unwrap().backend,
            backend(5300)
        );
        assert_eq!(
            table.resolve("x.t.example.com.").unwrap().backend,
            backend(5301)
        );
    }

    #[test]
    fn test_unrelated_name_has_no_route() {
        let table = RouteTable::new(&zones(&["t.example.com"]), &[backend(5300)]).unwrap();
        assert!(table.resolve("unrelated.test.").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_forwards_verbatim_and_relays_reply() {
        // Canned backend: capture the query, answer with a fixed payload.
        let backend_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_socket.local_addr().unwrap();
        let canned_reply = b"tunnel-reply".to_vec();
        let backend_task = tokio::spawn({
            let canned_reply = canned_reply.clone();
            async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let (len, from) = backend_socket.recv_from(&mut buf).await.unwrap();
                backend_socket.send_to(&canned_reply, from).await.unwrap();
                buf[..len].to_vec()
            }
        });

        let table = RouteTable::new(&zones(&["t.example.com"]), &[backend_addr]).unwrap();
        let dispatcher = DnsDispatcher::bind(table, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dispatcher_addr = dispatcher.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(dispatcher.run(shutdown.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = encode_query("x.t.example.com.", 0x1234);
        client.send_to(&query, dispatcher_addr).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("reply within deadline")
            .unwrap();
        assert_eq!(&buf[..len], canned_reply.as_slice());

        // The backend saw the query byte-for-byte.
        let forwarded = backend_task.await.unwrap();
        assert_eq!(forwarded, query);

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_drops_unmatched_silently() {
        let table = RouteTable::new(&zones(&["t.example.com"]), &[backend(1)]).unwrap();
        let dispatcher = DnsDispatcher::bind(table, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dispatcher_addr = dispatcher.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(dispatcher.run(shutdown.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&encode_query("unrelated.test.", 1), dispatcher_addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; 512];
        let timed_out = tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf))
            .await
            .is_err();
        assert!(timed_out);

        shutdown.cancel();
        server.await.unwrap();
    }
}
