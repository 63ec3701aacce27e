//! SOCKS5 gateway (RFC 1928 + RFC 1929 subset).
//!
//! Username/password is the only accepted method and CONNECT the only
//! accepted command. Authentication goes through the shared account store
//! and established tunnels are metered like SSH forwards.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::session::{finish_session, run_session_pumps, SessionRegistry};
use crate::store::{Account, AccountStore};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_USERPASS: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Greeting plus auth subnegotiation must finish within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 server bound to the internal gateway port.
pub struct SocksGateway {
    store: Arc<AccountStore>,
    sessions: Arc<SessionRegistry>,
    listener: TcpListener,
}

impl SocksGateway {
    pub async fn bind(
        store: Arc<AccountStore>,
        sessions: Arc<SessionRegistry>,
        addr: SocketAddr,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 gateway listening on {}", listener.local_addr()?);
        Ok(Self {
            store,
            sessions,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("SOCKS5 accept error: {}", e);
                        continue;
                    }
                },
            };

            debug!("SOCKS5 connection from {}", peer);
            let store = self.store.clone();
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_socks(stream, Some(peer), store, sessions).await {
                    match e {
                        GatewayError::AuthFailed(_) => info!("{}", e),
                        _ => warn!("SOCKS5 connection from {} ended: {}", peer, e),
                    }
                }
            });
        }
        debug!("SOCKS5 gateway stopped");
    }
}

/// Drive one SOCKS5 connection end to end. Generic over the stream so the
/// handshake machinery is testable without a listener.
pub(crate) async fn handle_socks<S>(
    mut stream: S,
    peer: Option<SocketAddr>,
    store: Arc<AccountStore>,
    sessions: Arc<SessionRegistry>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let account = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        greet(&mut stream).await?;
        authenticate(&mut stream, &store).await
    })
    .await
    .map_err(|_| GatewayError::Protocol("handshake deadline exceeded".to_string()))??;

    let target = read_connect_request(&mut stream).await?;

    let upstream =
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target.as_str())).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                send_reply(&mut stream, REP_GENERAL_FAILURE).await?;
                return Err(GatewayError::Dial(target, e.to_string()));
            }
            Err(_) => {
                send_reply(&mut stream, REP_GENERAL_FAILURE).await?;
                return Err(GatewayError::Dial(target, "connect timed out".to_string()));
            }
        };

    send_reply(&mut stream, REP_SUCCESS).await?;
    debug!("SOCKS5 '{}' connected to {}", account.username, target);

    let session = sessions.open(&account, peer).await;
    let session_id = session.id;
    run_session_pumps(stream, upstream, session).await;
    finish_session(&sessions, &store, session_id).await;

    Ok(())
}

/// Method negotiation: require username/password.
async fn greet<S>(stream: &mut S) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(GatewayError::Protocol(format!(
            "unsupported SOCKS version {:#04x}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_USERPASS) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Err(GatewayError::Protocol(
            "client does not offer username/password auth".to_string(),
        ));
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_USERPASS]).await?;
    Ok(())
}

/// RFC 1929 subnegotiation against the account store.
async fn authenticate<S>(stream: &mut S, store: &AccountStore) -> Result<Account, GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != AUTH_VERSION {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        return Err(GatewayError::Protocol(format!(
            "unsupported auth version {:#04x}",
            header[0]
        )));
    }

    let mut username = vec![0u8; header[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username).into_owned();
    let password = String::from_utf8_lossy(&password).into_owned();

    if username.is_empty() {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        return Err(GatewayError::Protocol("empty username".to_string()));
    }

    match store.authenticate(&username, &password).await {
        Ok(account) => {
            stream.write_all(&[AUTH_VERSION, 0x00]).await?;
            Ok(account)
        }
        Err(e) => {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            Err(e)
        }
    }
}

/// Parse the CONNECT request; returns the dial target as `host:port`.
async fn read_connect_request<S>(stream: &mut S) -> Result<String, GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(GatewayError::Protocol(format!(
            "unsupported request version {:#04x}",
            header[0]
        )));
    }
    if header[1] != CMD_CONNECT {
        send_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(GatewayError::Protocol(format!(
            "unsupported command {:#04x}",
            header[1]
        )));
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::IpAddr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            format!("[{}]", std::net::IpAddr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                send_reply(stream, REP_GENERAL_FAILURE).await?;
                return Err(GatewayError::Protocol("empty domain name".to_string()));
            }
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8_lossy(&domain).into_owned()
        }
        other => {
            send_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(GatewayError::Protocol(format!(
                "unsupported address type {:#04x}",
                other
            )));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    Ok(format!("{}:{}", host, port))
}

/// Reply with the given code; the bound address field is always zeroed.
async fn send_reply<S>(stream: &mut S, rep: u8) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
