//! SSH handler for individual connections.
//!
//! Password authentication against the account store, `direct-tcpip`
//! channels only. A session record is created lazily on the first channel
//! open and torn down (sockets closed, metering flushed, record removed)
//! when the transport drops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::net::TcpStream;

use crate::error::GatewayError;
use crate::session::{finish_session, run_session_pumps, SessionRegistry, TunnelSession};
use crate::store::{Account, AccountStore};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler for a single SSH connection.
pub struct SshHandler {
    store: Arc<AccountStore>,
    sessions: Arc<SessionRegistry>,
    peer_addr: Option<SocketAddr>,
    /// Set by successful password auth.
    account: Option<Account>,
    /// Created on first channel open; shared by every channel on this
    /// connection.
    session: Option<Arc<TunnelSession>>,
}

impl SshHandler {
    pub fn new(
        store: Arc<AccountStore>,
        sessions: Arc<SessionRegistry>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            store,
            sessions,
            peer_addr,
            account: None,
            session: None,
        }
    }

    /// The connection's session, created on first use.
    async fn session(&mut self, account: &Account) -> Arc<TunnelSession> {
        if let Some(ref session) = self.session {
            return session.clone();
        }
        let session = self.sessions.open(account, self.peer_addr).await;
        self.session = Some(session.clone());
        session
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = GatewayError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.store.authenticate(user, password).await {
            Ok(account) => {
                self.account = Some(account);
                Ok(Auth::Accept)
            }
            Err(e) => {
                info!("Password auth rejected: {}", e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Rejecting public key auth attempt for '{}'", user);
        Ok(Auth::Reject {
            proceed_with_methods: Some(russh::MethodSet::PASSWORD),
        })
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(ref account) = self.account {
            info!(
                "Authentication succeeded for '{}' from {:?}",
                account.username, self.peer_addr
            );
        }
        Ok(())
    }

    /// Interactive sessions (shell, exec, sftp) are not offered.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Rejecting session channel {:?}", channel.id());
        Ok(false)
    }

    /// Reverse port forwarding is not offered.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Rejecting tcpip-forward for {}:{}", address, port);
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(account) = self.account.clone() else {
            warn!("direct-tcpip before authentication, rejecting");
            return Ok(false);
        };

        let target = format!("{}:{}", host_to_connect, port_to_connect);
        debug!(
            "direct-tcpip {} -> {} (originator {}:{})",
            account.username, target, originator_address, originator_port
        );

        let upstream =
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target.as_str())).await {
                Ok(Ok(upstream)) => upstream,
                Ok(Err(e)) => {
                    warn!("Dial to '{}' failed: {}", target, e);
                    return Ok(false);
                }
                Err(_) => {
                    warn!("Dial to '{}' failed: connect timed out", target);
                    return Ok(false);
                }
            };

        let session = self.session(&account).await;
        tokio::spawn(run_session_pumps(channel.into_stream(), upstream, session));
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel {:?} closed", channel);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("EOF on channel {:?}", channel);
        Ok(())
    }
}

impl Drop for SshHandler {
    /// The transport is gone: close every peer socket, flush metering, drop
    /// the session record.
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.close_both();

        let sessions = self.sessions.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            finish_session(&sessions, &store, session.id).await;
        });
    }
}
