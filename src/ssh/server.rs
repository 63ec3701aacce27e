//! SSH server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use russh::server::{Handler, Server};
use tokio_util::sync::CancellationToken;

use super::SshHandler;
use crate::error::GatewayError;
use crate::session::SessionRegistry;
use crate::store::AccountStore;

/// The main SSH server that creates handlers for each connection.
#[derive(Clone)]
pub struct SshGateway {
    store: Arc<AccountStore>,
    sessions: Arc<SessionRegistry>,
}

impl SshGateway {
    pub fn new(store: Arc<AccountStore>, sessions: Arc<SessionRegistry>) -> Self {
        Self { store, sessions }
    }

    /// Server configuration: password auth only, standard identification.
    pub fn server_config(host_key: russh_keys::PrivateKey) -> russh::server::Config {
        russh::server::Config {
            methods: russh::MethodSet::PASSWORD,
            server_id: russh::SshId::Standard("SSH-2.0-muxtun".to_string()),
            keys: vec![host_key],
            inactivity_timeout: Some(Duration::from_secs(1800)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        }
    }

    /// Serve until shutdown fires or the listener fails.
    pub async fn run(
        mut self,
        config: Arc<russh::server::Config>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), GatewayError> {
        info!("SSH gateway listening on {}", addr);
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("SSH gateway stopped");
                Ok(())
            }
            res = self.run_on_address(config, addr) => res.map_err(Into::into),
        }
    }
}

impl Server for SshGateway {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!("New SSH connection from {:?}", peer_addr);
        SshHandler::new(self.store.clone(), self.sessions.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        match error {
            GatewayError::AuthFailed(_) => info!("{}", error),
            _ => error!("SSH session error: {:?}", error),
        }
    }
}
