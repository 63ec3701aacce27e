//! Multi-protocol tunneling gateway.
//!
//! A single public TCP port demultiplexes SSH port-forwarding and SOCKS5
//! traffic, both authenticated against a shared account database with live
//! quota accounting. Alongside, UDP/53 queries for configured zones are
//! forwarded to external DNS tunnel backends.
//!
//! ## Usage
//! ```bash
//! MUXTUN_HOST_KEY=host_key.pem muxtun
//! ssh -N -L 8080:example.net:80 -p 2222 alice@gateway
//! curl --socks5 alice:secret@gateway:2222 http://example.net/
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use muxtun::config;
use muxtun::dns::{DnsDispatcher, RouteTable};
use muxtun::key::load_host_key;
use muxtun::mux::MuxListener;
use muxtun::session::{self, SessionRegistry};
use muxtun::socks::SocksGateway;
use muxtun::ssh::SshGateway;
use muxtun::store::AccountStore;

/// How long shutdown waits for tasks before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::init().context("invalid configuration")?;
    info!("Starting muxtun gateway...");

    let store = Arc::new(AccountStore::open(&config.db_path)?);
    let host_key = load_host_key(&config.host_key_path)?;

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionRegistry::new(shutdown.clone()));

    let mut tasks = tokio::task::JoinSet::new();

    if config.dns_enabled() {
        let table = RouteTable::new(&config.dns_zones, &config.dns_backends)?;
        let dispatcher = DnsDispatcher::bind(table, config.dns_addr).await?;
        tasks.spawn(dispatcher.run(shutdown.clone()));
    }

    let ssh = SshGateway::new(store.clone(), sessions.clone());
    let ssh_config = Arc::new(SshGateway::server_config(host_key));
    {
        let shutdown = shutdown.clone();
        let addr = config.ssh_addr;
        tasks.spawn(async move {
            if let Err(e) = ssh.run(ssh_config, addr, shutdown).await {
                warn!("SSH gateway exited: {}", e);
            }
        });
    }

    let socks = SocksGateway::bind(store.clone(), sessions.clone(), config.socks_addr).await?;
    tasks.spawn(socks.run(shutdown.clone()));

    let mux = MuxListener::bind(config.public_addr, config.ssh_addr, config.socks_addr).await?;
    tasks.spawn(mux.run(shutdown.clone()));

    let flusher = session::spawn_usage_flusher(sessions.clone(), store.clone(), shutdown.clone());

    wait_for_signal().await?;
    info!("Shutdown requested, closing listeners...");
    shutdown.cancel();

    // Bounded join; stragglers are abandoned after the grace period.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Some tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }

    // The final usage flush runs regardless of what was abandoned.
    if flusher.await.is_err() {
        session::flush_all(&sessions, &store).await;
    }

    info!("Gateway stopped");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
