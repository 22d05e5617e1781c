//! Leader election across scheduler replicas.
//!
//! The leader is whoever's address is stored under [`LEADER_KEY`]. Standbys
//! hold a TCP connection open to the recorded leader's liveness listener; the
//! leader never writes to it, so the only thing a standby's read can report
//! is that the connection went away.
//!
//! ```text
//! create /leader=self ──▶ read /leader ──▶ self? ──yes──▶ leading
//!        ▲                                   │ no
//!        │                                   ▼
//!        ├──── timed out (keep key) ◀── probe leader
//!        └──── disconnected (delete key) ◀──┘
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use drover_kv::{KeyValueStore, KvError};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::shutdown_requested;

/// Key holding the leader's advertised address.
pub const LEADER_KEY: &str = "/leader";

/// Idle time before the first keep-alive probe.
const KEEPALIVE_TIME: Duration = Duration::from_secs(10);

/// Interval between keep-alive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election configuration.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// Address the liveness listener binds to.
    pub listen_addr: SocketAddr,

    /// Address recorded under [`LEADER_KEY`] and dialed by standbys.
    pub advertise_addr: String,

    /// Connect timeout when dialing the leader.
    pub dial_timeout: Duration,

    /// Upper bound on a single probe read. `None` waits until the
    /// connection fails.
    pub probe_read_timeout: Option<Duration>,

    /// Pause before re-electing after a probe timed out.
    pub retry_delay: Duration,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            advertise_addr: "127.0.0.1:7070".to_string(),
            dial_timeout: Duration::from_secs(2),
            probe_read_timeout: None,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum HaError {
    #[error("leader record operation failed: {0}")]
    Store(#[from] KvError),

    #[error("failed to bind liveness listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// How a probe of the recorded leader ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The read timed out; the leader may still be alive.
    TimedOut,

    /// The leader is unreachable or closed the connection.
    Disconnected(String),
}

impl ProbeOutcome {
    fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            _ => Self::Disconnected(err.to_string()),
        }
    }
}

/// Enable TCP keep-alive so a silently dead peer eventually fails reads.
fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Leader election for one replica.
pub struct LeaderElection {
    store: Arc<dyn KeyValueStore>,
    config: HaConfig,
}

impl LeaderElection {
    /// `store` should retry transient failures; its errors are fatal here.
    pub fn new(store: Arc<dyn KeyValueStore>, config: HaConfig) -> Self {
        Self { store, config }
    }

    pub fn advertise_addr(&self) -> &str {
        &self.config.advertise_addr
    }

    /// Record this replica as leader unless a leader is already recorded.
    ///
    /// Returns true if this call created the record.
    pub async fn create_leader(&self) -> Result<bool, HaError> {
        match self
            .store
            .create(LEADER_KEY, &self.config.advertise_addr)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The recorded leader's address, if any.
    pub async fn get_leader(&self) -> Result<Option<String>, HaError> {
        match self.store.read(LEADER_KEY).await {
            Ok(addr) => Ok(Some(addr)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_leader(&self) -> Result<(), HaError> {
        self.store.delete(LEADER_KEY).await?;
        Ok(())
    }

    /// Returns true if the store records this replica as leader.
    pub async fn is_leader(&self) -> Result<bool, HaError> {
        Ok(self.get_leader().await?.as_deref() == Some(self.advertise_addr()))
    }

    /// Block until this replica is the recorded leader.
    pub async fn election(&self) -> Result<(), HaError> {
        info!(advertise_addr = %self.config.advertise_addr, "Starting leader election");

        loop {
            if self.create_leader().await? {
                debug!("Leader record created");
            }

            let Some(leader) = self.get_leader().await? else {
                debug!("Leader record vanished before it could be read");
                continue;
            };

            if leader == self.config.advertise_addr {
                info!("Elected leader");
                return Ok(());
            }

            info!(leader = %leader, "Standing by for current leader");
            match self.probe(&leader).await {
                ProbeOutcome::TimedOut => {
                    warn!(leader = %leader, "Leader probe timed out, keeping leader record");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                ProbeOutcome::Disconnected(reason) => {
                    warn!(leader = %leader, reason = %reason, "Lost leader, clearing leader record");
                    self.clear_stale_leader(&leader).await?;
                }
            }
        }
    }

    /// Delete the leader record only if it still names `stale`, so a standby
    /// that lost the race does not remove a fresh leader's record.
    async fn clear_stale_leader(&self, stale: &str) -> Result<(), HaError> {
        if self.get_leader().await?.as_deref() == Some(stale) {
            self.delete_leader().await?;
        }
        Ok(())
    }

    /// Connect to `leader` and block until the connection ends.
    ///
    /// Failing to connect at all counts as the leader being gone.
    pub async fn probe(&self, leader: &str) -> ProbeOutcome {
        let mut stream = match timeout(self.config.dial_timeout, TcpStream::connect(leader)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return ProbeOutcome::Disconnected(e.to_string()),
            Err(_) => {
                return ProbeOutcome::Disconnected(format!(
                    "connect timed out after {:?}",
                    self.config.dial_timeout
                ))
            }
        };

        if let Err(e) = enable_keepalive(&stream) {
            warn!(leader = %leader, error = %e, "Failed to enable keep-alive on leader probe");
        }

        let mut buf = [0u8; 64];
        loop {
            let read = stream.read(&mut buf);
            let result = match self.config.probe_read_timeout {
                Some(limit) => match timeout(limit, read).await {
                    Ok(result) => result,
                    Err(_) => return ProbeOutcome::TimedOut,
                },
                None => read.await,
            };

            match result {
                Ok(0) => return ProbeOutcome::Disconnected("leader closed the connection".into()),
                // Nothing is expected on this channel; stray bytes are ignored
                Ok(_) => continue,
                Err(e) => return ProbeOutcome::from_io(&e),
            }
        }
    }

    /// Bind the liveness listener.
    pub async fn bind(&self) -> Result<TcpListener, HaError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|source| HaError::Bind {
                addr: self.config.listen_addr,
                source,
            })?;

        if let Ok(local_addr) = listener.local_addr() {
            info!(bind_addr = %local_addr, "Liveness listener bound");
        }
        Ok(listener)
    }

    /// Hold every incoming connection open until shutdown.
    ///
    /// Runs on leaders and standbys alike. All held connections are dropped
    /// when this returns.
    pub async fn communicate(listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = enable_keepalive(&stream) {
                            debug!(peer_addr = %peer_addr, error = %e, "Failed to enable keep-alive");
                        }
                        debug!(peer_addr = %peer_addr, "Standby connected");
                        connections.spawn(hold(stream, peer_addr));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_requested(&mut shutdown) => {
                    info!(connections = connections.len(), "Liveness listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn hold(mut stream: TcpStream, peer_addr: SocketAddr) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    debug!(peer_addr = %peer_addr, "Standby disconnected");
}
