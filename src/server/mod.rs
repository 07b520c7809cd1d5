//! gRPC server lifecycle.
//!
//! `Created → Listening → Serving → ShuttingDown → Stopped`. [`Server::start`]
//! blocks while serving; [`Server::stop`] drains with a deadline and halts
//! whatever is still running once it passes.

pub mod interceptors;
pub mod service;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tower::ServiceBuilder;
use tracing::{info, warn};

use crate::pb;
use crate::pb::exchange_rate_service_server::ExchangeRateServiceServer;
use crate::rates::RateProvider;
use interceptors::{HaltLayer, LoggingLayer, RecoveryLayer};
use service::RateService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Serving,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server was already started")]
    AlreadyStarted,

    #[error("build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error("serve: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("graceful stop did not finish within {timeout:?}")]
    DeadlineExceeded { timeout: Duration },
}

pub struct Server<P> {
    addr: SocketAddr,
    provider: Arc<P>,
    request_timeout: Option<Duration>,
    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
    halt: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
}

impl<P: RateProvider> Server<P> {
    pub fn new(addr: SocketAddr, provider: Arc<P>) -> Self {
        Self {
            addr,
            provider,
            request_timeout: None,
            state: watch::Sender::new(ServerState::Created),
            shutdown: watch::Sender::new(false),
            halt: watch::Sender::new(false),
            local_addr: OnceLock::new(),
        }
    }

    /// Server-side cap on every call, on top of client deadlines.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// The bound address once listening (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Resolves once the server is serving; `None` if it stopped first.
    pub async fn wait_serving(&self) -> Option<SocketAddr> {
        let mut state = self.state.subscribe();
        let reached = state
            .wait_for(|s| !matches!(s, ServerState::Created | ServerState::Listening))
            .await
            .ok()
            .map(|s| *s)?;

        if reached == ServerState::Serving {
            self.local_addr()
        } else {
            None
        }
    }

    /// Binds and serves until [`stop`](Self::stop) completes. A bind failure
    /// is returned immediately. Any return leaves the server `Stopped`.
    pub async fn start(&self) -> Result<(), ServerError> {
        let claimed = self.state.send_if_modified(|s| {
            if *s == ServerState::Created {
                *s = ServerState::Listening;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ServerError::AlreadyStarted);
        }

        let result = self.serve().await;
        self.state.send_replace(ServerState::Stopped);
        result
    }

    async fn serve(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| ServerError::Bind { addr: self.addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: self.addr, source })?;
        let _ = self.local_addr.set(local);

        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1()?;
        let rates = RateService::new(Arc::clone(&self.provider));

        let mut builder = tonic::transport::Server::builder();
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let layers = ServiceBuilder::new()
            .layer(LoggingLayer)
            .layer(RecoveryLayer)
            .layer(HaltLayer::new(self.halt.subscribe()))
            .into_inner();
        let router = builder
            .layer(layers)
            .add_service(ExchangeRateServiceServer::new(rates))
            .add_service(reflection);

        // A stop that raced ahead of us already moved the state on.
        self.state.send_if_modified(|s| {
            if *s == ServerState::Listening {
                *s = ServerState::Serving;
                true
            } else {
                false
            }
        });
        info!(addr = %local, "Starting gRPC server");

        let mut shutdown = self.shutdown.subscribe();
        let mut halt = self.halt.subscribe();
        tokio::select! {
            res = router.serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            }) => res.map_err(ServerError::Transport),
            _ = abandon_after_halt(&mut halt) => {
                warn!("Abandoning connections still open after halt");
                Ok(())
            }
        }
    }

    /// Stops accepting calls and waits up to `timeout` for in-flight ones.
    /// Past the deadline every remaining call and stream is cut with
    /// `UNAVAILABLE` and `DeadlineExceeded` is returned.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ServerError> {
        let mut state = self.state.subscribe();
        let current = *state.borrow_and_update();
        if matches!(current, ServerState::Created | ServerState::Stopped) {
            return Ok(());
        }

        self.state.send_if_modified(|s| {
            if *s == ServerState::Stopped {
                false
            } else {
                *s = ServerState::ShuttingDown;
                true
            }
        });
        self.shutdown.send_replace(true);

        let drained = tokio::time::timeout(timeout, state.wait_for(|s| *s == ServerState::Stopped))
            .await
            .is_ok();
        if drained {
            info!("gRPC server stopped gracefully");
            return Ok(());
        }

        warn!(timeout_ms = timeout.as_millis() as u64, "Force stopping gRPC server");
        self.halt.send_replace(true);
        let halted = tokio::time::timeout(HALT_WAIT * 2, state.wait_for(|s| *s == ServerState::Stopped))
            .await
            .is_ok();
        if !halted {
            warn!("gRPC server still running after halt");
        }
        Err(ServerError::DeadlineExceeded { timeout })
    }
}

// Once halted, connections get this long to wind down before serving is
// abandoned.
const HALT_WAIT: Duration = Duration::from_secs(1);

async fn abandon_after_halt(halt: &mut watch::Receiver<bool>) {
    if halt.wait_for(|halted| *halted).await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(HALT_WAIT).await;
}
