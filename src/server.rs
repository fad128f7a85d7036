//! TCP listener and dispatcher.
//!
//! Accepts connections, admits each one under the connection limit and runs
//! it on its own task. The limit is a semaphore: a permit is taken on
//! admission and travels with the handler task, so it is returned when the
//! task ends for any reason, panics and aborts included.
//!
//! On shutdown the accept loop stops, the signal reaches every in-flight
//! handler, and handlers still running after `shutdown_timeout_ms` are
//! aborted.

use crate::config::{AdmissionPolicy, Config};
use crate::connection::{Connection, ConnectionId};
use crate::error::{HandlerError, ServeError};
use crate::guard::ResourceGuard;
use crate::handler::{handle_connection, HandlerConfig, Outcome};
use crate::protocol;
use crate::shutdown::ShutdownListener;
use crate::transform::{self, Pipeline, TransformOptions, Transformer};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Receives the outcome of every connection.
///
/// Passed to the server explicitly; the default is [`LogObserver`].
pub trait OutcomeObserver: Send + Sync {
    fn on_outcome(&self, id: ConnectionId, peer: &str, outcome: &Outcome);
}

/// Reports outcomes through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl OutcomeObserver for LogObserver {
    fn on_outcome(&self, id: ConnectionId, peer: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Served {
                request_len,
                response_len,
            } => debug!(conn = %id, peer, request_len, response_len, "Connection served"),
            Outcome::Rejected(e) => debug!(conn = %id, peer, error = %e, "Invalid request"),
            Outcome::Failed(HandlerError::Cancelled) => {
                debug!(conn = %id, peer, "Connection cancelled by shutdown")
            }
            Outcome::Failed(e) => debug!(conn = %id, peer, error = %e, "Connection error"),
            Outcome::Overloaded => warn!(conn = %id, peer, "Connection limit reached"),
        }
    }
}

/// Read-only view of the connection limit.
#[derive(Debug, Clone)]
pub struct AdmissionGauge {
    limit: Arc<Semaphore>,
    max_connections: usize,
}

impl AdmissionGauge {
    /// Number of connections currently admitted.
    pub fn in_flight(&self) -> usize {
        self.max_connections - self.limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler_config: HandlerConfig,
    transformer: Arc<dyn Transformer>,
    options: Arc<TransformOptions>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    admission: AdmissionPolicy,
    shutdown_timeout: Duration,
    observer: Arc<dyn OutcomeObserver>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a tokio runtime. Bind failures are fatal
    /// and returned here, before any connection is accepted.
    pub fn bind(config: &Config) -> Result<Self, ServeError> {
        let addr: SocketAddr = config.listen.parse().map_err(|e| ServeError::Address {
            address: config.listen.clone(),
            reason: format!("{e}"),
        })?;

        let transformer = build_transformer(&config.transformers)?;

        let listener = create_listener(addr, config.backlog).map_err(|e| ServeError::Bind {
            address: config.listen.clone(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| ServeError::Bind {
            address: config.listen.clone(),
            source: e,
        })?;

        info!(
            address = %local_addr,
            max_connections = config.max_connections,
            admission = ?config.admission,
            framing = ?config.framing,
            transformer = transformer.name(),
            "Server listening"
        );

        Ok(Server {
            listener,
            local_addr,
            handler_config: HandlerConfig::from_config(config),
            transformer,
            options: Arc::new(config.transform_options.clone()),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            admission: config.admission,
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            observer: Arc::new(LogObserver),
        })
    }

    /// Replace the configured transformer.
    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn OutcomeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admission_gauge(&self) -> AdmissionGauge {
        AdmissionGauge {
            limit: Arc::clone(&self.connection_limit),
            max_connections: self.max_connections,
        }
    }

    /// Accept and dispatch connections until `shutdown` fires.
    pub async fn serve(self, mut shutdown: ShutdownListener) {
        let mut tasks = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            // Wait for a free slot without holding it while idle; the accept
            // loop is the only acquirer, so it is still free after `accept`.
            if self.admission == AdmissionPolicy::Wait {
                tokio::select! {
                    permit = self.connection_limit.acquire() => match permit {
                        Ok(permit) => drop(permit),
                        Err(_) => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let id = ConnectionId::next();
            let permit = match Arc::clone(&self.connection_limit).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.turn_away(id, peer, stream);
                    continue;
                }
            };

            debug!(conn = %id, peer = %peer, "New connection");
            self.dispatch(&mut tasks, id, peer, stream, permit, shutdown.clone());
        }

        info!(address = %self.local_addr, "Stopped accepting connections");
        self.drain(tasks).await;
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<()>,
        id: ConnectionId,
        peer: SocketAddr,
        stream: TcpStream,
        permit: OwnedSemaphorePermit,
        shutdown: ShutdownListener,
    ) {
        let transformer = Arc::clone(&self.transformer);
        let options = Arc::clone(&self.options);
        let observer = Arc::clone(&self.observer);
        let handler_config = self.handler_config;

        tasks.spawn(async move {
            let _permit = permit;
            let peer = peer.to_string();
            let conn = Connection::new(id, peer.clone(), stream);
            let outcome =
                handle_connection(conn, &*transformer, &options, &handler_config, shutdown).await;
            observer.on_outcome(id, &peer, &outcome);
        });
    }

    /// Refuse a connection over the limit without spawning a handler.
    fn turn_away(&self, id: ConnectionId, peer: SocketAddr, stream: TcpStream) {
        let conn = ResourceGuard::new(Connection::new(id, peer.to_string(), stream));
        // Straight to the socket: tokio has no write readiness for a fresh
        // stream yet, and its send buffer always has room for one line.
        if let Err(e) = SockRef::from(conn.transport()).send(&protocol::overloaded()) {
            warn!(conn = %id, error = %e, "Failed to send overload response");
        }
        if let Err(e) = conn.close() {
            warn!(conn = %id, error = %e, "Release failed");
        }
        self.observer.on_outcome(id, &peer.to_string(), &Outcome::Overloaded);
    }

    /// Wait for in-flight handlers, aborting any still running at the deadline.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "Draining connections");

        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = tasks.join_next() => match next {
                    Some(result) => log_task_result(result),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(remaining = tasks.len(), "Shutdown timeout, aborting handlers");
                    tasks.abort_all();
                    while let Some(result) = tasks.join_next().await {
                        log_task_result(result);
                    }
                    break;
                }
            }
        }
        info!("All connections closed");
    }
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(config: &Config, shutdown: ShutdownListener) -> Result<(), ServeError> {
    Server::bind(config)?.serve(shutdown).await;
    Ok(())
}

/// Resolve transformer names to a single transformer.
fn build_transformer(names: &[String]) -> Result<Arc<dyn Transformer>, ServeError> {
    if let [name] = names {
        return transform::builtin(name).ok_or_else(|| ServeError::UnknownTransformer(name.clone()));
    }
    let pipeline = Pipeline::from_names(names).map_err(ServeError::UnknownTransformer)?;
    Ok(Arc::new(pipeline))
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "Connection handler panicked"),
        Err(e) => debug!(error = %e, "Connection handler aborted"),
    }
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}
