//! Per-connection request handling.
//!
//! A handler owns one [`Connection`] and drives it through
//!
//! ```text
//! Accepted → Reading → Transforming → Writing → Closed
//!     \          \            \            \
//!      +----------+------------+------------+--→ Error
//! ```
//!
//! Exactly one request is read and at most one response is written. Every
//! suspension point is bounded by its timeout and by the shutdown signal.
//! The connection is released through a [`ResourceGuard`] whichever way the
//! handler ends, including when the task running it is aborted.

use crate::config::Config;
use crate::connection::{ConnState, Connection, ConnectionId, Transport};
use crate::error::{HandlerError, InvalidInput, Phase};
use crate::guard::ResourceGuard;
use crate::protocol::{self, Framing, ParseResult};
use crate::shutdown::ShutdownListener;
use crate::transform::{TransformOptions, Transformer};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Initial read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Settings every handler runs with.
#[derive(Debug, Clone, Copy)]
pub struct HandlerConfig {
    pub framing: Framing,
    pub max_request_size: usize,
    /// `None` waits forever.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl HandlerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            framing: config.framing,
            max_request_size: config.max_request_size,
            read_timeout: millis(config.read_timeout_ms),
            write_timeout: millis(config.write_timeout_ms),
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Length,
            max_request_size: 1024 * 1024,
            read_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// `0` means no timeout.
pub(crate) fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// A fully read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub connection: ConnectionId,
    pub peer: String,
    pub body: Bytes,
}

/// How a connection ended, as reported to the dispatcher.
#[derive(Debug)]
pub enum Outcome {
    /// Response written and flushed.
    Served {
        request_len: usize,
        response_len: usize,
    },
    /// Bad input, answered with a `CLIENT_ERROR` line.
    Rejected(InvalidInput),
    /// Aborted without a complete response.
    Failed(HandlerError),
    /// Turned away at admission; no handler ran.
    Overloaded,
}

impl Outcome {
    pub fn is_served(&self) -> bool {
        matches!(self, Outcome::Served { .. })
    }
}

/// Run one connection to completion and release it.
pub async fn handle_connection<T: Transport>(
    conn: Connection<T>,
    transformer: &dyn Transformer,
    options: &TransformOptions,
    config: &HandlerConfig,
    mut shutdown: ShutdownListener,
) -> Outcome {
    let mut conn = ResourceGuard::new(conn);

    let outcome = match serve_one(&mut conn, transformer, options, config, &mut shutdown).await {
        Ok(outcome) => outcome,
        Err(e) => Outcome::Failed(e),
    };

    conn.transition(if outcome.is_served() {
        ConnState::Closed
    } else {
        ConnState::Error
    });

    let id = conn.id();
    if let Err(e) = conn.close() {
        warn!(conn = %id, error = %e, "Release failed");
    }
    trace!(conn = %id, "Connection closed");

    outcome
}

async fn serve_one<T: Transport>(
    conn: &mut Connection<T>,
    transformer: &dyn Transformer,
    options: &TransformOptions,
    config: &HandlerConfig,
    shutdown: &mut ShutdownListener,
) -> Result<Outcome, HandlerError> {
    conn.transition(ConnState::Reading);
    let read = read_frame(conn.transport_mut(), config.framing, config.max_request_size);
    let body = match bounded(read, Phase::Read, config.read_timeout, shutdown).await {
        Ok(body) => body,
        Err(HandlerError::InvalidInput(e)) => {
            return reject(conn, e, config, shutdown).await;
        }
        Err(e) => return Err(e),
    };

    let request = Request {
        connection: conn.id(),
        peer: conn.peer().to_string(),
        body,
    };
    trace!(conn = %request.connection, len = request.body.len(), "Request read");

    conn.transition(ConnState::Transforming);
    let output = match transformer.transform(&request.body, options) {
        Ok(output) => output,
        Err(e) => return reject(conn, e, config, shutdown).await,
    };
    let response = protocol::encode_response(config.framing, &output);

    conn.transition(ConnState::Writing);
    write_response(conn, &response, config, shutdown).await?;

    debug!(
        conn = %request.connection,
        peer = %request.peer,
        transformer = transformer.name(),
        request_len = request.body.len(),
        response_len = response.len(),
        "Request served"
    );

    Ok(Outcome::Served {
        request_len: request.body.len(),
        response_len: response.len(),
    })
}

/// Answer bad input with a `CLIENT_ERROR` line.
async fn reject<T: Transport>(
    conn: &mut Connection<T>,
    error: InvalidInput,
    config: &HandlerConfig,
    shutdown: &mut ShutdownListener,
) -> Result<Outcome, HandlerError> {
    debug!(conn = %conn.id(), error = %error, "Rejecting request");
    conn.transition(ConnState::Writing);
    let response = protocol::client_error(&error.to_string());
    write_response(conn, &response, config, shutdown).await?;
    Ok(Outcome::Rejected(error))
}

async fn write_response<T: Transport>(
    conn: &mut Connection<T>,
    response: &[u8],
    config: &HandlerConfig,
    shutdown: &mut ShutdownListener,
) -> Result<(), HandlerError> {
    let transport = conn.transport_mut();
    let write = async move {
        transport
            .write_all(response)
            .await
            .map_err(|e| HandlerError::transport(Phase::Write, e))?;
        transport
            .flush()
            .await
            .map_err(|e| HandlerError::transport(Phase::Write, e))
    };
    bounded(write, Phase::Write, config.write_timeout, shutdown).await
}

/// Read until one complete frame is buffered and return its payload.
async fn read_frame<T: Transport>(
    transport: &mut T,
    framing: Framing,
    max_request_size: usize,
) -> Result<Bytes, HandlerError> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE.min(max_request_size + 32));

    loop {
        match protocol::parse(framing, &buffer, max_request_size) {
            ParseResult::Complete { payload } => return Ok(buffer.freeze().slice(payload)),
            ParseResult::Invalid(e) => return Err(e.into()),
            ParseResult::Incomplete => {}
        }

        let n = transport
            .read_buf(&mut buffer)
            .await
            .map_err(|e| HandlerError::transport(Phase::Read, e))?;
        if n == 0 {
            return Err(HandlerError::transport(
                Phase::Read,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the request was complete",
                ),
            ));
        }
    }
}

/// Run `fut` under an optional timeout, aborting early on shutdown.
async fn bounded<F, O>(
    fut: F,
    phase: Phase,
    timeout: Option<Duration>,
    shutdown: &mut ShutdownListener,
) -> Result<O, HandlerError>
where
    F: Future<Output = Result<O, HandlerError>>,
{
    let timed = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout {
                    phase,
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => fut.await,
        }
    };

    tokio::select! {
        result = timed => result,
        _ = shutdown.cancelled() => Err(HandlerError::Cancelled),
    }
}
