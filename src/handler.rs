//! Per-connection protocol handling.
//!
//! Every accepted connection carries exactly one query and moves through
//! `Reading -> Validating -> Querying -> Responding -> Closed`. `Querying` is
//! only entered for valid queries. Every connection ends in `Closed`, whether
//! it completes or fails part way.
//!
//! The handler is generic over the stream so the same code serves plain TCP
//! and TLS-wrapped connections.

use crate::dataset::DatasetStore;
use crate::error::ConnectionError;
use crate::query::{classify, Classification, Response};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, trace};

/// Ceiling on how long a client may take to deliver its query
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on writing the response back
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Quiet period after which a partial, unterminated payload is taken as the
/// whole query
pub const FRAME_IDLE: Duration = Duration::from_millis(200);

/// Bytes read beyond `max_payload` so oversized payloads can be detected
const READ_MARGIN: usize = 1;

/// Upper bound on the initial read buffer allocation
const INITIAL_BUFFER_SIZE: usize = 4 * 1024;

/// Most unread input discarded after responding
const DRAIN_LIMIT: usize = 64 * 1024;

/// Per-connection limits derived from configuration
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_payload: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub frame_idle: Duration,
}

impl Limits {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            frame_idle: FRAME_IDLE,
        }
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    Validating,
    Querying,
    Responding,
    Closed,
}

/// One request as read off the wire
struct Frame {
    payload: BytesMut,
    /// Client had already closed its sending side
    eof: bool,
}

/// What happened on a completed connection
#[derive(Debug, Clone)]
pub struct Outcome {
    pub response: Response,
    /// Trimmed query text, for valid queries only
    pub query: Option<String>,
    /// Raw payload length in bytes, as read
    pub payload_len: usize,
    /// Time spent in the dataset lookup, for valid queries only
    pub lookup_time: Option<Duration>,
    pub elapsed: Duration,
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    started: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly accepted stream in its initial reading state.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            started: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn transition(&mut self, next: ConnState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Serve the connection's single query, then close it.
    pub async fn serve(
        mut self,
        dataset: &DatasetStore,
        limits: &Limits,
    ) -> Result<Outcome, ConnectionError> {
        let result = self.process(dataset, limits).await;
        self.transition(ConnState::Closed);
        result
    }

    async fn process(
        &mut self,
        dataset: &DatasetStore,
        limits: &Limits,
    ) -> Result<Outcome, ConnectionError> {
        let frame = self.read_payload(limits).await?;

        self.transition(ConnState::Validating);
        let classification = classify(&frame.payload, limits.max_payload);

        let (response, query, lookup_time) = match classification {
            Classification::Valid(query) => {
                self.transition(ConnState::Querying);
                let lookup_started = Instant::now();
                let found = match dataset.contains(&query).await {
                    Ok(found) => found,
                    Err(e) => {
                        error!(peer = %self.peer, error = %e, "Dataset lookup failed");
                        false
                    }
                };
                (
                    Response::for_lookup(found),
                    Some(query),
                    Some(lookup_started.elapsed()),
                )
            }
            Classification::Empty => (Response::NotFound, None, None),
            Classification::TooLarge => (Response::TooLarge, None, None),
            Classification::InvalidEncoding => (Response::InvalidEncoding, None, None),
        };

        self.transition(ConnState::Responding);
        self.respond(response, limits).await?;
        if !frame.eof {
            self.drain(limits).await;
        }

        let outcome = Outcome {
            response,
            query,
            payload_len: frame.payload.len(),
            lookup_time,
            elapsed: self.started.elapsed(),
        };
        log_outcome(self.peer, &outcome);
        Ok(outcome)
    }

    /// Read one request frame.
    ///
    /// The frame ends at the first `\n`, at EOF, once `max_payload + 1` bytes
    /// have arrived, or when a partial payload is followed by `frame_idle` of
    /// silence. Input that has already arrived behind the newline still
    /// counts toward the size limit; it is cut off only when the whole
    /// payload fits. Receiving nothing at all within `read_timeout` aborts
    /// the connection.
    async fn read_payload(&mut self, limits: &Limits) -> Result<Frame, ConnectionError> {
        let cap = limits.max_payload.saturating_add(READ_MARGIN);
        let mut buffer = BytesMut::with_capacity(cap.min(INITIAL_BUFFER_SIZE));
        let deadline = Instant::now() + limits.read_timeout;
        let mut reader = (&mut self.stream).take(cap as u64);
        let mut eof = false;

        loop {
            let wait_until = if buffer.is_empty() {
                deadline
            } else {
                deadline.min(Instant::now() + limits.frame_idle)
            };

            match timeout_at(wait_until, reader.read_buf(&mut buffer)).await {
                Ok(Ok(0)) => {
                    eof = true;
                    break;
                }
                Ok(Ok(_)) => {
                    if buffer.len() >= cap {
                        break;
                    }
                    if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        eof = read_ready(&mut reader, &mut buffer, cap).await;
                        if buffer.len() <= limits.max_payload {
                            buffer.truncate(pos + 1);
                        }
                        break;
                    }
                }
                Ok(Err(e)) => return Err(ConnectionError::Io(e)),
                Err(_) if buffer.is_empty() || Instant::now() >= deadline => {
                    return Err(ConnectionError::ReadTimeout(limits.read_timeout));
                }
                Err(_) => {
                    trace!(peer = %self.peer, bytes = buffer.len(), "Unterminated payload, client idle");
                    break;
                }
            }
        }

        trace!(peer = %self.peer, bytes = buffer.len(), eof, "Read payload");
        Ok(Frame {
            payload: buffer,
            eof,
        })
    }

    async fn respond(&mut self, response: Response, limits: &Limits) -> Result<(), ConnectionError> {
        let write = async {
            self.stream.write_all(response.wire_bytes()).await?;
            self.stream.flush().await?;
            self.stream.shutdown().await?;
            Ok::<_, std::io::Error>(())
        };

        match timeout(limits.write_timeout, write).await {
            Ok(result) => result.map_err(ConnectionError::Io),
            Err(_) => Err(ConnectionError::WriteTimeout(limits.write_timeout)),
        }
    }

    /// Discard input the client sent past the frame so closing the socket
    /// does not reset the connection before the response is read.
    async fn drain(&mut self, limits: &Limits) {
        let mut scratch = [0u8; 1024];
        let mut drained = 0usize;

        let discard = async {
            while drained < DRAIN_LIMIT {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => drained += n,
                }
            }
        };
        let _ = timeout(limits.frame_idle, discard).await;

        if drained > 0 {
            trace!(peer = %self.peer, drained, "Discarded trailing input");
        }
    }
}

/// Take in whatever input is ready right now, without waiting, until `cap`.
/// Returns true if the client has closed its side.
async fn read_ready<R>(reader: &mut R, buffer: &mut BytesMut, cap: usize) -> bool
where
    R: AsyncRead + Unpin,
{
    while buffer.len() < cap {
        match timeout(Duration::ZERO, reader.read_buf(buffer)).await {
            Ok(Ok(0)) => return true,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    false
}

/// Handle a single client connection
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    dataset: &DatasetStore,
    limits: &Limits,
) -> Result<Outcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Connection::new(stream, peer).serve(dataset, limits).await
}

fn log_outcome(peer: SocketAddr, outcome: &Outcome) {
    let elapsed_ms = outcome.elapsed.as_secs_f64() * 1000.0;
    match (&outcome.query, outcome.lookup_time) {
        (Some(query), Some(lookup_time)) => info!(
            peer = %peer,
            query = %query,
            response = %outcome.response,
            lookup_us = u64::try_from(lookup_time.as_micros()).unwrap_or(u64::MAX),
            elapsed_ms = format_args!("{elapsed_ms:.2}"),
            "Query"
        ),
        _ => debug!(
            peer = %peer,
            payload_len = outcome.payload_len,
            response = %outcome.response,
            elapsed_ms = format_args!("{elapsed_ms:.2}"),
            "Rejected query"
        ),
    }
}
