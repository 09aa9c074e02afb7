//! Bidirectional byte relay between an accepted client and the backend
//!
//! Each direction runs as its own task copying until end-of-stream or an
//! I/O error, then half-closes the destination so the peer sees EOF. Both
//! tasks share a signed completion counter: client→backend adds `+1`,
//! backend→client adds `-1`. Whichever task brings it back to zero
//! reassembles both streams and shuts them down, so the connections are
//! closed exactly once regardless of which side finishes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use crate::Error;

const COPY_BUF_SIZE: usize = 8 * 1024;

/// One relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from the client and written to the backend.
    ClientToBackend,
    /// Bytes read from the backend and written to the client.
    BackendToClient,
}

impl Direction {
    /// Counter adjustment applied when this direction finishes.
    #[must_use]
    pub const fn side(self) -> i32 {
        match self {
            Self::ClientToBackend => 1,
            Self::BackendToClient => -1,
        }
    }

    /// Label used in logs and errors.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ClientToBackend => "client->backend",
            Self::BackendToClient => "backend->client",
        }
    }
}

/// Signed counter joining the two directions of a relay.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    status: AtomicI32,
}

impl CompletionLatch {
    /// Counter at zero; neither direction finished.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `direction` finished.
    ///
    /// Returns `true` for exactly one caller: the one whose adjustment
    /// brought the counter back to zero.
    pub fn finish(&self, direction: Direction) -> bool {
        let side = direction.side();
        self.status.fetch_add(side, Ordering::AcqRel) + side == 0
    }

    /// Current counter value.
    #[must_use]
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }
}

/// Outcome of one direction.
#[derive(Debug, Default)]
pub struct DirectionReport {
    /// Bytes delivered to the destination, including those written before
    /// a failure.
    pub bytes: u64,
    /// I/O error that ended the copy, if any.
    pub error: Option<Error>,
}

/// Outcome of a finished relay.
#[derive(Debug, Default)]
pub struct RelayReport {
    /// Client to backend.
    pub client_to_backend: DirectionReport,
    /// Backend to client.
    pub backend_to_client: DirectionReport,
}

impl RelayReport {
    /// Whether both directions ended without an I/O error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.client_to_backend.error.is_none() && self.backend_to_client.error.is_none()
    }
}

type Parked<R, W> = Mutex<Option<(ReadHalf<R>, WriteHalf<W>)>>;

/// Halves parked by finished directions until the closing task reassembles them.
struct Shared<C, B> {
    latch: CompletionLatch,
    upstream: Parked<C, B>,
    downstream: Parked<B, C>,
}

impl<C, B> Shared<C, B>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    async fn close(&self) {
        let upstream = self.upstream.lock().take();
        let downstream = self.downstream.lock().take();
        let (Some((client_read, backend_write)), Some((backend_read, client_write))) =
            (upstream, downstream)
        else {
            return;
        };

        let mut client = client_read.unsplit(client_write);
        let mut backend = backend_read.unsplit(backend_write);

        // Write sides are usually already half-closed; failures here only
        // mean the peer went away first.
        if let Err(e) = client.shutdown().await {
            trace!(error = %e, "client shutdown");
        }
        if let Err(e) = backend.shutdown().await {
            trace!(error = %e, "backend shutdown");
        }
        debug!("Relay closed both connections");
    }
}

/// Relay between a client stream and a backend stream.
#[derive(Debug)]
pub struct ConnectionRelay<C, B> {
    client: C,
    backend: B,
}

impl<C, B> ConnectionRelay<C, B>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Pair a client with its backend.
    pub fn new(client: C, backend: B) -> Self {
        Self { client, backend }
    }

    /// Relay until both directions have finished, then close both streams.
    pub async fn run(self) -> RelayReport {
        let (client_read, client_write) = tokio::io::split(self.client);
        let (backend_read, backend_write) = tokio::io::split(self.backend);

        let shared = Arc::new(Shared {
            latch: CompletionLatch::new(),
            upstream: Mutex::new(None),
            downstream: Mutex::new(None),
        });

        let up = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let (r, w, report) =
                    pump(Direction::ClientToBackend, client_read, backend_write).await;
                *shared.upstream.lock() = Some((r, w));
                if shared.latch.finish(Direction::ClientToBackend) {
                    shared.close().await;
                }
                report
            })
        };

        let down = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let (r, w, report) =
                    pump(Direction::BackendToClient, backend_read, client_write).await;
                *shared.downstream.lock() = Some((r, w));
                if shared.latch.finish(Direction::BackendToClient) {
                    shared.close().await;
                }
                report
            })
        };

        let (up, down) = tokio::join!(up, down);
        RelayReport {
            client_to_backend: joined(Direction::ClientToBackend, up),
            backend_to_client: joined(Direction::BackendToClient, down),
        }
    }
}

async fn pump<R, W>(direction: Direction, mut reader: R, mut writer: W) -> (R, W, DirectionReport)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0;
    let report = match copy_counted(&mut reader, &mut writer, &mut bytes).await {
        Ok(()) => {
            debug!(direction = direction.label(), bytes, "Relay direction finished");
            DirectionReport { bytes, error: None }
        }
        Err(source) => {
            debug!(direction = direction.label(), bytes, error = %source, "Relay direction failed");
            DirectionReport {
                bytes,
                error: Some(Error::RelayIo {
                    direction: direction.label(),
                    source,
                }),
            }
        }
    };

    // Propagate end-of-stream so the peer can finish its side.
    if let Err(e) = writer.shutdown().await {
        trace!(direction = direction.label(), error = %e, "half-close failed");
    }

    (reader, writer, report)
}

/// Copy until EOF, adding every chunk written to `bytes` as it lands.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, bytes: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.flush().await;
        }
        writer.write_all(&buf[..n]).await?;
        *bytes += n as u64;
    }
}

fn joined(
    direction: Direction,
    result: std::result::Result<DirectionReport, tokio::task::JoinError>,
) -> DirectionReport {
    result.unwrap_or_else(|e| DirectionReport {
        bytes: 0,
        error: Some(Error::RelayIo {
            direction: direction.label(),
            source: std::io::Error::other(e),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::net::{TcpListener, TcpStream};

    // ─── CompletionLatch ──────────────────────────────────────────────────────

    #[test]
    fn latch_fires_on_second_finish_client_first() {
        let latch = CompletionLatch::new();
        assert!(!latch.finish(Direction::ClientToBackend));
        assert_eq!(latch.status(), 1);
        assert!(latch.finish(Direction::BackendToClient));
        assert_eq!(latch.status(), 0);
    }

    #[test]
    fn latch_fires_on_second_finish_backend_first() {
        let latch = CompletionLatch::new();
        assert!(!latch.finish(Direction::BackendToClient));
        assert_eq!(latch.status(), -1);
        assert!(latch.finish(Direction::ClientToBackend));
    }

    #[test]
    fn latch_fires_exactly_once_under_contention() {
        // GIVEN: many latches, each finished concurrently from two threads
        for _ in 0..200 {
            let latch = Arc::new(CompletionLatch::new());
            let a = {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.finish(Direction::ClientToBackend))
            };
            let b = {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.finish(Direction::BackendToClient))
            };
            let fired = [a.join().unwrap(), b.join().unwrap()];

            // THEN: exactly one of them closes
            assert_eq!(fired.iter().filter(|f| **f).count(), 1);
        }
    }

    // ─── Relay over in-memory pipes ───────────────────────────────────────────

    /// Backend that echoes everything it reads, then closes.
    async fn echo(mut stream: DuplexStream) {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn payload_round_trips_and_both_sides_see_eof() {
        // GIVEN: client and backend joined by a relay, backend echoing
        let (mut client_app, client_side) = tokio::io::duplex(64);
        let (backend_side, backend_app) = tokio::io::duplex(64);
        let backend = tokio::spawn(echo(backend_app));
        let relay = tokio::spawn(ConnectionRelay::new(client_side, backend_side).run());

        // WHEN: the client sends a payload larger than the pipe buffer and half-closes
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        client_app.write_all(&payload).await.unwrap();
        client_app.shutdown().await.unwrap();

        // THEN: the echo comes back followed by EOF
        let mut echoed = Vec::new();
        client_app.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        backend.await.unwrap();
        let report = relay.await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.client_to_backend.bytes, 1000);
        assert_eq!(report.backend_to_client.bytes, 1000);
    }

    #[tokio::test]
    async fn backend_closing_first_ends_the_client_side() {
        // GIVEN: a backend that sends a greeting and closes without reading
        let (mut client_app, client_side) = tokio::io::duplex(64);
        let (backend_side, mut backend_app) = tokio::io::duplex(64);
        let relay = tokio::spawn(ConnectionRelay::new(client_side, backend_side).run());

        backend_app.write_all(b"bye").await.unwrap();
        backend_app.shutdown().await.unwrap();

        // WHEN: the client reads
        let mut got = Vec::new();
        client_app.read_to_end(&mut got).await.unwrap();

        // THEN: it sees the greeting then EOF; finishing its side completes the relay
        assert_eq!(got, b"bye");
        client_app.shutdown().await.unwrap();
        drop(backend_app);
        let report = relay.await.unwrap();
        assert_eq!(report.backend_to_client.bytes, 3);
    }

    #[tokio::test]
    async fn write_error_is_reported_for_its_direction() {
        // GIVEN: a backend that is already gone
        let (mut client_app, client_side) = tokio::io::duplex(64);
        let (backend_side, backend_app) = tokio::io::duplex(64);
        drop(backend_app);
        let relay = tokio::spawn(ConnectionRelay::new(client_side, backend_side).run());

        // WHEN: the client sends data
        client_app.write_all(b"select 1").await.unwrap();
        client_app.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client_app.read_to_end(&mut rest).await.unwrap();

        // THEN: the client->backend direction reports the failure
        let report = relay.await.unwrap();
        assert!(rest.is_empty());
        let err = report.client_to_backend.error.expect("write should fail");
        assert!(err.to_string().contains("client->backend"));
        assert!(report.backend_to_client.error.is_none());
    }

    #[tokio::test]
    async fn bytes_delivered_before_a_failure_are_counted() {
        // GIVEN: a backend that takes one message and then disappears
        let (mut client_app, client_side) = tokio::io::duplex(64);
        let (backend_side, mut backend_app) = tokio::io::duplex(64);
        let relay = tokio::spawn(ConnectionRelay::new(client_side, backend_side).run());

        client_app.write_all(b"auth").await.unwrap();
        let mut got = [0u8; 4];
        backend_app.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"auth");
        drop(backend_app);

        // WHEN: the client keeps sending
        client_app.write_all(b"select 1").await.unwrap();
        client_app.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client_app.read_to_end(&mut rest).await.unwrap();

        // THEN: the failed direction still reports what reached the backend
        let report = relay.await.unwrap();
        assert!(report.client_to_backend.error.is_some());
        assert_eq!(report.client_to_backend.bytes, 4);
    }

    // ─── Relay over TCP ───────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_relay_echoes_and_closes_sockets() {
        // GIVEN: an echo backend on TCP
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = backend_listener.accept().await.unwrap();
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            s.shutdown().await.unwrap();
        });

        // AND: a front listener relaying each accepted socket to it
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (client, _) = front.accept().await.unwrap();
            let backend = TcpStream::connect(backend_addr).await.unwrap();
            ConnectionRelay::new(client, backend).run().await
        });

        // WHEN
        let mut conn = TcpStream::connect(front_addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();

        // THEN
        assert_eq!(out, b"ping");
        let report = relay.await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.client_to_backend.bytes, 4);
    }
}
