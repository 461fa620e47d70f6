//! Socket plumbing shared by the client connection and the server.
//!
//! # How I/O reaches the hub (for beginners)
//!
//! Receptors run inside [`crate::notification::Hub::dispatch`], which is
//! synchronous.  Sockets, on the other hand, are async.  The bridge is a pair
//! of tiny tokio tasks per socket that do nothing but move bytes:
//!
//! - the **reader** task reads chunks and reports them as
//!   [`StreamEvent::Data`];
//! - the **writer** task writes whatever buffers it is handed and reports
//!   [`StreamEvent::Written`].
//!
//! Every event is tagged with the [`SocketId`] of the socket it belongs to
//! and pushed onto an unbounded channel.  The owning component drains that
//! channel only when a `TimerTick` reaches it, so all protocol state changes
//! happen on the dispatch thread.  When a socket is closed its id is retired,
//! and late events still carrying the old id are dropped.

pub mod send_queue;

use std::fmt;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub use send_queue::SendQueue;

/// Size of the buffer each reader task fills per `read()`.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Generation tag identifying one socket instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns this id and advances `self` to the next one.
    pub fn bump(&mut self) -> SocketId {
        let current = *self;
        self.0 += 1;
        current
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion reported by a socket's reader or writer task.
#[derive(Debug)]
pub enum StreamEvent {
    /// Bytes arrived.  Never empty.
    Data(Vec<u8>),
    /// The peer closed the connection cleanly.
    Closed,
    ReadFailed(io::Error),
    /// The last buffer handed to the writer is fully written.
    Written,
    WriteFailed(io::Error),
}

/// Sender half of a component's stream event channel.
pub type StreamEventTx = mpsc::UnboundedSender<(SocketId, StreamEvent)>;
/// Receiver half of a component's stream event channel.
pub type StreamEventRx = mpsc::UnboundedReceiver<(SocketId, StreamEvent)>;

/// A connected TCP socket split into reader/writer tasks.
///
/// The writer task starts immediately.  The reader task starts on
/// [`Stream::start_reading`], so a component can hold a socket without
/// consuming its input yet.  Dropping the stream aborts both tasks and
/// closes the socket.
pub struct Stream {
    id: SocketId,
    read_half: Option<OwnedReadHalf>,
    reader: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
    events: StreamEventTx,
    peer: Option<std::net::SocketAddr>,
}

impl Stream {
    /// Splits `stream` and spawns its writer task.  Must be called from
    /// within a tokio runtime.
    pub fn new(id: SocketId, stream: TcpStream, events: StreamEventTx) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (writes, write_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(id, write_half, write_rx, events.clone()));
        Self {
            id,
            read_half: Some(read_half),
            reader: None,
            writer,
            writes,
            events,
            peer,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.peer
    }

    /// Spawns the reader task.  Calling it again is a no-op.
    pub fn start_reading(&mut self) {
        if let Some(read_half) = self.read_half.take() {
            self.reader = Some(tokio::spawn(read_loop(
                self.id,
                read_half,
                self.events.clone(),
            )));
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reader.is_some()
    }

    /// Hands `bytes` to the writer task.  Completion is reported as
    /// [`StreamEvent::Written`] or [`StreamEvent::WriteFailed`].
    pub fn write(&self, bytes: Vec<u8>) {
        if self.writes.send(bytes).is_err() {
            // Writer already gone; it reported its own failure.
            debug!("stream {} writer closed, dropping buffer", self.id);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer.abort();
    }
}

async fn read_loop(id: SocketId, mut reader: OwnedReadHalf, events: StreamEventTx) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => StreamEvent::Closed,
            Ok(n) => {
                trace!("stream {id} read {n} bytes");
                StreamEvent::Data(buf[..n].to_vec())
            }
            Err(e) => StreamEvent::ReadFailed(e),
        };
        let done = !matches!(event, StreamEvent::Data(_));
        if events.send((id, event)).is_err() || done {
            break;
        }
    }
}

async fn write_loop(
    id: SocketId,
    mut writer: OwnedWriteHalf,
    mut buffers: mpsc::UnboundedReceiver<Vec<u8>>,
    events: StreamEventTx,
) {
    while let Some(bytes) = buffers.recv().await {
        let event = match writer.write_all(&bytes).await {
            Ok(()) => StreamEvent::Written,
            Err(e) => StreamEvent::WriteFailed(e),
        };
        let failed = matches!(event, StreamEvent::WriteFailed(_));
        if events.send((id, event)).is_err() || failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
