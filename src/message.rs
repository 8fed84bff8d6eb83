use crate::connection::{with_deadline, ReadEvent, Shared};
use crate::error::Error;
use crate::frame::OpCode;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedMutexGuard, OwnedSemaphorePermit};
use tokio::time::{Duration, Instant};

const ABNORMAL_WRITE_CANCELLATION: &str = "write cancelled mid-message, connection poisoned";

/// Which kind of message a [`MessageReader`] just started, or a
/// [`MessageWriter`] is about to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

/// The single active reader handle for a connection. Acquiring one suspends
/// until any previously acquired handle is dropped (`Connection::reader`
/// holds the read channel's `OwnedMutexGuard` for exactly that long); within
/// one handle, [`MessageReader::next_message`] refuses to start a new
/// message until the previous one's [`ByteStream`] has been drained to
/// completion, per the connection's single-reader invariant.
pub struct MessageReader {
    pub(crate) shared: Arc<Shared>,
    pub(crate) guard: OwnedMutexGuard<mpsc::Receiver<Result<ReadEvent, Error>>>,
    pub(crate) active: bool,
}

impl MessageReader {
    async fn recv_event(&mut self) -> Result<Option<ReadEvent>, Error> {
        match self.guard.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Waits for the next message to begin, up to `deadline`. Returns
    /// `Ok(None)` once the connection has reached a terminal state with
    /// nothing further to deliver. A timeout returns
    /// [`Error::DeadlineExceeded`] without disturbing the read pump or this
    /// reader's state — the message that was waited for, if any, is still
    /// there for the next call.
    pub async fn next_message(
        &mut self,
        deadline: Option<Duration>,
    ) -> Result<Option<(MessageType, ByteStream<'_>)>, Error> {
        if self.active {
            return Err(Error::Usage(
                "previous message body must be fully read before starting the next one",
            ));
        }

        match with_deadline(self.recv_event(), deadline).await? {
            Some(ReadEvent::MessageStart(kind)) => {
                self.active = true;
                Ok(Some((kind, ByteStream { reader: self })))
            }
            Some(_) => Err(Error::Protocol("read pump produced an out-of-order event".into())),
            None => Ok(None),
        }
    }

    /// Convenience combining [`MessageReader::next_message`] and
    /// [`ByteStream::read_to_end`]: waits for the next message and returns
    /// its type and fully assembled body together. `deadline` bounds the
    /// whole call, including draining the body.
    pub async fn read_full(&mut self, deadline: Option<Duration>) -> Result<Option<(MessageType, Vec<u8>)>, Error> {
        let deadline_at = deadline.map(|d| Instant::now() + d);
        match self.next_message(deadline).await? {
            Some((kind, stream)) => {
                let remaining = deadline_at.map(|at| at.saturating_duration_since(Instant::now()));
                Ok(Some((kind, stream.read_to_end(remaining).await?)))
            }
            None => Ok(None),
        }
    }
}

/// A lazily-pulled view over the body of the message currently being read.
/// Borrowed from the [`MessageReader`] that produced it; dropping it without
/// calling [`ByteStream::read_to_end`] (or draining via `read_chunk` to
/// `None`) leaves the reader in the "active" state, so the next
/// `next_message` call returns a usage error rather than silently
/// discarding unread bytes.
pub struct ByteStream<'a> {
    reader: &'a mut MessageReader,
}

impl<'a> ByteStream<'a> {
    /// Pulls the next chunk of the message body as it arrives off the wire,
    /// up to `deadline`. Returns `Ok(None)` once the message's final
    /// fragment has been consumed. A timeout returns
    /// [`Error::DeadlineExceeded`] without aborting the read pump; the
    /// reader stays active so a later call picks up where this one left
    /// off.
    pub async fn read_chunk(&mut self, deadline: Option<Duration>) -> Result<Option<Vec<u8>>, Error> {
        match with_deadline(self.reader.recv_event(), deadline).await? {
            Some(ReadEvent::Data(chunk)) => Ok(Some(chunk)),
            Some(ReadEvent::MessageEnd) => {
                self.reader.active = false;
                Ok(None)
            }
            Some(_) => Err(Error::Protocol("read pump produced an out-of-order event".into())),
            None => {
                self.reader.active = false;
                Ok(None)
            }
        }
    }

    /// Drains the rest of the message body into one buffer. `deadline`, if
    /// given, bounds the whole call rather than each individual chunk.
    pub async fn read_to_end(mut self, deadline: Option<Duration>) -> Result<Vec<u8>, Error> {
        let deadline_at = deadline.map(|d| Instant::now() + d);
        let mut buf = Vec::new();
        loop {
            let remaining = deadline_at.map(|at| at.saturating_duration_since(Instant::now()));
            match self.read_chunk(remaining).await? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => break,
            }
        }
        Ok(buf)
    }
}

/// The single active writer handle for a connection, backed by a semaphore
/// permit so a second call to `Connection::writer` suspends until this one
/// is dropped.
pub struct MessageWriter {
    pub(crate) shared: Arc<Shared>,
    pub(crate) _permit: OwnedSemaphorePermit,
}

impl MessageWriter {
    /// Sends a complete message in one frame, up to `deadline`. A timeout
    /// before the write starts (still waiting on the write lock) is
    /// reported as a plain [`Error::DeadlineExceeded`] and the connection
    /// stays usable; a timeout once the frame is underway is fatal, since
    /// the frame may have landed on the wire partially.
    pub async fn send(&mut self, kind: MessageType, data: &[u8], deadline: Option<Duration>) -> Result<(), Error> {
        let opcode = match kind {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
        };
        self.shared.write_frame_with_deadline(true, opcode, data, deadline).await
    }

    /// Starts a streamed, multi-frame message. The returned [`WriteSink`]
    /// must be finished with [`WriteSink::finish`]; dropping it beforehand
    /// poisons the connection rather than silently leaving a half-sent
    /// message on the wire.
    pub fn write_message(&mut self, kind: MessageType) -> WriteSink<'_> {
        let opcode = match kind {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
        };
        WriteSink {
            writer: self,
            opcode,
            started: false,
            in_flight: false,
            closed: false,
        }
    }
}

/// A streamed write in progress. Each [`WriteSink::write_chunk`] call
/// flushes one frame; [`WriteSink::finish`] sends the final (`fin=1`)
/// frame — possibly empty, if nothing was ever written.
pub struct WriteSink<'a> {
    writer: &'a mut MessageWriter,
    opcode: OpCode,
    started: bool,
    in_flight: bool,
    closed: bool,
}

impl<'a> WriteSink<'a> {
    /// Flushes one frame of the streamed message, up to `deadline`. Same
    /// before/after-the-write fatality split as [`MessageWriter::send`].
    pub async fn write_chunk(&mut self, data: &[u8], deadline: Option<Duration>) -> Result<(), Error> {
        self.in_flight = true;
        let opcode = if self.started { OpCode::Continuation } else { self.opcode };
        self.writer.shared.write_frame_with_deadline(false, opcode, data, deadline).await?;
        self.started = true;
        self.in_flight = false;
        Ok(())
    }

    /// Sends the final frame and consumes the sink, so `Drop` can no longer
    /// observe it as incomplete.
    pub async fn finish(mut self, deadline: Option<Duration>) -> Result<(), Error> {
        self.in_flight = true;
        let opcode = if self.started { OpCode::Continuation } else { self.opcode };
        self.writer.shared.write_frame_with_deadline(true, opcode, &[], deadline).await?;
        self.closed = true;
        Ok(())
    }
}

impl<'a> Drop for WriteSink<'a> {
    fn drop(&mut self) {
        if (self.started || self.in_flight) && !self.closed {
            let shared = Arc::clone(&self.writer.shared);
            shared.latch_error(Error::Protocol(ABNORMAL_WRITE_CANCELLATION.into()));
            tokio::spawn(async move {
                let _ = shared.write_frame(true, OpCode::Close, &1011u16.to_be_bytes()).await;
            });
        }
    }
}
