use crate::close::{CloseCode, CloseState};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::OpCode;
use crate::message::{MessageReader, MessageType, MessageWriter};
use crate::ping::PingRegistry;
use crate::write::Writer;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, Semaphore};
use tokio::time::{timeout, timeout_at, Duration, Instant};

/// Which side of the handshake this connection came from. Masking rules
/// (and nothing else about frame handling) differ by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Events the read pump hands to whichever [`MessageReader`] currently owns
/// the channel. Control frames (ping/pong/close) never appear here — the
/// pump answers them itself.
pub(crate) enum ReadEvent {
    MessageStart(MessageType),
    Data(Vec<u8>),
    MessageEnd,
}

type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the `Connection` handle, every `MessageReader`/
/// `MessageWriter` it hands out, and the background read pump. Nothing here
/// is public; it exists so all of those can agree on one write mutex, one
/// latched fatal error, and one close state machine.
pub(crate) struct Shared {
    writer: AsyncMutex<Writer<BoxedSink>>,
    write_semaphore: Arc<Semaphore>,
    read_rx: Arc<AsyncMutex<mpsc::Receiver<Result<ReadEvent, Error>>>>,
    ping_registry: PingRegistry,
    close_state: StdMutex<CloseState>,
    close_received: AtomicBool,
    close_notify: Notify,
    latched_error: StdMutex<Option<Arc<Error>>>,
    role: Role,
    read_limit: AtomicUsize,
    max_frame_size: usize,
    close_grace_period: Duration,
    subprotocol: Option<String>,
}

impl Shared {
    pub(crate) async fn write_frame(&self, fin: bool, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        self.write_frame_with_deadline(fin, opcode, payload, None).await
    }

    /// Writes a frame, optionally bounded by a single deadline spanning both
    /// "wait for the write lock" and "push the frame onto the wire". A
    /// timeout while still waiting for the lock means nothing has been
    /// written yet, so it's reported as a plain, non-fatal
    /// [`Error::DeadlineExceeded`]. A timeout once the write is underway
    /// means the frame may have landed on the wire partially — the stream's
    /// framing can no longer be trusted, so that case latches a fatal error
    /// and poisons the connection, same as any other write failure.
    pub(crate) async fn write_frame_with_deadline(
        &self,
        fin: bool,
        opcode: OpCode,
        payload: &[u8],
        deadline: Option<Duration>,
    ) -> Result<(), Error> {
        if let Some(err) = self.latched_error() {
            return Err((*err).clone());
        }

        let deadline = deadline.map(|d| Instant::now() + d);

        let mut writer = match deadline {
            Some(at) => match timeout_at(at, self.writer.lock()).await {
                Ok(guard) => guard,
                Err(_) => return Err(Error::DeadlineExceeded),
            },
            None => self.writer.lock().await,
        };

        let result = match deadline {
            Some(at) => match timeout_at(at, writer.write_frame(fin, opcode, payload)).await {
                Ok(inner) => inner,
                Err(_) => Err(Error::Protocol("write cancelled mid-frame, connection poisoned".into())),
            },
            None => writer.write_frame(fin, opcode, payload).await,
        };

        if let Err(ref err) = result {
            self.latch_error(err.clone());
        }
        result
    }

    pub(crate) fn latched_error(&self) -> Option<Arc<Error>> {
        self.latched_error.lock().unwrap().clone()
    }

    pub(crate) fn latch_error(&self, err: Error) {
        let mut guard = self.latched_error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Arc::new(err));
        }
    }

    pub(crate) fn read_limit(&self) -> usize {
        self.read_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn ping_registry(&self) -> &PingRegistry {
        &self.ping_registry
    }

    pub(crate) fn mark_close_received(&self) {
        self.close_received.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub(crate) fn close_state(&self) -> CloseState {
        *self.close_state.lock().unwrap()
    }

    pub(crate) fn set_close_state(&self, state: CloseState) {
        *self.close_state.lock().unwrap() = state;
    }
}

/// A live WebSocket connection. Cheap to clone-by-reference internally (the
/// handle itself is not `Clone` — acquire a [`MessageReader`]/
/// [`MessageWriter`] instead, which is how the single-reader/single-writer
/// invariant is enforced).
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(
        sink: BoxedSink,
        role: Role,
        config: &WebSocketConfig,
        subprotocol: Option<String>,
    ) -> (Self, mpsc::Sender<Result<ReadEvent, Error>>) {
        let (tx, rx) = mpsc::channel(32);
        let shared = Arc::new(Shared {
            writer: AsyncMutex::new(Writer::new(sink, role)),
            write_semaphore: Arc::new(Semaphore::new(1)),
            read_rx: Arc::new(AsyncMutex::new(rx)),
            ping_registry: PingRegistry::new(),
            close_state: StdMutex::new(CloseState::Open),
            close_received: AtomicBool::new(false),
            close_notify: Notify::new(),
            latched_error: StdMutex::new(None),
            role,
            read_limit: AtomicUsize::new(config.max_message_size),
            max_frame_size: config.max_frame_size,
            close_grace_period: config.close_grace_period,
            subprotocol,
        });
        (Self { shared }, tx)
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.subprotocol.as_deref()
    }

    /// Raises or lowers the read-side message size limit after the
    /// connection is already established (e.g. once a client has
    /// authenticated and a larger limit is appropriate).
    pub fn set_read_limit(&self, limit: usize) {
        self.shared.read_limit.store(limit, Ordering::Relaxed);
    }

    /// Acquires the connection's single reader handle, suspending until any
    /// previously acquired handle has been dropped.
    pub async fn reader(&self) -> MessageReader {
        let guard = Arc::clone(&self.shared.read_rx).lock_owned().await;
        MessageReader {
            shared: Arc::clone(&self.shared),
            guard,
            active: false,
        }
    }

    /// Acquires the connection's single writer handle, suspending until any
    /// previously acquired handle has been dropped.
    pub async fn writer(&self) -> Result<MessageWriter, Error> {
        let permit = Arc::clone(&self.shared.write_semaphore).acquire_owned().await?;
        Ok(MessageWriter { shared: Arc::clone(&self.shared), _permit: permit })
    }

    /// One-shot convenience wrapping [`Connection::reader`] +
    /// [`MessageReader::read_full`]: acquires the reader, waits for the
    /// next message, and returns its type and fully assembled body
    /// together. `deadline` bounds the whole call.
    pub async fn read(&self, deadline: Option<Duration>) -> Result<Option<(MessageType, Vec<u8>)>, Error> {
        let mut reader = self.reader().await;
        reader.read_full(deadline).await
    }

    /// One-shot convenience wrapping [`Connection::writer`] +
    /// [`MessageWriter::send`]: acquires the writer and sends a complete
    /// message in one frame, up to `deadline`.
    pub async fn write(&self, kind: MessageType, data: &[u8], deadline: Option<Duration>) -> Result<(), Error> {
        let mut writer = self.writer().await?;
        writer.send(kind, data, deadline).await
    }

    /// Sends a Ping and waits for the matching Pong, up to `deadline` (no
    /// deadline waits indefinitely, bounded only by the connection itself
    /// closing).
    pub async fn ping(&self, payload: Vec<u8>, deadline: Option<Duration>) -> Result<(), Error> {
        let rx = self.shared.ping_registry.register(payload.clone());
        self.shared.write_frame(true, OpCode::Ping, &payload).await?;
        with_deadline(async { rx.await.map_err(|_| Error::Cancelled) }, deadline).await?
    }

    /// Initiates (or completes, if the peer already sent theirs) the close
    /// handshake. `reason` must be short enough that `2 + reason.len() <=
    /// 125`; longer reasons are truncated at a UTF-8 boundary.
    pub async fn close(&self, code: CloseCode, reason: &str, deadline: Option<Duration>) -> Result<(), Error> {
        {
            let mut state = self.shared.close_state.lock().unwrap();
            if *state != CloseState::Open {
                return Ok(());
            }
            *state = CloseState::CloseSending;
        }

        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.as_u16().to_be_bytes());
        let max_reason = 123usize.min(reason.len());
        let mut cut = max_reason;
        while cut > 0 && !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.extend_from_slice(reason[..cut].as_bytes());

        debug!("initiating close handshake: {code:?} {reason:?}");
        self.shared.write_frame(true, OpCode::Close, &payload).await?;
        *self.shared.close_state.lock().unwrap() = CloseState::CloseSent;

        let grace = deadline.unwrap_or(self.shared.close_grace_period);
        if self.shared.close_received.load(Ordering::SeqCst) {
            return Ok(());
        }
        if timeout(grace, self.shared.close_notify.notified()).await.is_err() {
            warn!("peer did not echo close within the grace period, tearing down unilaterally");
        }
        self.shared.ping_registry.clear();
        Ok(())
    }
}

/// Wraps a future with an optional deadline — `None` means "no deadline",
/// which keeps call sites that rarely set one from threading a full
/// cancellation-token type through every signature.
pub(crate) async fn with_deadline<F, T>(fut: F, deadline: Option<Duration>) -> Result<T, Error>
where
    F: std::future::Future<Output = Result<T, Error>>,
{
    match deadline {
        Some(d) => timeout(d, fut).await?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_header;
    use crate::read::spawn_read_pump;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Builds a `Connection` whose peer is the other end of an in-memory
    /// duplex pipe, skipping the HTTP handshake entirely. Used to drive the
    /// read pump with hand-built frame bytes.
    fn connection_over_duplex(role: Role) -> (Connection, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(ours);
        let config = WebSocketConfig::default();
        let (connection, tx) = Connection::new(Box::new(write_half), role, &config, None);
        spawn_read_pump(Box::new(read_half), connection.shared(), tx);
        (connection, theirs)
    }

    /// Reads one unmasked frame header + payload off `peer` and returns
    /// `(opcode, payload)`. Used to confirm the connection wrote a
    /// best-effort Close frame of its own accord after a locally-detected
    /// violation, not just that the local error came back.
    async fn read_server_frame(peer: &mut tokio::io::DuplexStream) -> (OpCode, Vec<u8>) {
        let mut header = [0u8; 2];
        peer.read_exact(&mut header).await.unwrap();
        let opcode = OpCode::from_u8(header[0] & 0x0f).unwrap();
        let len = (header[1] & 0x7f) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            peer.read_exact(&mut payload).await.unwrap();
        }
        (opcode, payload)
    }

    #[tokio::test]
    async fn rsv1_bit_is_rejected_as_protocol_error() {
        let (connection, mut peer) = connection_over_duplex(Role::Server);
        // fin=1, rsv1=1, opcode=Text; masked, zero-length payload, mask key 0.
        let raw = [0b1100_0001u8, 0x80, 0, 0, 0, 0];
        peer.write_all(&raw).await.unwrap();

        let mut reader = connection.reader().await;
        let err = reader.next_message(None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let (opcode, payload) = read_server_frame(&mut peer).await;
        assert_eq!(opcode, OpCode::Close);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), CloseCode::ProtocolError.as_u16());
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let mut config = WebSocketConfig::default();
        config.max_message_size = 8;
        config.max_frame_size = 1024;
        let (ours, mut peer) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(ours);
        let (connection, tx) = Connection::new(Box::new(write_half), Role::Server, &config, None);
        spawn_read_pump(Box::new(read_half), connection.shared(), tx);

        let payload = vec![b'x'; 16];
        let mut frame = Vec::new();
        encode_header(true, OpCode::Binary, Some([0, 0, 0, 0]), payload.len() as u64, &mut frame);
        frame.extend_from_slice(&payload);
        peer.write_all(&frame).await.unwrap();

        let mut reader = connection.reader().await;
        let err = reader.next_message(None).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooBig));

        let (opcode, close_payload) = read_server_frame(&mut peer).await;
        assert_eq!(opcode, OpCode::Close);
        assert_eq!(u16::from_be_bytes([close_payload[0], close_payload[1]]), CloseCode::MessageTooBig.as_u16());
    }

    #[tokio::test]
    async fn text_message_round_trips_through_reader_and_writer() {
        let (connection, mut peer) = connection_over_duplex(Role::Server);

        let payload = b"hello";
        let mut frame = Vec::new();
        encode_header(true, OpCode::Text, Some([1, 2, 3, 4]), payload.len() as u64, &mut frame);
        let mut masked_payload = payload.to_vec();
        crate::mask::apply_mask([1, 2, 3, 4], 0, &mut masked_payload);
        frame.extend_from_slice(&masked_payload);
        peer.write_all(&frame).await.unwrap();

        let mut reader = connection.reader().await;
        let (kind, stream) = reader.next_message(None).await.unwrap().unwrap();
        assert_eq!(kind, MessageType::Text);
        let body = stream.read_to_end(None).await.unwrap();
        assert_eq!(body, payload);

        let mut writer = connection.writer().await.unwrap();
        writer.send(MessageType::Text, b"world", None).await.unwrap();

        let mut reply_header = [0u8; 2];
        peer.read_exact(&mut reply_header).await.unwrap();
        assert_eq!(reply_header[0], 0b1000_0001);
        let len = (reply_header[1] & 0x7f) as usize;
        let mut reply_payload = vec![0u8; len];
        peer.read_exact(&mut reply_payload).await.unwrap();
        assert_eq!(&reply_payload, b"world");
    }
}
