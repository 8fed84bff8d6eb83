use crate::close::{CloseCode, CloseState};
use crate::codec::HeaderPrefix;
use crate::connection::{ReadEvent, Role, Shared};
use crate::error::Error;
use crate::frame::OpCode;
use crate::mask::apply_mask;
use crate::message::MessageType;
use crate::utf8::{is_valid_utf8, Utf8Validator};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Per-connection background task: the only code path that ever reads off
/// the socket. Decodes frames, answers control frames inline, and forwards
/// data frames to whichever `MessageReader` currently holds the channel,
/// streaming bytes as they arrive rather than assembling a whole message
/// before handing it over, so a caller can bound memory use for large
/// messages.
pub(crate) fn spawn_read_pump(
    mut source: Box<dyn AsyncRead + Send + Unpin>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Result<ReadEvent, Error>>,
) {
    tokio::spawn(async move {
        if let Err(err) = run(&mut source, &shared, &tx).await {
            match &err {
                Error::Closed(..) => debug!("connection closed: {err}"),
                Error::Protocol(_) => {
                    warn!("protocol violation, tearing down connection: {err}");
                    send_best_effort_close(&shared, CloseCode::ProtocolError).await;
                }
                Error::InvalidPayload(_) => {
                    warn!("invalid payload, tearing down connection: {err}");
                    send_best_effort_close(&shared, CloseCode::InvalidFramePayloadData).await;
                }
                Error::MessageTooBig => {
                    warn!("message exceeds read limit, tearing down connection: {err}");
                    send_best_effort_close(&shared, CloseCode::MessageTooBig).await;
                }
                _ => error!("read pump failed: {err}"),
            }
            shared.latch_error(err.clone());
            let _ = tx.send(Err(err)).await;
        }
    });
}

/// Sends a Close frame for a violation this side detected itself, unless a
/// close is already underway (e.g. the peer's own Close raced ours). Errors
/// writing it are swallowed — the connection is already tearing down, and
/// the original violation is the error that matters to the caller.
async fn send_best_effort_close(shared: &Arc<Shared>, code: CloseCode) {
    if matches!(shared.close_state(), CloseState::Open) {
        shared.set_close_state(CloseState::CloseSending);
        let _ = shared.write_frame(true, OpCode::Close, &code.as_u16().to_be_bytes()).await;
        shared.set_close_state(CloseState::CloseSent);
    }
}

struct InProgress {
    kind: MessageType,
    validator: Option<Utf8Validator>,
    bytes_seen: usize,
}

async fn run(
    source: &mut (dyn AsyncRead + Send + Unpin),
    shared: &Arc<Shared>,
    tx: &mpsc::Sender<Result<ReadEvent, Error>>,
) -> Result<(), Error> {
    let mut in_progress: Option<InProgress> = None;

    loop {
        let header = match read_header(source).await {
            Ok(h) => h,
            Err(Error::Closed(code, reason)) => {
                shared.mark_close_received();
                return Err(Error::Closed(code, reason));
            }
            Err(err) => return Err(err),
        };

        trace!("frame received: opcode={:?} fin={} len={}", header.opcode, header.fin, header.payload_len);

        let expects_mask = shared.role() == Role::Server;
        if header.mask.is_some() != expects_mask {
            let msg = if expects_mask {
                "client frames must be masked"
            } else {
                "server frames must not be masked"
            };
            return Err(Error::Protocol(msg.into()));
        }

        if header.payload_len as usize > shared.max_frame_size() {
            return Err(Error::Protocol("frame exceeds configured max frame size".into()));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        if !payload.is_empty() {
            source
                .read_exact(&mut payload)
                .await
                .map_err(|_| Error::Protocol("eof while reading frame payload".into()))?;
        }
        if let Some(mask) = header.mask {
            apply_mask(mask, 0, &mut payload);
        }

        match header.opcode {
            OpCode::Ping => {
                shared.write_frame(true, OpCode::Pong, &payload).await?;
            }
            OpCode::Pong => {
                shared.ping_registry().resolve(&payload);
            }
            OpCode::Close => {
                // Always resolves to `Err(Error::Closed(..))`; the `?`
                // propagates it up to `spawn_read_pump`, which forwards it
                // to the last reader as the terminal event.
                handle_close_frame(&payload, shared).await?;
            }
            OpCode::Text | OpCode::Binary => {
                if in_progress.is_some() {
                    return Err(Error::Protocol("new message started before previous one finished".into()));
                }
                let kind = if header.opcode == OpCode::Text { MessageType::Text } else { MessageType::Binary };
                let mut validator = if kind == MessageType::Text { Some(Utf8Validator::new()) } else { None };
                if let Some(v) = validator.as_mut() {
                    if !v.push_slice(&payload) {
                        return Err(Error::InvalidPayload("text message is not valid UTF-8".into()));
                    }
                }
                let bytes_seen = payload.len();
                check_message_size(bytes_seen, shared)?;

                if send_event(tx, ReadEvent::MessageStart(kind)).await.is_err() {
                    return Ok(());
                }
                if !payload.is_empty() && send_event(tx, ReadEvent::Data(payload)).await.is_err() {
                    return Ok(());
                }

                if header.fin {
                    finish_message(tx, &mut validator).await?;
                } else {
                    in_progress = Some(InProgress { kind, validator, bytes_seen });
                }
            }
            OpCode::Continuation => {
                let state = in_progress.as_mut().ok_or_else(|| {
                    Error::Protocol("continuation frame without an active message".into())
                })?;

                if let Some(v) = state.validator.as_mut() {
                    if !v.push_slice(&payload) {
                        return Err(Error::InvalidPayload("text message is not valid UTF-8".into()));
                    }
                }
                state.bytes_seen += payload.len();
                check_message_size(state.bytes_seen, shared)?;

                if !payload.is_empty() && send_event(tx, ReadEvent::Data(payload)).await.is_err() {
                    return Ok(());
                }

                if header.fin {
                    let mut finished = in_progress.take().unwrap();
                    finish_message(tx, &mut finished.validator).await?;
                }
            }
        }
    }
}

fn check_message_size(bytes_seen: usize, shared: &Arc<Shared>) -> Result<(), Error> {
    if bytes_seen > shared.read_limit() {
        Err(Error::MessageTooBig)
    } else {
        Ok(())
    }
}

async fn finish_message(
    tx: &mpsc::Sender<Result<ReadEvent, Error>>,
    validator: &mut Option<Utf8Validator>,
) -> Result<(), Error> {
    if let Some(v) = validator {
        if !v.is_finished_cleanly() {
            return Err(Error::InvalidPayload("text message ended mid-codepoint".into()));
        }
    }
    let _ = send_event(tx, ReadEvent::MessageEnd).await;
    Ok(())
}

async fn send_event(tx: &mpsc::Sender<Result<ReadEvent, Error>>, event: ReadEvent) -> Result<(), ()> {
    tx.send(Ok(event)).await.map_err(|_| ())
}

async fn handle_close_frame(payload: &[u8], shared: &Arc<Shared>) -> Result<(), Error> {
    let (code, reason) = parse_close_payload(payload)?;
    debug!("peer sent close frame: {code:?} {reason:?}");

    let already_sent = !matches!(shared.close_state(), CloseState::Open);
    shared.mark_close_received();

    if !already_sent {
        shared.set_close_state(CloseState::CloseSending);
        let _ = shared.write_frame(true, OpCode::Close, payload).await;
        shared.set_close_state(CloseState::CloseSent);
    }

    Err(Error::Closed(code, reason))
}

fn parse_close_payload(payload: &[u8]) -> Result<(CloseCode, String), Error> {
    if payload.is_empty() {
        return Ok((CloseCode::NoStatusReceived, String::new()));
    }
    if payload.len() == 1 {
        return Err(Error::Protocol("close frame payload must be 0 or >=2 bytes".into()));
    }

    let raw_code = u16::from_be_bytes([payload[0], payload[1]]);
    let code = CloseCode::from_wire(raw_code)
        .ok_or_else(|| Error::Protocol(format!("invalid close code {raw_code}")))?;

    let reason_bytes = &payload[2..];
    if !is_valid_utf8(reason_bytes) {
        return Err(Error::InvalidPayload("close reason is not valid UTF-8".into()));
    }
    let reason = String::from_utf8_lossy(reason_bytes).into_owned();

    Ok((code, reason))
}

async fn read_header(
    source: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<crate::codec::FrameHeader, Error> {
    let mut prefix_bytes = [0u8; 2];

    let first = {
        let mut byte = [0u8; 1];
        let n = source.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Closed(CloseCode::AbnormalClosure, "peer closed without a close frame".into()));
        }
        byte[0]
    };
    prefix_bytes[0] = first;

    source
        .read_exact(&mut prefix_bytes[1..2])
        .await
        .map_err(|_| Error::Protocol("eof mid frame header".into()))?;

    let prefix = HeaderPrefix::parse(prefix_bytes)?;
    let extra_len = prefix.extra_len_bytes() + prefix.extra_mask_bytes();
    let mut extra = vec![0u8; extra_len];
    if extra_len > 0 {
        source
            .read_exact(&mut extra)
            .await
            .map_err(|_| Error::Protocol("eof mid frame header".into()))?;
    }

    prefix.finish(&extra)
}
