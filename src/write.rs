use crate::codec::encode_header;
use crate::connection::Role;
use crate::error::Error;
use crate::frame::OpCode;
use crate::mask::apply_mask;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// The single point through which every frame reaches the wire. Held behind
/// a `tokio::sync::Mutex` by the connection so at most one frame is ever
/// mid-write at a time: control frames sent by the read pump (Pong
/// replies, the Close echo) and application data share this same lock,
/// which is what lets them interleave safely instead of corrupting the
/// stream.
pub(crate) struct Writer<T> {
    sink: T,
    role: Role,
}

impl<T> Writer<T>
where
    T: AsyncWrite + Unpin,
{
    pub fn new(sink: T, role: Role) -> Self {
        Self { sink, role }
    }

    pub async fn write_frame(&mut self, fin: bool, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        let mut out = Vec::with_capacity(payload.len() + 14);

        match self.role {
            Role::Server => {
                encode_header(fin, opcode, None, payload.len() as u64, &mut out);
                out.extend_from_slice(payload);
            }
            Role::Client => {
                let mut rng = StdRng::from_rng(rand::thread_rng()).map_err(|e| Error::Io(e.to_string()))?;
                let key = [rng.random::<u8>(), rng.random::<u8>(), rng.random::<u8>(), rng.random::<u8>()];
                encode_header(fin, opcode, Some(key), payload.len() as u64, &mut out);
                let body_start = out.len();
                out.extend_from_slice(payload);
                apply_mask(key, 0, &mut out[body_start..]);
            }
        }

        self.sink.write_all(&out).await?;
        self.sink.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HeaderPrefix;

    #[tokio::test]
    async fn server_frames_are_unmasked_on_wire() {
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf, Role::Server);
            writer.write_frame(true, OpCode::Text, b"hi").await.unwrap();
        }
        let prefix = HeaderPrefix::parse([buf[0], buf[1]]).unwrap();
        assert!(!prefix.masked);
        assert_eq!(&buf[2..], b"hi");
    }

    #[tokio::test]
    async fn client_frames_are_masked_on_wire() {
        let mut buf = Vec::new();
        {
            let mut writer = Writer::new(&mut buf, Role::Client);
            writer.write_frame(true, OpCode::Text, b"hello").await.unwrap();
        }
        let prefix = HeaderPrefix::parse([buf[0], buf[1]]).unwrap();
        assert!(prefix.masked);
        let extra = prefix.extra_len_bytes() + prefix.extra_mask_bytes();
        let header = prefix.finish(&buf[2..2 + extra]).unwrap();
        let mask = header.mask.unwrap();
        let mut payload = buf[2 + extra..].to_vec();
        apply_mask(mask, 0, &mut payload);
        assert_eq!(payload, b"hello");
    }
}
