//! Length-prefixed frame codec
//!
//! Frame layout: `[u32 BE length][u8 message type][JSON envelope]`, where the
//! length counts the type byte plus the envelope.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IpcError, IpcResult};
use crate::message::Message;

/// Largest frame either side accepts (16 MiB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes framed messages to an async byte sink
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one message as a single frame
    pub async fn write(&mut self, msg: &Message) -> IpcResult<()> {
        let envelope = msg.encode_envelope()?;
        let len = 1 + envelope.len();
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        self.inner.write_all(&(len as u32).to_be_bytes()).await?;
        self.inner.write_all(&[msg.msg_type as u8]).await?;
        self.inner.write_all(&envelope).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> IpcResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads framed messages from an async byte source
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary.
    pub async fn read(&mut self) -> IpcResult<Option<Message>> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(IpcError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        // Read message type (1 byte)
        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;

        // Read envelope before decoding so a bad frame leaves the stream aligned
        let mut envelope = vec![0u8; len - 1];
        if !envelope.is_empty() {
            self.inner.read_exact(&mut envelope).await?;
        }

        Message::decode(type_buf[0], &envelope).map(Some)
    }
}
