//! IPC error types

use std::net::SocketAddr;

/// Errors raised by the framing layer and the socket transport
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Socket is already bound to {0}")]
    AlreadyBound(SocketAddr),

    #[error("Socket is already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("Address {0} is already in use")]
    AddrInUse(SocketAddr),

    #[error("Channel disconnected")]
    Disconnected,
}

impl IpcError {
    /// Whether the error only affects the frame being decoded.
    ///
    /// The codec always consumes a whole frame before decoding it, so after a
    /// frame-local error the stream is still aligned on the next frame.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, IpcError::UnknownMessageType(_) | IpcError::Json(_))
    }
}

pub type IpcResult<T> = Result<T, IpcError>;
