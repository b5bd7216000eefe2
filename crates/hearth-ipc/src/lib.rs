//! Hearth IPC
//!
//! Wire protocol shared by the hub and its add-on processes:
//! - Message taxonomy and the JSON envelope every frame carries
//! - Length-prefixed frame codec
//! - `IpcSocket` transport with explicit bind/connect semantics
//! - Payload schemas for every message that carries structured data

pub mod codec;
pub mod error;
pub mod message;
pub mod schema;
pub mod socket;

pub use codec::{FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use error::{IpcError, IpcResult};
pub use message::{Message, MessageType};
pub use socket::{IpcConnection, IpcListener, IpcReceiver, IpcSender, IpcSocket};
