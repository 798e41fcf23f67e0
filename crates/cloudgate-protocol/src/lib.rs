pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{DefaultCodec, Frame, FrameCodec};
pub use frame::{read_raw_frame, write_raw_frame, FrameHeader, OpCode, ProtocolVersion, RawFrame};
pub use messages::{ErrorMessage, Message, ResultMessage};

#[cfg(test)]
mod tests;
