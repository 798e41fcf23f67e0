use crate::frame::{FrameHeader, ProtocolVersion, RawFrame};
use crate::messages::Message;
use cloudgate_core::CloudgateError;

/// A frame with a decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub message: Message,
}

impl Frame {
    pub fn request(version: ProtocolVersion, stream_id: i16, message: Message) -> Self {
        Self {
            header: FrameHeader::request(version, stream_id, message.opcode()),
            message,
        }
    }

    pub fn response(version: ProtocolVersion, stream_id: i16, message: Message) -> Self {
        Self {
            header: FrameHeader::response(version, stream_id, message.opcode()),
            message,
        }
    }
}

/// Converts between raw frames and decoded frames. Handed to every
/// component that needs to look into a frame body.
pub trait FrameCodec: Send + Sync {
    fn decode(&self, raw: &RawFrame) -> Result<Frame, CloudgateError>;
    fn encode(&self, frame: &Frame) -> Result<RawFrame, CloudgateError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl FrameCodec for DefaultCodec {
    fn decode(&self, raw: &RawFrame) -> Result<Frame, CloudgateError> {
        if raw.header.is_compressed() {
            return Err(CloudgateError::NotSupported(
                "decoding compressed frames".into(),
            ));
        }
        let message = Message::decode(raw.header.opcode, raw.body.clone())?;
        Ok(Frame {
            header: raw.header,
            message,
        })
    }

    fn encode(&self, frame: &Frame) -> Result<RawFrame, CloudgateError> {
        if frame.header.opcode != frame.message.opcode() {
            return Err(CloudgateError::Protocol(format!(
                "header opcode {} does not match {} message",
                frame.header.opcode,
                frame.message.opcode()
            )));
        }
        let mut header = frame.header;
        header.flags &= !crate::frame::FLAG_COMPRESSION;
        Ok(RawFrame::new(header, frame.message.encode()?))
    }
}
