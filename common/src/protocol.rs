//! Protocol of the frame socket.
//!
//! Every message travels in its own length-delimited frame. A sender opens the connection with
//! `ConnectReq` naming the channel its frames belong to and then streams `FrameMsg`s carrying
//! JPEG-encoded camera frames.
use serde::{Deserialize, Serialize};

/// Definition of protocol messages.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtoMsg {
    ConnectReq(String),
    FrameMsg(FrameMsg),
}

/// One encoded camera frame of a named channel.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrameMsg {
    pub id: String,
    pub data: Vec<u8>,
}

impl FrameMsg {
    pub fn new(id: String, data: Vec<u8>) -> Self {
        Self { id, data }
    }
}

impl ProtoMsg {
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Box<bincode::ErrorKind>> {
        bincode::deserialize(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    /// Channel name this message is addressed to.
    pub fn channel(&self) -> &str {
        match self {
            ProtoMsg::ConnectReq(name) => name,
            ProtoMsg::FrameMsg(msg) => &msg.id,
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_frame_msg_through_bincode() -> Result<(), Error> {
        let msg = ProtoMsg::FrameMsg(FrameMsg::new("line-1".into(), vec![0xff, 0xd8, 0xff]));

        let serialized = msg.serialize()?;
        let deserialized = ProtoMsg::deserialize(&serialized)?;

        assert_eq!(msg, deserialized);
        assert_eq!(deserialized.channel(), "line-1");

        Ok(())
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ProtoMsg::deserialize(&[0xde, 0xad, 0xbe, 0xef, 0x01]).is_err());
    }
}
