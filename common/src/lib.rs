//! Common code shared between the detection server and the camera sender.
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
