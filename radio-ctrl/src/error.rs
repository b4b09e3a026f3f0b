use std::fmt::Debug;

use crate::ctrl::message::MessageError;
use crate::device::frame::FrameError;
use crate::security::SecError;
use crate::storage::StorageError;

/// Error taxonomy of the control protocol, generic over the error type of the
/// underlying transport.
#[derive(thiserror::Error, Debug)]
pub enum CtrlError<E: Debug> {
    #[error("invalid argument: {context}")]
    InvalidArgument { context: String },

    /// No acknowledgment arrived within the retry and channel-search budget,
    /// or a lock on the radio channel could not be taken in time.
    #[error("operation timed out")]
    Timeout,

    #[error("underlying transport error: {0:?}")]
    Transport(E),

    #[error("malformed frame")]
    Frame(#[from] FrameError),

    #[error("malformed control message")]
    Message(#[from] MessageError),

    #[error("security error")]
    Security(#[from] SecError),

    #[error("persistence error")]
    Persistence(#[from] StorageError),
}
