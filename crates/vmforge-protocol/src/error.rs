//! Errors specific to wire framing, separate from [`vmforge_core::Error`]
//! because a framing failure is always fatal for the current call and
//! callers need to distinguish it from a decoded guest error.

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("frame payload of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("failed to encode frame payload: {0}")]
    Encode(String),

    #[error("failed to decode frame payload: {0}")]
    Decode(String),

    #[error("reply serial {got} does not match outstanding call serial {expected}")]
    SerialMismatch { expected: u64, got: u64 },

    #[error("channel closed before a reply arrived")]
    ChannelClosed,

    /// A reply frame with `status == Status::Error`: the call reached the
    /// guest and was rejected there, as opposed to a framing failure.
    /// Kept distinct from the other variants so callers can tell a guest
    /// error (state stays READY) from a transport error (fatal for the
    /// current launch).
    #[error("guest error (errno {errno}): {message}")]
    Guest { errno: i32, message: String },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<ProtocolError> for vmforge_core::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Guest { errno, message } => vmforge_core::Error::Guest { errno, message },
            other => vmforge_core::Error::Protocol(other.to_string()),
        }
    }
}
