//! The host/guest wire protocol: length-prefixed frames, a bincode
//! envelope carrying a header plus procedure arguments, and the
//! strictly request-reply channel semantics built on top of both.
//!
//! This replaces a tarpc-style opaque transport on purpose: this
//! channel needs first-class progress/log/cancel frames interleaved
//! with a single outstanding call, and a raw file-chunk streaming
//! mode, neither of which map cleanly onto tarpc's request/response
//! model.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod header;
pub mod procedures;
pub mod serial;

pub use channel::{recv, recv_file, recv_request, send_reply, AsyncEvent, EventSink, Framer, NullSink};
pub use envelope::{decode, encode, ReplyBody, ReplyEnvelope, RequestEnvelope};
pub use error::{ProtocolError, Result};
pub use frame::{read_frame, write_frame, FrameKind, MAX_FILE_CHUNK, MAX_FRAME_PAYLOAD};
pub use header::{
    Direction, GuestError, Header, LogMessage, Progress, Status, LAUNCH_FLAG, PROGRAM, VERSION,
};
pub use procedures::{
    PingArgs, PingResult, UptimeResult, VersionResult, PROC_PING, PROC_UPTIME, PROC_VERSION,
};
pub use serial::{SerialAllocator, INITIAL_SERIAL};
