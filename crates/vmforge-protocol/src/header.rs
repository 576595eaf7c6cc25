//! The RPC message header carried inside every non-chunk frame.

use serde::{Deserialize, Serialize};

/// Fixed program identifier, analogous to an RPC program number.
pub const PROGRAM: u32 = 0x2000_4711;

/// Current wire version. Bumped whenever the envelope shape changes in
/// a way that is not forward compatible.
pub const VERSION: u32 = 1;

/// Sent by the guest daemon exactly once, right after both sockets are
/// connected, to signal the appliance is up. Observed on the channel
/// socket before any RPC framing begins.
pub const LAUNCH_FLAG: &[u8] = b"GUESTFS_READY\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Call,
    Reply,
}

/// Reply status, carried in the header of a reply frame. `Ok` and
/// `Error` terminate the call; `Progress`, `Log` and `Cancel` are
/// delivered as events without completing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
    Progress,
    Log,
    Cancel,
}

/// The fixed-shape header prefixing every request or reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub direction: Direction,
    pub serial: u64,
    /// Only meaningful on reply frames; requests always read `Ok` and
    /// ignore it.
    pub status: Status,
}

impl Header {
    pub fn request(procedure: u32, serial: u64) -> Self {
        Self {
            program: PROGRAM,
            version: VERSION,
            procedure,
            direction: Direction::Call,
            serial,
            status: Status::Ok,
        }
    }

    pub fn reply(procedure: u32, serial: u64, status: Status) -> Self {
        Self {
            program: PROGRAM,
            version: VERSION,
            procedure,
            direction: Direction::Reply,
            serial,
            status,
        }
    }
}

/// Error record carried in a reply frame with `status == Status::Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestError {
    pub errno: i32,
    pub message: String,
}

/// Progress record carried in an async-event reply frame with
/// `status == Status::Progress`, matching the original
/// `guestfs_progress` message's four fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub proc_nr: u32,
    pub serial: u64,
    pub position: u64,
    pub total: u64,
}

/// Log record carried in an async-event reply frame with
/// `status == Status::Log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub text: String,
}
