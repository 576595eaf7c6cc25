//! Procedure numbers and typed argument/result shapes for the small
//! diagnostic surface `vmforge-agent` implements.
//!
//! This is deliberately not a generated per-action surface — it exists
//! only so the RPC framer has a couple of real procedures to exercise
//! end to end in integration tests, the same way a protocol crate ships
//! a handful of hand-written calls before codegen takes over.

use serde::{Deserialize, Serialize};

/// Echoes `nonce` back, proving a full request/reply round trip.
pub const PROC_PING: u32 = 0;
/// Reports the guest daemon's own version string.
pub const PROC_VERSION: u32 = 1;
/// Reports seconds since the guest daemon started.
pub const PROC_UPTIME: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UptimeResult {
    pub seconds: u64,
}
