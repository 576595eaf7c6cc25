//! Request and reply envelopes: the header plus the bincode-encoded
//! body that together make up one frame's payload.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::header::{GuestError, Header, LogMessage, Progress, Status};

/// A request frame's payload: header, then the two fixed XDR-derived
/// fields every call carries, then the procedure's own arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope<A> {
    pub header: Header,
    pub progress_hint: u64,
    pub optargs_bitmask: u64,
    pub args: A,
}

impl<A> RequestEnvelope<A> {
    pub fn new(procedure: u32, serial: u64, optargs_bitmask: u64, args: A) -> Self {
        Self {
            header: Header::request(procedure, serial),
            progress_hint: 0,
            optargs_bitmask,
            args,
        }
    }
}

/// A reply frame's body, discriminated by the header's status field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyBody<R> {
    Ok(R),
    Error(GuestError),
    Progress(Progress),
    Log(LogMessage),
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope<R> {
    pub header: Header,
    pub body: ReplyBody<R>,
}

impl<R> ReplyEnvelope<R> {
    pub fn ok(procedure: u32, serial: u64, result: R) -> Self {
        Self {
            header: Header::reply(procedure, serial, Status::Ok),
            body: ReplyBody::Ok(result),
        }
    }

    pub fn error(procedure: u32, serial: u64, errno: i32, message: impl Into<String>) -> Self {
        Self {
            header: Header::reply(procedure, serial, Status::Error),
            body: ReplyBody::Error(GuestError {
                errno,
                message: message.into(),
            }),
        }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct PingArgs {
        nonce: u64,
    }

    #[test]
    fn request_envelope_roundtrips_through_bincode() {
        let env = RequestEnvelope::new(1, 0xC0FF_EE00, 0, PingArgs { nonce: 42 });
        let bytes = encode(&env).unwrap();
        let decoded: RequestEnvelope<PingArgs> = decode(&bytes).unwrap();
        assert_eq!(decoded.header.serial, 0xC0FF_EE00);
        assert_eq!(decoded.args, PingArgs { nonce: 42 });
    }

    #[test]
    fn reply_envelope_error_variant_roundtrips() {
        let env: ReplyEnvelope<()> = ReplyEnvelope::error(1, 7, 2, "No such file or directory");
        let bytes = encode(&env).unwrap();
        let decoded: ReplyEnvelope<()> = decode(&bytes).unwrap();
        match decoded.body {
            ReplyBody::Error(e) => {
                assert_eq!(e.errno, 2);
                assert_eq!(e.message, "No such file or directory");
            }
            _ => panic!("expected error body"),
        }
    }
}
