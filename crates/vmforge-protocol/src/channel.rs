//! The strictly request-reply channel: one outstanding call at a time,
//! built on top of the length-prefixed frame layer.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::envelope::{decode, encode, ReplyBody, ReplyEnvelope, RequestEnvelope};
use crate::error::{ProtocolError, Result};
use crate::frame::{read_frame, write_frame, FrameKind, MAX_FILE_CHUNK};
use crate::header::{LogMessage, Progress, Status};
use crate::serial::SerialAllocator;

/// Progress, log and cancel notifications delivered out of band while
/// waiting for a reply.
#[derive(Debug, Clone)]
pub enum AsyncEvent {
    Progress(Progress),
    Log(LogMessage),
    Cancel,
}

/// Receives async events while a call is outstanding. Implemented by
/// any `FnMut(AsyncEvent)`.
pub trait EventSink {
    fn on_event(&mut self, event: AsyncEvent);
}

impl<F: FnMut(AsyncEvent)> EventSink for F {
    fn on_event(&mut self, event: AsyncEvent) {
        self(event)
    }
}

/// A no-op sink for callers that don't care about async events.
pub struct NullSink;
impl EventSink for NullSink {
    fn on_event(&mut self, _event: AsyncEvent) {}
}

/// Owns serial allocation for one direction of the channel. A full
/// duplex connection uses one `Framer` for the call side.
pub struct Framer {
    serials: SerialAllocator,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            serials: SerialAllocator::new(),
        }
    }

    /// Sends one request frame and returns the serial it was sent with,
    /// so the caller can match the eventual reply.
    pub async fn send<W, A>(&self, writer: &mut W, procedure: u32, optargs_bitmask: u64, args: A) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
        A: Serialize,
    {
        let serial = self.serials.next();
        let envelope = RequestEnvelope::new(procedure, serial, optargs_bitmask, args);
        let payload = encode(&envelope)?;
        write_frame(writer, FrameKind::Data, &payload).await?;
        Ok(serial)
    }

    /// Streams `data` as a sequence of file-chunk frames, ending with
    /// the EOF-bit frame.
    pub async fn send_file<W>(writer: &mut W, mut data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let take = data.len().min(MAX_FILE_CHUNK);
            let (chunk, rest) = data.split_at(take);
            let kind = if rest.is_empty() {
                FrameKind::Eof
            } else {
                FrameKind::Data
            };
            write_frame(writer, kind, chunk).await?;
            if rest.is_empty() {
                break;
            }
            data = rest;
        }
        Ok(())
    }
}

/// Reads frames until a reply/error frame matching `expected_serial`
/// arrives, delivering progress/log/cancel frames to `sink` along the
/// way. A reply whose serial doesn't match is a protocol violation.
pub async fn recv<R, T>(
    reader: &mut R,
    expected_serial: u64,
    mut sink: impl EventSink,
) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let (kind, payload) = read_frame(reader)
            .await?
            .ok_or(ProtocolError::ChannelClosed)?;
        if kind != FrameKind::Data {
            return Err(ProtocolError::Decode(
                "unexpected EOF-bit frame outside file streaming".to_string(),
            ));
        }
        let envelope: ReplyEnvelope<T> = decode(&payload)?;
        if envelope.header.serial != expected_serial {
            return Err(ProtocolError::SerialMismatch {
                expected: expected_serial,
                got: envelope.header.serial,
            });
        }
        match envelope.body {
            ReplyBody::Ok(result) => return Ok(result),
            ReplyBody::Error(err) => {
                return Err(ProtocolError::Guest {
                    errno: err.errno,
                    message: err.message,
                })
            }
            ReplyBody::Progress(p) => sink.on_event(AsyncEvent::Progress(p)),
            ReplyBody::Log(l) => sink.on_event(AsyncEvent::Log(l)),
            ReplyBody::Cancel => sink.on_event(AsyncEvent::Cancel),
        }
    }
}

/// Server-side half: reads one request frame and decodes it. Returns
/// `None` on a clean channel close, which the caller treats as "the
/// host hung up".
pub async fn recv_request<R, A>(reader: &mut R) -> Result<Option<RequestEnvelope<A>>>
where
    R: AsyncRead + Unpin,
    A: DeserializeOwned,
{
    match read_frame(reader).await? {
        None => Ok(None),
        Some((FrameKind::Eof, _)) => Err(ProtocolError::Decode(
            "unexpected EOF-bit frame outside file streaming".to_string(),
        )),
        Some((FrameKind::Data, payload)) => Ok(Some(decode(&payload)?)),
    }
}

/// Server-side half: encodes and writes one reply frame.
pub async fn send_reply<W, R>(writer: &mut W, envelope: &ReplyEnvelope<R>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: Serialize,
{
    let payload = encode(envelope)?;
    write_frame(writer, FrameKind::Data, &payload).await
}

/// Reads file-chunk frames until the EOF bit is seen, appending each
/// chunk's bytes to `out`.
pub async fn recv_file<R>(reader: &mut R, out: &mut Vec<u8>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let (kind, payload) = read_frame(reader)
            .await?
            .ok_or(ProtocolError::ChannelClosed)?;
        out.extend_from_slice(&payload);
        if kind == FrameKind::Eof {
            return Ok(());
        }
    }
}
