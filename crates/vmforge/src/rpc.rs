//! RPC glue (C7): binds the wire framer in `vmforge_protocol` to the
//! channel socket owned by a [`crate::connection::Connection`].

use serde::{de::DeserializeOwned, Serialize};

use vmforge_core::error::{Error, Result};
use vmforge_protocol::{recv, AsyncEvent, EventSink, Framer};

use crate::connection::Connection;

/// The sentinel the guest daemon sends once it is ready to accept
/// calls; observed on the channel socket right after `accept` returns.
pub use vmforge_protocol::LAUNCH_FLAG as READY_SENTINEL;

/// One outstanding-call-at-a-time RPC peer, layered on a `Connection`.
pub struct RpcClient {
    framer: Framer,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self {
            framer: Framer::new(),
        }
    }

    /// Blocks until the ready sentinel arrives on the channel socket, or
    /// the connection is closed/errors first. This is what moves a
    /// handle from LAUNCHING to READY.
    pub async fn wait_for_ready(&self, connection: &mut Connection) -> Result<()> {
        let mut buf = vec![0u8; READY_SENTINEL.len()];
        let n = connection.read_exact(&mut buf).await?;
        if n == 0 {
            return Err(Error::LaunchFailed {
                reason: "channel closed before ready sentinel arrived".to_string(),
            });
        }
        if buf != READY_SENTINEL {
            return Err(Error::LaunchFailed {
                reason: "ready sentinel mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Sends one request and waits for its matching reply, delivering
    /// any progress/log/cancel frames to `sink` along the way.
    pub async fn call<A, R>(
        &self,
        connection: &mut Connection,
        procedure: u32,
        optargs_bitmask: u64,
        args: A,
        sink: impl EventSink,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let channel = connection
            .channel_mut()
            .ok_or_else(|| Error::Protocol("channel socket not connected".to_string()))?;
        let serial = self
            .framer
            .send(channel, procedure, optargs_bitmask, args)
            .await?;
        recv(channel, serial, sink).await.map_err(Error::from)
    }
}

/// An [`EventSink`] that forwards progress/log events to a handle's
/// event subscribers and sets a cancel flag on a cancel frame.
pub struct HandleEventSink<'a> {
    pub cancel_flag: &'a std::sync::atomic::AtomicBool,
    pub on_event: &'a mut dyn FnMut(AsyncEvent),
}

impl EventSink for HandleEventSink<'_> {
    fn on_event(&mut self, event: AsyncEvent) {
        if matches!(event, AsyncEvent::Cancel) {
            self.cancel_flag
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
        (self.on_event)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn wait_for_ready_succeeds_on_matching_sentinel() {
        let (console_a, _console_b) = UnixStream::pair().unwrap();
        let (channel_a, mut channel_b) = UnixStream::pair().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = crate::connection::Connection::connected(console_a, channel_a, tx);

        channel_b.write_all(READY_SENTINEL).await.unwrap();
        let client = RpcClient::new();
        client.wait_for_ready(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_ready_fails_on_mismatch() {
        let (console_a, _console_b) = UnixStream::pair().unwrap();
        let (channel_a, mut channel_b) = UnixStream::pair().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = crate::connection::Connection::connected(console_a, channel_a, tx);

        channel_b.write_all(b"WRONG_SENTINEL\0\0").await.unwrap();
        let client = RpcClient::new();
        assert!(client.wait_for_ready(&mut conn).await.is_err());
    }
}
