//! Connection abstraction (C6): the console and channel sockets a
//! handle owns once a backend has launched a VM.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use vmforge_core::error::{Error, Result};

/// How long `accept` waits for the guest to connect both sockets.
pub const ACCEPT_DEADLINE: Duration = Duration::from_secs(20 * 60);

const CONSOLE_DRAIN_CHUNK: usize = 4096;

/// A chunk of console output, emitted as a log event while waiting on
/// `accept` or blocked in `read_exact`.
#[derive(Debug, Clone)]
pub struct ConsoleBytes(pub Vec<u8>);

enum Listeners {
    /// Caller passed two already-bound, listening sockets; `accept`
    /// blocks for the guest to connect to both, in either order.
    Pending {
        console: UnixListener,
        channel: UnixListener,
    },
    /// Caller passed two already-connected sockets, or `accept` has
    /// already run to completion.
    Accepted,
}

/// Owns the guest's console output socket and the request/response
/// channel socket, in either the listening or already-connected form.
pub struct Connection {
    listeners: Listeners,
    console_stream: Option<UnixStream>,
    channel_stream: Option<UnixStream>,
    console_events: mpsc::UnboundedSender<ConsoleBytes>,
}

impl Connection {
    /// Caller passes two already-bound, listening sockets; `accept`
    /// will block (up to [`ACCEPT_DEADLINE`]) for the guest to connect
    /// to both, in either order.
    pub fn listening(
        console: UnixListener,
        channel: UnixListener,
        console_events: mpsc::UnboundedSender<ConsoleBytes>,
    ) -> Self {
        Self {
            listeners: Listeners::Pending { console, channel },
            console_stream: None,
            channel_stream: None,
            console_events,
        }
    }

    /// Caller passes two already-connected sockets; `accept` becomes a
    /// no-op.
    pub fn connected(
        console: UnixStream,
        channel: UnixStream,
        console_events: mpsc::UnboundedSender<ConsoleBytes>,
    ) -> Self {
        Self {
            listeners: Listeners::Accepted,
            console_stream: Some(console),
            channel_stream: Some(channel),
            console_events,
        }
    }

    /// Blocks until both sockets have a peer, or the deadline expires.
    /// A no-op for a `Connection` built via [`Connection::connected`].
    pub async fn accept(&mut self) -> Result<()> {
        let Listeners::Pending { console, channel } = &self.listeners else {
            return Ok(());
        };

        let mut console_conn = None;
        let mut channel_conn = None;

        let deadline = tokio::time::sleep(ACCEPT_DEADLINE);
        tokio::pin!(deadline);

        while console_conn.is_none() || channel_conn.is_none() {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(Error::Timeout("timed out waiting for guest to connect".to_string()));
                }
                result = console.accept(), if console_conn.is_none() => {
                    let (stream, _) = result.map_err(Error::Resource)?;
                    console_conn = Some(stream);
                }
                result = channel.accept(), if channel_conn.is_none() => {
                    let (stream, _) = result.map_err(Error::Resource)?;
                    channel_conn = Some(stream);
                }
            }
        }

        self.console_stream = console_conn;
        self.channel_stream = channel_conn;
        self.listeners = Listeners::Accepted;
        Ok(())
    }

    pub fn channel_mut(&mut self) -> Option<&mut UnixStream> {
        self.channel_stream.as_mut()
    }

    /// Reads exactly `buf.len()` bytes from the channel socket,
    /// concurrently draining console bytes and emitting them as
    /// events. Returns 0 on peer close.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        let channel = self
            .channel_stream
            .as_mut()
            .ok_or_else(|| Error::Protocol("channel socket not connected".to_string()))?;
        let mut console_buf = [0u8; CONSOLE_DRAIN_CHUNK];
        let mut filled = 0;

        while filled < buf.len() {
            if let Some(console) = &mut self.console_stream {
                tokio::select! {
                    biased;
                    result = console.read(&mut console_buf) => {
                        if let Ok(n) = result {
                            if n > 0 {
                                let _ = self.console_events.send(ConsoleBytes(console_buf[..n].to_vec()));
                            }
                        }
                    }
                    result = channel.read(&mut buf[filled..]) => {
                        let n = result.map_err(Error::Resource)?;
                        if n == 0 {
                            return Ok(0);
                        }
                        filled += n;
                    }
                }
            } else {
                let n = channel.read(&mut buf[filled..]).await.map_err(Error::Resource)?;
                if n == 0 {
                    return Ok(0);
                }
                filled += n;
            }
        }
        Ok(filled)
    }

    /// Writes exactly `buf.len()` bytes to the channel socket.
    pub async fn write_exact(&mut self, buf: &[u8]) -> Result<usize> {
        let channel = self
            .channel_stream
            .as_mut()
            .ok_or_else(|| Error::Protocol("channel socket not connected".to_string()))?;
        channel.write_all(buf).await.map_err(Error::Resource)?;
        Ok(buf.len())
    }

    /// Nonblocking poll: true if the channel socket has bytes ready.
    pub fn can_read(&self) -> bool {
        match &self.channel_stream {
            Some(stream) => {
                let mut probe = [0u8; 1];
                matches!(stream.try_read(&mut probe), Ok(n) if n > 0)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connected_variant_requires_no_accept_wait() {
        let (console_a, _console_b) = UnixStream::pair().unwrap();
        let (channel_a, mut channel_b) = UnixStream::pair().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = Connection::connected(console_a, channel_a, tx);
        conn.accept().await.unwrap();

        channel_b.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn write_exact_roundtrip() {
        let (console_a, _console_b) = UnixStream::pair().unwrap();
        let (channel_a, mut channel_b) = UnixStream::pair().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = Connection::connected(console_a, channel_a, tx);
        conn.write_exact(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        channel_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn listening_accept_times_out_without_a_deadline_override() {
        let dir = tempfile::tempdir().unwrap();
        let console_path = dir.path().join("console.sock");
        let channel_path = dir.path().join("channel.sock");
        let console = UnixListener::bind(&console_path).unwrap();
        let channel = UnixListener::bind(&channel_path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = Connection::listening(console, channel, tx);

        let guest_console = UnixStream::connect(&console_path).await.unwrap();
        drop(guest_console);

        let result = tokio::time::timeout(Duration::from_millis(200), conn.accept()).await;
        assert!(result.is_err(), "accept should still be waiting on the channel socket");
    }

    #[tokio::test]
    async fn listening_accept_succeeds_once_both_sockets_connect() {
        let dir = tempfile::tempdir().unwrap();
        let console_path = dir.path().join("console.sock");
        let channel_path = dir.path().join("channel.sock");
        let console = UnixListener::bind(&console_path).unwrap();
        let channel = UnixListener::bind(&channel_path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = Connection::listening(console, channel, tx);

        let _guest_console = UnixStream::connect(&console_path).await.unwrap();
        let _guest_channel = UnixStream::connect(&channel_path).await.unwrap();

        conn.accept().await.unwrap();
        assert!(conn.channel_mut().is_some());
    }

    #[tokio::test]
    async fn can_read_reflects_pending_bytes() {
        let (console_a, _console_b) = UnixStream::pair().unwrap();
        let (channel_a, mut channel_b) = UnixStream::pair().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::connected(console_a, channel_a, tx);
        assert!(!conn.can_read());
        channel_b.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.can_read());
    }
}
