//! Minimal guest-side peer for the vmforge wire protocol: connects to
//! the console and channel sockets a launched appliance exposes, sends
//! the ready sentinel once both are up, then serves
//! [`vmforge_protocol::procedures`] until the host hangs up.
//!
//! Deliberately does not implement `exec`/`read_file`/`write_file`/
//! `list_dir` — that surface belongs to the per-action API this
//! workspace treats as an external collaborator.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use vmforge_protocol::{
    decode, read_frame, send_reply, FrameKind, Header, PingArgs, PingResult, ReplyEnvelope,
    RequestEnvelope, UptimeResult, VersionResult, LAUNCH_FLAG, PROC_PING, PROC_UPTIME,
    PROC_VERSION,
};

#[derive(Parser)]
#[command(name = "vmforge-agent")]
#[command(about = "Guest-side peer for the vmforge host/guest channel")]
struct Cli {
    /// Path to the console Unix socket
    #[arg(long)]
    console: PathBuf,

    /// Path to the channel Unix socket
    #[arg(long)]
    channel: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "vmforge-agent exiting");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let start = std::time::Instant::now();

    let mut console = UnixStream::connect(&cli.console).await?;
    console
        .write_all(b"vmforge-agent: appliance booted\n")
        .await?;

    let mut channel = UnixStream::connect(&cli.channel).await?;
    channel.write_all(LAUNCH_FLAG).await?;
    tracing::info!("ready sentinel sent, serving requests");

    loop {
        let (kind, payload) = match read_frame(&mut channel).await? {
            Some(frame) => frame,
            None => {
                tracing::info!("channel closed by host, exiting");
                return Ok(());
            }
        };
        if kind != FrameKind::Data {
            anyhow::bail!("unexpected EOF-bit frame outside file streaming");
        }

        // Procedure dispatch needs to know the args type before it can
        // decode them, so the header (bincode's first-written fields) is
        // peeked from the same bytes before the full typed envelope is
        // decoded. Bincode ignores the unconsumed tail of the slice, so
        // this is just "decode a prefix of the struct twice".
        let header: Header = decode(&payload)?;
        dispatch(&mut channel, header, &payload, start).await?;
    }
}

async fn dispatch(
    channel: &mut UnixStream,
    header: Header,
    payload: &[u8],
    start: std::time::Instant,
) -> anyhow::Result<()> {
    let procedure = header.procedure;
    let serial = header.serial;

    match procedure {
        PROC_PING => {
            let request: RequestEnvelope<PingArgs> = decode(payload)?;
            let reply = ReplyEnvelope::ok(
                procedure,
                serial,
                PingResult {
                    nonce: request.args.nonce,
                },
            );
            send_reply(channel, &reply).await?;
        }
        PROC_VERSION => {
            let _request: RequestEnvelope<()> = decode(payload)?;
            let reply = ReplyEnvelope::ok(
                procedure,
                serial,
                VersionResult {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            );
            send_reply(channel, &reply).await?;
        }
        PROC_UPTIME => {
            let _request: RequestEnvelope<()> = decode(payload)?;
            let reply = ReplyEnvelope::ok(
                procedure,
                serial,
                UptimeResult {
                    seconds: start.elapsed().as_secs(),
                },
            );
            send_reply(channel, &reply).await?;
        }
        other => {
            let reply: ReplyEnvelope<()> = ReplyEnvelope::error(
                other,
                serial,
                libc::ENOSYS,
                format!("unknown procedure {other}"),
            );
            send_reply(channel, &reply).await?;
        }
    }
    Ok(())
}
