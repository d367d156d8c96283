//! Position stream client
//!
//! Registers with the position server, then prints every published position.
//!
//! Usage:
//!   cargo run --bin position-client
//!   cargo run --bin position-client -- --addr 10.0.0.5:50051 --info robot-1
//!   cargo run --bin position-client -- --register-only

use anyhow::{bail, Context};
use clap::Parser;
use line_follower::domain::types::{ClientInfo, PositionSnapshot, ServerInfo};
use line_follower::io::Request;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "position-client")]
#[command(about = "Subscribe to the line follower position stream")]
struct Args {
    /// Position server address
    #[arg(short, long, default_value = "127.0.0.1:50051")]
    addr: String,

    /// Free-form client description sent with each request
    #[arg(short, long, default_value = "position-client")]
    info: String,

    /// Register and exit without subscribing
    #[arg(long)]
    register_only: bool,

    /// Print raw JSON lines instead of log events
    #[arg(long)]
    json: bool,
}

async fn send<T: Serialize>(stream: &mut (impl AsyncWriteExt + Unpin), value: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stream.write_all(&line).await.context("failed to send request")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let client = ClientInfo { info: args.info.clone() };

    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    send(&mut writer, &Request::RegisterClient(client.clone())).await?;
    let Some(reply) = lines.next_line().await? else {
        bail!("server closed the connection before replying");
    };
    let server_info: ServerInfo =
        serde_json::from_str(&reply).with_context(|| format!("unexpected reply: {reply}"))?;
    info!(addr = %args.addr, server = %server_info.info, "registered");

    if args.register_only {
        return Ok(());
    }

    send(&mut writer, &Request::SubscribePositions(client)).await?;
    while let Some(line) = lines.next_line().await? {
        if args.json {
            println!("{line}");
            continue;
        }
        match serde_json::from_str::<PositionSnapshot>(&line) {
            Ok(p) => info!(
                id = %p.id,
                in_focus = %p.in_focus,
                mid_offset = %p.mid_offset,
                degrees = ?p.degrees,
                mid_line_cross = %p.mid_line_cross,
                width = %p.frame_width,
                middle_inc = %p.middle_increment,
                "position"
            ),
            Err(e) => warn!(error = %e, line = %line, "unparsable_position"),
        }
    }

    info!("server closed the stream");
    Ok(())
}
