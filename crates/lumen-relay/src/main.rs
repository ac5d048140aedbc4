//! LumenCanvas relay server
//!
//! Accepts websocket connections, one room per project, and relays document
//! updates between every client in a room while keeping its own replica so
//! late joiners catch up from the relay alone.

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod server;

use server::RelayServer;

#[derive(Parser)]
#[command(name = "lumen-relay")]
#[command(about = "Room-based sync relay for LumenCanvas projects")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();

    let listener = TcpListener::bind(&cli.listen).await?;
    RelayServer::new().run(listener).await
}
