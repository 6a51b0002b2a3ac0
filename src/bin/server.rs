use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use relay::server::{Server, ServerConfig};
use relay::HubConfig;

#[derive(Parser)]
#[command(name = "server", about = "WebSocket broadcast relay")]
struct Args {
    /// Address to listen on; clients connect to ws://<addr>/ws
    #[arg(long, env = "RELAY_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

    /// Messages buffered per client before broadcasts start to wait on it
    #[arg(long, env = "RELAY_CLIENT_BUFFER", default_value_t = 256)]
    client_buffer: usize,

    /// Milliseconds a broadcast waits on a full client buffer before dropping the client
    #[arg(long, env = "RELAY_SEND_TIMEOUT_MS", default_value_t = 2000)]
    send_timeout_ms: u64,

    /// Requests that may queue in front of the hub
    #[arg(long, env = "RELAY_HUB_QUEUE", default_value_t = 256)]
    hub_queue: usize,

    /// Broadcast join/leave system messages
    #[arg(long, env = "RELAY_ANNOUNCE")]
    announce: bool,

    /// Enable debug logging
    #[arg(long, env = "RELAY_DEBUG")]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "RELAY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.addr.clone(),
            outbound_capacity: self.client_buffer.max(1),
            announce_presence: self.announce,
            hub: HubConfig {
                command_capacity: self.hub_queue.max(1),
                send_timeout: Duration::from_millis(self.send_timeout_ms),
                ..HubConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    relay::logging::init(args.debug, args.log_json);

    let srv = Arc::new(Server::new(args.config()));

    // Graceful shutdown on Ctrl-C
    srv.listen_and_serve(async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;
    Ok(())
}
