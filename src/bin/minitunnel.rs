use anyhow::{Result, bail};
use clap::Parser;
use minitunnel::{RelayConfig, UserPass, local::LocalProxy};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SOCKS5 relay engine behind a local listener", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Receive buffer size per TCP session
    #[arg(short, long, default_value_t = 8 * 1024)]
    buffer_size: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(UserPass {
                username: u,
                password: p,
            })
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    let config = RelayConfig::default().with_buffer_size(args.buffer_size);
    let mut proxy = LocalProxy::new(args.listen)
        .with_auth(auth)
        .with_config(config);

    info!("Starting SOCKS5 relay: {}", proxy.listen_addr);
    proxy.run().await
}
