/// chatsync terminal client - main entry point
use chatsync_core::{cli_app, ClientConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (stderr, so it does not interleave with chat output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn"))
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: {} [api_url] [--socket-url <url>] [--page-size <n>] [--typing-timeout-ms <n>] [--request-timeout-ms <n>]", args[0]);
        cli_app::print_usage();
        return Ok(());
    }

    let config = ClientConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("API: {}", config.api_base_url);
    info!("Push channel: {}", config.socket_url());

    cli_app::run(config).await
}
