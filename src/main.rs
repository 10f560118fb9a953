use clap::Parser;
use sglang_mini_lb::mini_lb::{types::DEFAULT_TIMEOUT_SECS, MiniLbConfig, MiniLoadBalancer};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mini-lb")]
#[command(about = "Mini Load Balancer for SGLang prefill/decode disaggregation")]
#[command(long_about = r#"
Mini Load Balancer for SGLang prefill/decode disaggregation.

Every request goes to one prefill server (round-robin) and one decode server
(random) at the same time, tagged with the prefill server's bootstrap address.

Examples:
  mini-lb --prefill http://127.0.0.1:30000,http://127.0.0.1:30001 \
    --prefill-bootstrap-ports 8998,8999 \
    --decode http://127.0.0.1:31000 \
    --port 8000
"#)]
struct CliArgs {
    /// Comma-separated URLs for prefill servers
    #[arg(long, required = true, value_delimiter = ',')]
    prefill: Vec<String>,

    /// Comma-separated bootstrap ports for prefill servers (one shared port or one per server)
    #[arg(long, default_value = "8998", value_delimiter = ',')]
    prefill_bootstrap_ports: Vec<u16>,

    /// Comma-separated URLs for decode servers
    #[arg(long, required = true, value_delimiter = ',')]
    decode: Vec<String>,

    /// Host to bind the server
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Per-request timeout in seconds, shared by both dispatch legs
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = MiniLbConfig::from_cli_lists(
        args.prefill,
        args.prefill_bootstrap_ports,
        args.decode,
        args.host,
        args.port,
    )?;
    config.timeout_secs = args.timeout_secs;

    let lb = MiniLoadBalancer::new(config)?;
    lb.start().await?;

    Ok(())
}
