mod wstun;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "wstun",
    version,
    about = "wstun - WebSocket to TCP/UDP tunneling relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses WSTUN_CONFIG; then auto-detects wstun.toml > wstun.yaml > wstun.yml from CWD; then falls back to the OS default path (Linux: /etc/wstun/wstun.toml; others: user config dir).
    #[arg(long, env = "WSTUN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    wstun::run(cli.config).await
}
