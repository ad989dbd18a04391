use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use pyrite_config::PyriteConfig;
use pyrite_dap::ServerOptions;

/// Pyrite Debug Adapter Protocol server.
///
/// Speaks DAP over stdio by default. With `--listen`, serves independent
/// sessions to every editor connection on a TCP address instead.
#[derive(Debug, Parser)]
#[command(name = "pyrite-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `PYRITE_CONFIG` is used as a fallback. When neither are
    /// provided the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve DAP over TCP on this address (e.g. `127.0.0.1:4711`).
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config);
    pyrite_config::init_tracing(&config.logging);

    let options = ServerOptions::new(config.debugger);
    match cli.listen {
        Some(addr) => pyrite_dap::serve_tcp(addr, options).await,
        None => pyrite_dap::run_stdio(options).await,
    }
}

fn load_config(cli_path: Option<PathBuf>) -> PyriteConfig {
    match PyriteConfig::load(cli_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("pyrite-dap: failed to load config: {err}; continuing with defaults");
            PyriteConfig::default()
        }
    }
}
