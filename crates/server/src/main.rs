use basegrid_server::ServerConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Local building-planner service.
#[derive(Debug, Parser)]
#[command(name = "basegrid-server", version)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:39333")]
    addr: SocketAddr,
    /// SQLite file mirroring the layout (default: ~/.basegrid/layout.db).
    #[arg(long)]
    db: Option<PathBuf>,
    /// JSON or YAML catalog to use instead of the built-in building table.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Quiet period before a layout change is written out.
    #[arg(long, default_value_t = 500)]
    debounce_ms: u64,
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    basegrid_server::init_tracing(args.json_logs);

    let db_path = args.db.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".basegrid")
            .join("layout.db")
    });
    let config = ServerConfig {
        db_path,
        catalog_path: args.catalog,
        debounce: Duration::from_millis(args.debounce_ms),
    };

    basegrid_server::serve(args.addr, config).await
}
