use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "sdb-dap")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Debug adapter that drives soft debugger targets through sdb-bridge.", long_about = None)]
struct Cli {
    /// Log filter directives, e.g. `sdb_bridge=debug`. Defaults to SDB_LOG or RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    sdb_dap::start(cli.log_level).map_err(|e| miette::miette!("{}", e))
}
