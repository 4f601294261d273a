use anyhow::Result;
use clap::Parser;

use replikv::{config::Config, replica::Replica};

/// One replica of the replicated key-value store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Replica index, in [0, NUM_REPLICAS).
    index: usize,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let replica = Replica::start(config, cli.index).await?;

    // The run ends on the idle timer; dump the store before exiting 0.
    let dump = replica.run().await?;
    println!("datastore contents at shutdown:");
    if dump.is_empty() {
        println!("(empty)");
    }
    for (key, value) in dump {
        println!("{key} = {value}");
    }

    Ok(())
}
