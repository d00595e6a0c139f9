use anyhow::Result;
use tracing::{error, info};

mod cli;
mod engine;
mod error;
mod fetch;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Watching runs unattended, so it logs to a file unless told otherwise
    let log_file = args
        .log_file
        .clone()
        .or_else(|| args.is_long_running().then(utils::default_log_file));
    utils::init_logging(args.verbose, log_file)?;

    info!("Starting Smart Scraper v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
