use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blockscan")]
#[command(about = "Inspect and maintain a local block scan cache", long_about = None)]
pub struct Cli {
    #[arg(short, long, help = "Path to the configuration file", default_value = "config/config.toml")]
    pub config: PathBuf,
    #[arg(short, long, help = "Overrides the database file from the configuration")]
    pub database_file: Option<String>,
    #[arg(short, long, help = "Overrides the chain symbol from the configuration")]
    pub symbol: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the scan pointer, the header cache and the number of unscanned records
    Status {
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },
    /// List the blocks and transactions waiting to be scanned again
    Unscanned {
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },
    /// Change the number of block headers kept for fork detection
    SetCacheSize {
        #[arg(long, help = "New capacity, greater than zero")]
        size: u64,
    },
    /// Move the scan pointer; the next scan resumes at height + 1
    ResetPointer {
        #[arg(long, help = "Height of the last block considered scanned")]
        height: u64,
        #[arg(long, help = "Hash of the block at that height")]
        hash: String,
    },
}
