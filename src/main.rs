use std::path::Path;

use anyhow::Context;
use blockscan::{
    chain_cache::{BlockchainDai, BlockchainLocal},
    cli::{Cli, Commands},
    config::{AppConfig, load_configuration},
    log::{DEFAULT_LOG_CONFIG, init_logging},
    models::BlockHeader,
};
use chrono::DateTime;
use clap::Parser;
use log::info;
use serde::Serialize;

#[derive(Serialize)]
struct Status {
    symbol: String,
    scanned_height: Option<u64>,
    scanned_hash: Option<String>,
    cached_headers: u64,
    cache_capacity: Option<u64>,
    unscanned_records: usize,
}

fn format_time(header: &BlockHeader) -> String {
    DateTime::from_timestamp(header.time as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging(Path::new(DEFAULT_LOG_CONFIG))?;
    let cli = Cli::parse();

    let mut config: AppConfig = load_configuration(&cli.config)?;
    if let Some(database_file) = cli.database_file {
        config.database_file = database_file;
    }
    if let Some(symbol) = cli.symbol {
        config.scanner.symbol = symbol;
    }
    let symbol = config.scanner.symbol.clone();
    anyhow::ensure!(!symbol.is_empty(), "No chain symbol configured");

    let local = BlockchainLocal::open(&config.database_file, config.scanner.keep_open)
        .with_context(|| format!("Could not open {}", config.database_file))?;
    local
        .restore_block_cache_size(&symbol, config.scanner.block_cache_size)
        .await?;

    match cli.command {
        Commands::Status { json } => {
            let pointer = local.get_current_block_head(&symbol).await?;
            let status = Status {
                symbol: symbol.clone(),
                scanned_height: pointer.as_ref().map(|p| p.height),
                scanned_hash: pointer.as_ref().map(|p| p.hash.clone()),
                cached_headers: local.count_cached_block_heads(&symbol).await?,
                cache_capacity: local.stored_block_cache_size(&symbol).await?,
                unscanned_records: local.get_unscan_records(&symbol).await?.len(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("Symbol:            {}", status.symbol);
            match &pointer {
                Some(p) => println!("Scanned up to:     {} ({}, {})", p.height, p.hash, format_time(p)),
                None => println!("Scanned up to:     nothing scanned yet"),
            }
            println!(
                "Cached headers:    {} / {}",
                status.cached_headers,
                status
                    .cache_capacity
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("Unscanned records: {}", status.unscanned_records);
        },
        Commands::Unscanned { json } => {
            let records = local.get_unscan_records(&symbol).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("No unscanned records.");
            }
            for record in records {
                let target = if record.is_block_level() {
                    "<block>".to_string()
                } else {
                    record.tx_id.clone()
                };
                println!("{:>10}  {}  {}", record.block_height, target, record.reason);
            }
        },
        Commands::SetCacheSize { size } => {
            local.resize_block_cache(size, &symbol).await?;
            info!(symbol = &*symbol, size = size; "Block head cache resized");
            println!("Block head cache of {} now holds at most {} headers.", symbol, size);
        },
        Commands::ResetPointer { height, hash } => {
            let header = BlockHeader::pointer(&symbol, height, hash);
            local.save_local_block_head(&header).await?;
            local.save_current_block_head(&header).await?;
            info!(symbol = &*symbol, height = height; "Scan pointer reset");
            println!(
                "Scan pointer of {} set to {}; scanning resumes at {}.",
                symbol,
                height,
                header.next_height()
            );
        },
    }

    Ok(())
}
