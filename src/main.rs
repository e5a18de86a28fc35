use clap::{Parser, Subcommand, ValueEnum};
use drainpipe::config::DrainConfig;
use drainpipe::item::{list_items, Item};
use drainpipe::packer::{self, PackMode, Packer};
use drainpipe::remote::{Credentials, HttpStore};
use drainpipe::retry::ThreadSleeper;
use drainpipe::transfer::{Transfer, TransferMode};
use drainpipe::{cleaner, logging, DrainError};
use dotenv::dotenv;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "drainpipe")]
#[command(about = "Drain capture segments into archive items, upload them and clean up", long_about = None)]
struct Cli {
    /// Drain configuration file (YAML)
    #[arg(short, long, env = "DRAIN_CONFIG", default_value = "drain.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack segment files from the job directory into items
    Pack {
        #[arg(long, value_enum, default_value_t = PackMode::Single)]
        mode: PackMode,
    },
    /// Upload packed items
    Transfer {
        #[arg(long, value_enum, default_value_t = TransferMode::All)]
        mode: TransferMode,
    },
    /// Delete local copies of fully uploaded items
    Clean,
    /// Run pack, transfer and clean once
    Cycle {
        #[arg(long, value_enum, default_value_t = PackMode::Multi)]
        pack_mode: PackMode,
        #[arg(long, value_enum, default_value_t = TransferMode::All)]
        transfer_mode: TransferMode,
    },
    /// Show item status, for one item or all of them
    Status { item: Option<String> },
    /// Make an item eligible on the next transfer pass
    RetryAsap { item: String },
    /// Turn the FINISH_DRAIN signal on or off
    FinishDrain {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Summarize segment files waiting in the job directory
    Source,
    /// Print the effective configuration
    Config {
        #[arg(long)]
        validate: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Serialize)]
struct EffectiveConfig<'a> {
    #[serde(flatten)]
    raw: &'a DrainConfig,
    max_size_bytes: u64,
    naming_pattern: String,
    upload_naming_pattern: String,
    item_template: String,
    collection_hierarchy: Vec<String>,
    crawlhost: String,
    merged_metadata: drainpipe::metadata::Metadata,
}

#[derive(Serialize)]
struct CycleReport {
    pack: packer::PackReport,
    transfer: drainpipe::transfer::TransferReport,
    clean: cleaner::CleanReport,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), DrainError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn transfer(config: &DrainConfig, mode: TransferMode) -> Result<drainpipe::transfer::TransferReport, DrainError> {
    let store = HttpStore::new(&config.s3_endpoint, Credentials::from_env()?)?;
    let sleeper = ThreadSleeper;
    Transfer::new(config, &store, &sleeper)?.run(mode)
}

fn main() -> Result<(), DrainError> {
    dotenv().ok();
    logging::init();
    let cli = Cli::parse();
    let config = DrainConfig::load(&cli.config)?;

    match cli.command {
        Commands::Pack { mode } => {
            config.validate()?;
            print_json(&Packer::new(&config, mode)?.run()?)
        }
        Commands::Transfer { mode } => {
            config.validate()?;
            print_json(&transfer(&config, mode)?)
        }
        Commands::Clean => print_json(&cleaner::run(&config.xfer_dir)?),
        Commands::Cycle {
            pack_mode,
            transfer_mode,
        } => {
            config.validate()?;
            let pack = Packer::new(&config, pack_mode)?.run()?;
            let transfer = transfer(&config, transfer_mode)?;
            let clean = cleaner::run(&config.xfer_dir)?;
            print_json(&CycleReport {
                pack,
                transfer,
                clean,
            })
        }
        Commands::Status { item: Some(name) } => {
            let item = Item::new(&config.xfer_dir, &name);
            if !item.exists() {
                return Err(DrainError::Other(format!("no such item: {}", name)));
            }
            print_json(&item.status())
        }
        Commands::Status { item: None } => {
            let statuses: Vec<_> = list_items(&config.xfer_dir)?
                .iter()
                .map(Item::status)
                .collect();
            print_json(&statuses)
        }
        Commands::RetryAsap { item } => {
            let item = Item::new(&config.xfer_dir, &item);
            if !item.exists() {
                return Err(DrainError::Other(format!("no such item: {}", item)));
            }
            item.retry_asap()?;
            print_json(&item.status())
        }
        Commands::FinishDrain { state } => {
            packer::set_finish_drain(&config, matches!(state, Switch::On))?;
            print_json(&packer::source_summary(&config)?)
        }
        Commands::Source => print_json(&packer::source_summary(&config)?),
        Commands::Config { validate } => {
            if validate {
                config.validate()?;
                tracing::info!("configuration is valid");
            }
            print_json(&EffectiveConfig {
                raw: &config,
                max_size_bytes: config.max_size_bytes()?,
                naming_pattern: config.naming_pattern(),
                upload_naming_pattern: config.upload_naming_pattern(),
                item_template: config.item_template(),
                collection_hierarchy: config.collections(),
                crawlhost: config.crawlhost(),
                merged_metadata: config.metadata(),
            })
        }
    }
}
