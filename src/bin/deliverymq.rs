use std::path::PathBuf;

use clap::Parser;
use deliverymq::store::VersionedRecord;
use deliverymq::tracking::{state_key, PARTITION_STATE_KEY_PREFIX};
use deliverymq::{
    setup_local_tracing, setup_tracing, AppResult, DeliveryConfig, DeliverySnapshot,
    PartitionTrackingState, RocksStateStore, StateStore,
};
use dotenv::dotenv;
use tokio::runtime;

#[derive(Parser)]
#[command(version, about = "Operator tool for the delivery tracker state")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// also write logs to rolling files under `general.log_dir`
    #[arg(long)]
    pub log_to_file: bool,
}

#[derive(Parser)]
pub enum Command {
    /// Print the effective configuration, defaults and environment overrides included
    PrintConfig,
    /// Print the persisted tracking state of partitions
    DumpState {
        /// state store directory, defaults to `general.state_db_path`
        #[arg(long)]
        db: Option<PathBuf>,
        /// partitions to print, all stored partitions when omitted
        #[arg(long, value_delimiter = ',')]
        partitions: Vec<i32>,
    },
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = DeliveryConfig::set_up_config(config_path)?;
    // flushes the file writer when main returns
    let _guard = if commandline.log_to_file {
        Some(setup_tracing(&config.general.log_dir))
    } else {
        setup_local_tracing()?;
        None
    };

    match commandline.command {
        Command::PrintConfig => {
            println!("{:#?}", config);
            println!("{:#?}", DeliverySnapshot::try_from(&config.delivery)?);
            Ok(())
        }
        Command::DumpState { db, partitions } => {
            let db = db.unwrap_or_else(|| PathBuf::from(&config.general.state_db_path));
            let rt = runtime::Builder::new_current_thread().enable_all().build()?;
            rt.block_on(dump_state(db, partitions))
        }
    }
}

async fn dump_state(db: PathBuf, partitions: Vec<i32>) -> AppResult<()> {
    let store = RocksStateStore::open(&db)?;
    let records: Vec<VersionedRecord> = if partitions.is_empty() {
        store.scan_prefix(PARTITION_STATE_KEY_PREFIX)?
    } else {
        store
            .get(partitions.iter().map(|p| state_key(*p)).collect())
            .await?
    };
    if records.is_empty() {
        println!("no partition state stored in {}", db.display());
        return Ok(());
    }

    for record in records {
        let Some(partition) = record
            .key
            .strip_prefix(PARTITION_STATE_KEY_PREFIX)
            .and_then(|p| p.parse::<i32>().ok())
        else {
            println!("{}: not a partition state key", record.key);
            continue;
        };
        match PartitionTrackingState::deserialize(partition, &record.value, record.version) {
            Ok(state) => {
                println!(
                    "partition {} version {}: restart {}, last sent {}, read from {:?}, starting at {}",
                    partition,
                    record.version,
                    state.restart_offset(),
                    state.last_sent_offset(),
                    state.read_from_offset(),
                    state.starting_offset()
                );
                let mut tracked: Vec<_> = state.tracked().values().collect();
                tracked.sort_by_key(|entry| entry.first_seen_at);
                for entry in tracked {
                    println!(
                        "  {} first seen {} persisted {}",
                        entry.message_id, entry.first_seen_at, entry.persisted
                    );
                }
            }
            Err(e) => println!("partition {}: {}", partition, e),
        }
    }
    Ok(())
}
