//! ShardKV CLI
//!
//! Admin shell operating directly on a local data directory.

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use shardkv::{Config, DataRecord, Order, Table, Value, ValueType};
use tracing_subscriber::{fmt, EnvFilter};

/// ShardKV CLI
#[derive(Parser, Debug)]
#[command(name = "shardkv-cli")]
#[command(about = "Inspect and maintain a ShardKV data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./shardkv_data")]
    data_dir: String,

    /// Table name
    #[arg(short, long, default_value = "main")]
    table: String,

    /// Encryption key of the shard files
    #[arg(short = 'k', long)]
    encryption_key: Option<String>,

    /// Records per shard before a rehash
    #[arg(long, default_value = "10000")]
    max_records_per_shard: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value, in its string form
        value: String,

        /// Value type
        #[arg(short = 'y', long = "type", default_value = "string")]
        value_type: String,

        /// Expire after this many milliseconds
        #[arg(long)]
        ttl_ms: Option<i64>,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// List records
    All {
        /// Maximum number of records
        #[arg(short, long)]
        limit: Option<usize>,

        /// Sort order by key
        #[arg(short, long, value_enum)]
        order: Option<SortOrder>,
    },

    /// Time a read of every shard
    Ping,

    /// Rebuild the table from the full-writer log
    Repair,

    /// Show table counters
    Stats,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SortOrder {
    Asc,
    Desc,
}

impl From<SortOrder> for Order {
    fn from(order: SortOrder) -> Self {
        match order {
            SortOrder::Asc => Order::Ascending,
            SortOrder::Desc => Order::Descending,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("ShardKV CLI v{}", shardkv::VERSION);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> shardkv::Result<()> {
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .max_records_per_shard(args.max_records_per_shard)
        .flush_interval_ms(0);
    if let Some(key) = &args.encryption_key {
        builder = builder.encryption_key(key);
    }

    let table = Table::open(&args.table, builder.build()).await?;

    match args.command {
        Commands::Get { key } => match table.get(&key).await? {
            Some(record) => print_record(&record),
            None => println!("(nil)"),
        },
        Commands::Set {
            key,
            value,
            value_type,
            ttl_ms,
        } => {
            let value_type: ValueType = value_type.parse()?;
            let mut record = DataRecord::new(key, Value::parse(value_type, &value)?);
            if let Some(ms) = ttl_ms {
                record = record.expires_in(ms);
            }
            let stored = table.insert(record).await?;
            println!("OK {}", stored.shard.unwrap_or_default());
        }
        Commands::Delete { key } => {
            table.delete(&key).await?;
            println!("OK");
        }
        Commands::All { limit, order } => {
            let records = table.all(limit, order.map(Order::from)).await?;
            for record in &records {
                print_record(record);
            }
            println!("({} records)", records.len());
        }
        Commands::Ping => {
            let report = table.ping().await?;
            for (shard, latency) in &report.shards {
                println!("{shard}\t{latency:?}");
            }
            println!("total\t{:?}", report.total);
        }
        Commands::Repair => {
            let report = table.full_repair().await?;
            println!(
                "repaired: {} records in {} shards ({} entries applied, {} corrupted)",
                report.records, report.shards, report.entries_applied, report.entries_corrupted
            );
        }
        Commands::Stats => {
            let stats = table.stats();
            println!("shards:     {}", stats.shard_count);
            println!("generation: {}", stats.generation);
            println!("records:    {}", stats.records);
            println!("pending:    {}", stats.pending);
            println!("locked:     {}", stats.locked);
        }
    }

    if !table.is_locked() {
        table.close().await?;
    }
    Ok(())
}

fn print_record(record: &DataRecord) {
    let ttl = record
        .ttl
        .map(|ttl| format!("\tttl={ttl}"))
        .unwrap_or_default();
    println!(
        "{}\t{}\t{}{}",
        record.key,
        record.value_type(),
        record.value.stringify(),
        ttl
    );
}
