//! LowkeyDB command line tool

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use lowkeydb::{Database, DatabaseConfig, LowkeyError};
use std::path::PathBuf;

/// LowkeyDB - an embeddable transactional key-value store
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the data file
    db_path: PathBuf,

    /// Create the database instead of opening it
    #[arg(long)]
    create: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Buffer pool size in pages
    #[arg(short = 'b', long, default_value = "256")]
    buffer_frames: usize,

    /// Hash buckets for a new database
    #[arg(long, default_value = "64")]
    buckets: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value
    Put { key: String, value: String },
    /// Print a value
    Get { key: String },
    /// Remove a key
    Delete { key: String },
    /// Print the number of keys
    Count,
    /// Print buffer pool and checkpoint statistics
    Stats,
    /// Run a checkpoint
    Checkpoint,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = DatabaseConfig {
        buffer_pool_capacity: args.buffer_frames,
        bucket_count: args.buckets,
        ..Default::default()
    };
    let db = if args.create {
        Database::create_with_config(&args.db_path, config)
            .with_context(|| format!("Failed to create database at {}", args.db_path.display()))?
    } else {
        Database::open_with_config(&args.db_path, config)
            .with_context(|| format!("Failed to open database at {}", args.db_path.display()))?
    };

    let result = run(&db, args.command);
    db.close();
    result
}

fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Put { key, value } => {
            db.put(key.as_bytes(), value.as_bytes())?;
        }
        Command::Get { key } => match db.get(key.as_bytes()) {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(LowkeyError::KeyNotFound) => bail!("key '{}' not found", key),
            Err(e) => return Err(e.into()),
        },
        Command::Delete { key } => {
            db.delete(key.as_bytes())
                .with_context(|| format!("Failed to delete '{}'", key))?;
        }
        Command::Count => {
            println!("{}", db.key_count()?);
        }
        Command::Stats => {
            let buffer = db.buffer_stats()?;
            println!("buffer pool:");
            println!("  capacity:        {}", buffer.capacity);
            println!("  pages in buffer: {}", buffer.pages_in_buffer);
            println!("  cache hits:      {}", buffer.cache_hits);
            println!("  cache misses:    {}", buffer.cache_misses);
            println!("  hit ratio:       {:.3}", buffer.hit_ratio);
            println!("  evictions:       {}", buffer.evictions);
            println!("  write backs:     {}", buffer.write_backs);

            let checkpoint = db.checkpoint_stats()?;
            println!("checkpoints:");
            println!("  performed:       {}", checkpoint.checkpoints_performed);
            println!("  pages written:   {}", checkpoint.pages_written);
            println!("  WAL size:        {}", checkpoint.wal_size);
            println!("  last checkpoint: {}", checkpoint.last_checkpoint_time);
        }
        Command::Checkpoint => {
            db.checkpoint()?;
            println!("checkpoint complete");
        }
    }
    Ok(())
}
