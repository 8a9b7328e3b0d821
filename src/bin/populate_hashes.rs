//! Generate the next segment of the round hash chain.
//!
//! Resumes an interrupted segment when one exists; that requires the seed it
//! was started with.

use clap::Parser;
use crashline::{config::ConfigLoader, logging::init_tracing, CrashResolver, HashChainGenerator, LedgerStore};
use rand::RngCore;

#[derive(Parser, Debug)]
#[command(name = "populate-hashes")]
#[command(about = "Precompute a segment of the Crashline hash chain", long_about = None)]
struct Args {
    /// Secret seed for the new segment (falls back to CRASHLINE_CHAIN_SEED, then a random seed)
    #[arg(long)]
    seed: Option<String>,

    /// Rounds in the new segment
    #[arg(long, default_value = "1000000")]
    count: u64,

    /// Hashes persisted per transaction
    #[arg(long)]
    batch_size: Option<usize>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override storage.data_directory
    #[arg(long)]
    db_path: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(ref path) = args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(dir) = args.db_path {
        config.storage.data_directory = dir;
    }
    config.storage.clear_on_start = false;
    init_tracing(&config.monitoring.log_filter);

    let store = LedgerStore::open(&config.storage)?;
    let resolver = CrashResolver::new(config.chain.instant_bust_modulus);
    let chain = HashChainGenerator::new(
        store,
        resolver,
        args.batch_size.unwrap_or(config.chain.batch_size),
    );

    let (from, count) = match chain.pending_segment()? {
        Some(pending) => {
            println!(
                "🔁 Resuming segment {}..={} (lowest written {})",
                pending.first_round_id, pending.last_round_id, pending.lowest_written
            );
            (pending.first_round_id - 1, pending.last_round_id - pending.first_round_id + 1)
        }
        None => (chain.head()?, args.count),
    };

    let seed = match args.seed.or_else(|| std::env::var("CRASHLINE_CHAIN_SEED").ok()) {
        Some(seed) => seed,
        None => {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            let seed = hex::encode(bytes);
            println!("🔑 Generated seed (keep it secret, it is needed to resume): {}", seed);
            seed
        }
    };

    println!("🌱 Generating rounds {}..={}", from + 1, from + count);
    let segment = chain.extend(from, count, &seed)?;

    println!("✅ Done! {} hashes stored", segment.pairs.len());
    println!("   Commitment: {}", segment.commitment);
    println!("   Publish the commitment before round {} is played.", from + 1);

    Ok(())
}
