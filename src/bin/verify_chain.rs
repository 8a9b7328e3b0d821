use clap::Parser;
use crashline::{config::ConfigLoader, logging::init_tracing, CrashResolver, HashChainGenerator, LedgerStore};

#[derive(Parser, Debug)]
#[command(name = "verify-chain")]
#[command(about = "Check every stored hash segment and created round", long_about = None)]
struct Args {
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
    let chain = HashChainGenerator::new(
        store,
        CrashResolver::new(config.chain.instant_bust_modulus),
        config.chain.batch_size,
    );

    println!("🔍 Crashline Chain Verification");
    println!("================================");
    let report = chain.verify_stored()?;

    for segment in chain.segments()? {
        match segment.commitment {
            Some(commitment) => println!(
                "   Segment {}..={} commitment {}",
                segment.first_round_id, segment.last_round_id, commitment
            ),
            None => println!(
                "   Segment {}..={} incomplete",
                segment.first_round_id, segment.last_round_id
            ),
        }
    }
    println!();
    println!("Segments:        {}", report.segments);
    println!("Hashes checked:  {}", report.hashes_checked);
    println!("Rounds checked:  {}", report.rounds_checked);

    if report.is_valid() {
        println!("\n✅ Chain is valid");
        Ok(())
    } else {
        println!("\n❌ {} problem(s) found:", report.problems.len());
        for problem in &report.problems {
            println!("   - {}", problem);
        }
        std::process::exit(1);
    }
}
