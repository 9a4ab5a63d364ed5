use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitforge::config::{ConfigArgs, NodeConfig};
use bitforge::core::{codec, merkle};
use bitforge::core::params::NetworkParams;
use bitforge::core::processor::BlockProcessor;
use bitforge::core::script::StandardScriptEngine;
use bitforge::core::types::*;
use bitforge::core::validator::{BlockStatus, Validator, ValidatorEvents};
use bitforge::pow;
use bitforge::storage::{BlockLocation, ChainStore};

#[derive(Parser)]
#[command(name = "bitforge", version)]
#[command(about = "BitForge - Bitcoin block validation with a durable chain store")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, config file and genesis state
    Init,
    /// Show the main chain and branch state
    Info,
    /// Validate blocks from a blk*.dat style file (magic + length framed)
    Import { file: PathBuf },
    /// Rebuild the genesis block and check it against the store
    VerifyGenesis,
}

/// Tallies block outcomes during an import.
#[derive(Default)]
struct ImportTally {
    counts: [u64; 8],
    reorgs: u64,
}

impl ImportTally {
    fn slot(status: BlockStatus) -> usize {
        match status {
            BlockStatus::Main => 0,
            BlockStatus::Side => 1,
            BlockStatus::Orphan => 2,
            BlockStatus::Bad => 3,
            BlockStatus::BadTime => 4,
            BlockStatus::Duplicate => 5,
            BlockStatus::NoNew => 6,
            BlockStatus::Error => 7,
        }
    }
}

impl ValidatorEvents for ImportTally {
    type Context = ();

    fn on_block_finished(&mut self, _: &Block, status: BlockStatus, _: &mut ()) {
        self.counts[Self::slot(status)] += 1;
    }

    fn on_remove_block(&mut self, _: u8, _: &Block, _: u32, _: &mut ()) {
        self.reorgs += 1;
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("❌ {}", message);
    std::process::exit(1);
}

fn open_validator<E: ValidatorEvents>(data_dir: &Path, config: &NodeConfig, events: E) -> Validator<E> {
    let params = config.params().unwrap_or_else(|e| fail(e));
    std::fs::create_dir_all(data_dir).unwrap_or_else(|e| fail(e));
    let store = ChainStore::open(data_dir, config.database_config()).unwrap_or_else(|e| fail(e));
    Validator::open(params, config.validator_flags(), Arc::new(store), Box::new(StandardScriptEngine), events)
        .unwrap_or_else(|e| fail(e))
}

/// Payloads of every `magic | len | block` record, skipping padding.
fn framed_blocks(data: &[u8], magic: [u8; 4]) -> Vec<&[u8]> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        if data[pos..pos + 4] != magic {
            pos += 1;
            continue;
        }
        let len = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]) as usize;
        let start = pos + 8;
        let Some(payload) = data.get(start..start + len) else {
            tracing::warn!("⚠️ Truncated record at offset {}", pos);
            break;
        };
        blocks.push(payload);
        pos = start + len;
    }
    blocks
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bitforge=info".parse().unwrap_or_else(|e| fail(e))),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.config.data_dir();
    let config = cli.config.resolve().unwrap_or_else(|e| fail(e));

    match cli.command {
        Commands::Init => {
            if !NodeConfig::path(&data_dir).exists() {
                config.save(&data_dir).unwrap_or_else(|e| fail(e));
            }
            let validator = open_validator(&data_dir, &config, ());
            let summary = validator.summary();
            println!("🔨 BitForge initialized!");
            println!("  Data:    {}", data_dir.display());
            println!("  Network: {}", config.network);
            println!("  Height:  {}", summary.height);
            println!("  Tip:     {}", hash_to_hex(&summary.tip));
            println!("\n  Run: bitforge import <blk file>");
        }

        Commands::Info => {
            let validator = open_validator(&data_dir, &config, ());
            let summary = validator.summary();
            println!("📊 BitForge ({})", config.network);
            println!("  Height:   {}", summary.height);
            println!("  Tip:      {}", hash_to_hex(&summary.tip));
            println!("  Work:     0x{}", summary.work.to_str_radix(16));
            println!("  Main:     branch {}", summary.main_branch);
            println!("  Orphans:  {}", validator.shared().lock().orphans.len());
            for (id, branch) in validator.branches().iter().enumerate() {
                let Some(branch) = branch else { continue };
                println!(
                    "  Branch {}: heights {}..{} ({} blocks){}",
                    id,
                    branch.start_height,
                    branch.next_height(),
                    branch.num_blocks,
                    if id as u8 == summary.main_branch { " (main)" } else { "" }
                );
            }
        }

        Commands::Import { file } => {
            let data = std::fs::read(&file).unwrap_or_else(|e| fail(format!("{}: {}", file.display(), e)));
            let validator = open_validator(&data_dir, &config, ImportTally::default());
            let magic = validator.params().magic;
            let processor = BlockProcessor::start(validator).unwrap_or_else(|e| fail(e));

            println!("📥 Importing {}...", file.display());
            let start = std::time::Instant::now();
            let mut decoded = 0u64;
            for payload in framed_blocks(&data, magic) {
                match codec::decode_block(payload, true) {
                    Ok((block, _)) => {
                        decoded += 1;
                        if let Err(e) = processor.queue_block(block, ()) {
                            fail(e);
                        }
                    }
                    Err(e) => tracing::warn!("⚠️ Skipping undecodable block: {}", e),
                }
            }

            let Some(validator) = processor.shutdown() else { fail("block processor failed") };
            let tally = validator.events();
            println!("  ✅ {} blocks in {:.1}s", decoded, start.elapsed().as_secs_f64());
            println!(
                "  Main {} · Side {} · Orphan {} · Bad {} · BadTime {} · Duplicate {} · NoNew {} · Error {}",
                tally.counts[0],
                tally.counts[1],
                tally.counts[2],
                tally.counts[3],
                tally.counts[4],
                tally.counts[5],
                tally.counts[6],
                tally.counts[7]
            );
            println!("  Blocks disconnected by reorganisations: {}", tally.reorgs);
            println!("  Height {} tip {}", validator.main_height(), hash_to_hex(&validator.summary().tip));
        }

        Commands::VerifyGenesis => {
            let params = config.params().unwrap_or_else(|e| fail(e));
            let genesis = params.genesis_block();
            let hash = genesis.hash();
            println!("🔍 {} genesis {}", params.name, hash_to_hex(&hash));
            println!("  Merkle root: {}", hash_to_hex(&genesis.header().merkle_root));

            let raw = codec::encode_block(&genesis, true);
            let hashes = merkle::transaction_hashes_from_block_bytes(&raw).unwrap_or_else(|e| fail(e));
            let mut ok = genesis.compute_merkle_root() == genesis.header().merkle_root;
            ok &= merkle::merkle_root(&hashes) == genesis.header().merkle_root;
            if params.name == NetworkParams::mainnet().name {
                ok &= pow::check_proof_of_work(&hash, genesis.target(), params.max_target);
            }
            if data_dir.exists() {
                let store = ChainStore::open(&data_dir, config.database_config()).unwrap_or_else(|e| fail(e));
                match store.load_block_hash(BlockLocation::new(0, 0)) {
                    Ok(Some(stored)) => {
                        println!("  Stored:      {}", hash_to_hex(&stored));
                        ok &= stored == hash;
                    }
                    Ok(None) => println!("  Stored:      (none, run init)"),
                    Err(e) => fail(e),
                }
            }
            if ok {
                println!("  ✅ Genesis verified");
            } else {
                fail("genesis mismatch");
            }
        }
    }
}
