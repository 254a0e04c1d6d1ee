// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fil_vault::car::{list_blocks, unpack, verify_integrity, CarPacker, PackInput, ParseOptions};
use fil_vault::deals::deal_status;
use fil_vault::merkle::MerkleTree;
use fil_vault::retrieval::{RetrievalOptions, RetrievedData};
use fil_vault::utils::cid::parse_cid;
use fil_vault::{VaultConfig, VaultContext};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let config_path = std::env::var_os("FIL_VAULT_CONFIG").map(PathBuf::from);
    let config = VaultConfig::load(config_path.as_deref())?;

    match args[1].as_str() {
        "pack" => handle_pack(&args, &config),
        "unpack" => handle_unpack(&args, &config),
        "inspect" => handle_inspect(&args, &config),
        "cost" => handle_cost(&args, config).await,
        "status" => handle_status(&args),
        "merkle-root" => handle_merkle_root(&args),
        "verify-proof" => handle_verify_proof(&args, config).await,
        "retrieve" => handle_retrieve(&args, config).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  fil-vault pack <path> <out.car>");
    eprintln!("  fil-vault unpack <archive.car> <dir>");
    eprintln!("  fil-vault inspect <archive.car>");
    eprintln!("  fil-vault cost <size_bytes> <epochs> [verified]");
    eprintln!("  fil-vault status <start_epoch> <end_epoch> <current_epoch>");
    eprintln!("  fil-vault merkle-root <file>...");
    eprintln!("  fil-vault verify-proof <proof.json> <deal_id> <cid> [prover]");
    eprintln!("  fil-vault retrieve <cid> <out>");
    eprintln!();
    eprintln!("Configuration: FIL_VAULT_CONFIG=<file.toml>, FIL_VAULT_RPC_URL, FIL_VAULT_RPC_TOKEN, FIL_VAULT_PINNING_TOKEN");
}

fn need(args: &[String], count: usize, usage: &str) -> Result<()> {
    if args.len() < count {
        bail!("usage: {} {usage}", args[0]);
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_options(config: &VaultConfig) -> ParseOptions {
    ParseOptions {
        verify: config.car.verify_blocks,
    }
}

fn handle_pack(args: &[String], config: &VaultConfig) -> Result<()> {
    need(args, 4, "pack <path> <out.car>")?;
    let packer = CarPacker::new(config.car.chunk_size);
    let packed = packer.pack_to_file(&PackInput::Path(PathBuf::from(&args[2])), Path::new(&args[3]))?;
    print_json(&json!({
        "root": packed.root().to_string(),
        "blocks": packed.block_count,
        "payloadSize": packed.payload_size,
        "carSize": packed.bytes.len(),
    }))
}

fn handle_unpack(args: &[String], config: &VaultConfig) -> Result<()> {
    need(args, 4, "unpack <archive.car> <dir>")?;
    let bytes = std::fs::read(&args[2]).with_context(|| format!("read {}", args[2]))?;
    let entries = unpack(&bytes, Path::new(&args[3]), parse_options(config))?;
    print_json(&serde_json::to_value(entries)?)
}

fn handle_inspect(args: &[String], config: &VaultConfig) -> Result<()> {
    need(args, 3, "inspect <archive.car>")?;
    let bytes = std::fs::read(&args[2]).with_context(|| format!("read {}", args[2]))?;
    let options = parse_options(config);
    let valid = verify_integrity(&bytes, options)?;
    let blocks = list_blocks(&bytes, options)?;
    let root = fil_vault::car::get_root_cid(&bytes)?;
    print_json(&json!({
        "root": root.to_string(),
        "valid": valid,
        "blocks": blocks,
    }))
}

async fn handle_cost(args: &[String], config: VaultConfig) -> Result<()> {
    need(args, 4, "cost <size_bytes> <epochs> [verified]")?;
    let size: u64 = args[2].parse().context("size_bytes")?;
    let epochs: i64 = args[3].parse().context("epochs")?;
    let verified = args.get(4).is_some_and(|v| v == "verified" || v == "true");
    let context = VaultContext::from_config(config)?;
    let estimate = context
        .deals()
        .calculate_storage_cost(size, epochs, verified)
        .await?;
    print_json(&serde_json::to_value(estimate)?)
}

fn handle_status(args: &[String]) -> Result<()> {
    need(args, 5, "status <start_epoch> <end_epoch> <current_epoch>")?;
    let start: i64 = args[2].parse().context("start_epoch")?;
    let end: i64 = args[3].parse().context("end_epoch")?;
    let current: i64 = args[4].parse().context("current_epoch")?;
    if end <= start {
        bail!("end epoch {end} must be after start epoch {start}");
    }
    print_json(&json!({
        "status": deal_status(current, start, end),
        "remainingEpochs": (end - current.max(start)).max(0),
    }))
}

fn handle_merkle_root(args: &[String]) -> Result<()> {
    need(args, 3, "merkle-root <file>...")?;
    let leaves = args[2..]
        .iter()
        .map(|p| std::fs::read(p).with_context(|| format!("read {p}")))
        .collect::<Result<Vec<_>>>()?;
    let tree = MerkleTree::build(leaves.as_slice())?;
    print_json(&json!({
        "root": format!("0x{}", hex::encode(tree.root())),
        "leaves": tree.len(),
        "height": tree.height(),
    }))
}

async fn handle_verify_proof(args: &[String], config: VaultConfig) -> Result<()> {
    need(args, 5, "verify-proof <proof.json> <deal_id> <cid> [prover]")?;
    let input = std::fs::read_to_string(&args[2]).with_context(|| format!("read {}", args[2]))?;
    let deal_id: u64 = args[3].parse().context("deal_id")?;
    let cid = parse_cid(&args[4])?;
    // without an explicit prover only proofs.trusted_provers are accepted
    let prover = args.get(5).map(String::as_str);
    let context = VaultContext::from_config(config)?;
    let valid = context
        .proofs()
        .verify_serialized_proof(&input, &cid, Some(deal_id), prover)
        .await?;
    print_json(&json!({ "valid": valid }))
}

async fn handle_retrieve(args: &[String], config: VaultConfig) -> Result<()> {
    need(args, 4, "retrieve <cid> <out>")?;
    let cid = parse_cid(&args[2])?;
    let context = VaultContext::from_config(config)?;
    let options = RetrievalOptions {
        return_buffer: Some(false),
        output_path: Some(PathBuf::from(&args[3])),
        ..Default::default()
    };
    let result = context.retrieval().retrieve_data(&cid, &options).await?;
    let path = match &result.data {
        RetrievedData::File(path) => path.display().to_string(),
        RetrievedData::Buffer(_) => String::new(),
    };
    print_json(&json!({
        "cid": result.cid.to_string(),
        "source": result.source,
        "size": result.size,
        "path": path,
    }))
}
