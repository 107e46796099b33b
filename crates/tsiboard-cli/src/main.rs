//! tsiboard command line.
//!
//! Thin wrapper over the library crates: decode a canonical path or a
//! JKSPEC document, validate a circuit board file, pack CSV history into a
//! binary channel file, or build and execute a full board from a contract
//! directory plus a wave file.

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tsiboard_data::packer;
use tsiboard_data::{BasicRecord, KlineRecord};
use tsiboard_dsl::{canonical_path, circuit, jkspec, ContractRecord, WaveRecord};
use tsiboard_runtime::{build_board, CancellationToken, Executor, RuntimeContext};

#[derive(Parser)]
#[command(name = "tsiboard", about = "dataflow board runtime for market time-series", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum RecordKind {
    Kline,
    Basic,
}

#[derive(Subcommand)]
enum Command {
    /// Decode one canonical path expression and print the result as JSON.
    DecodePath {
        /// Path expression, e.g. `tsi.wikimyei.representation.vicreg@payload:tensor`
        text: String,
    },
    /// Decode a JKSPEC file and print the materialized tables as JSON.
    DecodeJkspec {
        file: PathBuf,
    },
    /// Decode and validate a circuit board file.
    ValidateCircuit {
        file: PathBuf,
    },
    /// Pack a CSV history file into a binary channel file.
    PackCsv {
        #[arg(long, value_enum)]
        record: RecordKind,
        csv: PathBuf,
        bin: PathBuf,
    },
    /// Build a board from a contract directory and run the selected wave.
    Run {
        /// Directory holding circuit.dsl, observation_sources.dsl,
        /// observation_channels.dsl and jkimyei_specs.dsl
        #[arg(long)]
        contract_dir: PathBuf,
        /// Wave file holding one or more WAVE blocks
        #[arg(long)]
        wave_file: PathBuf,
        /// Name of the WAVE block to execute
        #[arg(long)]
        wave: String,
        /// Event budget for the executor
        #[arg(long, default_value_t = 1_000_000)]
        max_events: usize,
    },
}

fn read_text(path: &PathBuf) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let ctx = RuntimeContext::new(Device::Cpu);

    match cli.command {
        Command::DecodePath { text } => {
            let decoded = canonical_path::decode(&text, &ctx.hash_names)?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
        Command::DecodeJkspec { file } => {
            let specs = jkspec::decode(&read_text(&file)?)?;
            println!("{}", serde_json::to_string_pretty(&specs)?);
        }
        Command::ValidateCircuit { file } => {
            let instruction = circuit::decode(&read_text(&file)?)?;
            circuit::validate_circuit_instruction(&instruction, &ctx.hash_names)?;
            println!(
                "ok: {} circuit(s) validated",
                instruction.circuits.len()
            );
        }
        Command::PackCsv { record, csv, bin } => {
            let written = match record {
                RecordKind::Kline => packer::csv_to_binary::<KlineRecord>(&csv, &bin)?,
                RecordKind::Basic => packer::csv_to_binary::<BasicRecord>(&csv, &bin)?,
            };
            println!("packed {written} records into {}", bin.display());
        }
        Command::Run { contract_dir, wave_file, wave, max_events } => {
            let contract = ContractRecord::new(
                read_text(&contract_dir.join("circuit.dsl"))?,
                read_text(&contract_dir.join("observation_sources.dsl"))?,
                read_text(&contract_dir.join("observation_channels.dsl"))?,
                read_text(&contract_dir.join("jkimyei_specs.dsl"))?,
            );
            let contract = ctx.contracts.register_contract(contract)?;
            let wave_record = ctx.contracts.register_wave(WaveRecord::new(read_text(&wave_file)?))?;
            tracing::info!(
                contract_hash = %contract.hash,
                wave_hash = %wave_record.hash,
                "contract and wave registered"
            );

            let mut board = build_board(&ctx, &contract, &wave_record, &wave)?;

            let executor = Executor::new(max_events, CancellationToken::new());
            let reports = executor.run_board(&mut board)?;
            for (i, report) in reports.iter().enumerate() {
                println!(
                    "contract[{i}] events={} epochs={} batches={} stop={:?}",
                    report.events_processed,
                    report.epochs_completed,
                    report.batches_processed,
                    report.stop_reason
                );
            }
        }
    }
    Ok(())
}
