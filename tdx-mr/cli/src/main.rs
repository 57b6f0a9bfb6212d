// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fs_err as fs;
use serde::Serialize;
use tdx_mr::kernel::{self, KernelDigests};
use tdx_mr::{
    identity, measure_log, Machine, Measurer, PageAddOrder, RtmrLogs, TdxMeasurements,
    REFERENCE_MEASUREMENTS,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use config::{parse_memory_size, CliConfig};
use pe::{PeTools, Uki};

mod config;
mod pe;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML file with defaults and machine configurations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print every event digest extended into the RTMRs
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure a firmware and UKI for one or more machine configurations
    Measure(MeasureArgs),
    /// Compute workload identifiers against the built-in reference measurements
    Reference(ReferenceArgs),
}

#[derive(Args)]
struct MeasureArgs {
    /// Path to the OVMF firmware image
    #[arg(long)]
    fw: PathBuf,

    /// Path to the unified kernel image
    #[arg(long)]
    uki: PathBuf,

    /// Memory size, e.g. 2G, 512M or a byte count
    #[arg(short, long, value_parser = parse_memory_size)]
    memory: Option<u64>,

    /// Number of CPUs
    #[arg(long)]
    cpu: Option<u32>,

    /// Machine configuration name, repeat for a batch
    #[arg(long = "configuration")]
    configurations: Vec<String>,

    /// MRTD page order: two-pass or single-pass
    #[arg(long)]
    mrtd_variant: Option<PageAddOrder>,

    /// Known-good MRTD in hex, skips the MRTD computation
    #[arg(long)]
    mrtd: Option<String>,

    /// Key provider: sgx-v0, none or 32 bytes of hex
    #[arg(long)]
    mrkp: Option<String>,

    /// Output JSON
    #[arg(long)]
    json: bool,

    /// Also print the RTMR event logs
    #[arg(long)]
    logs: bool,
}

#[derive(Args)]
struct ReferenceArgs {
    /// Path to the unified kernel image
    #[arg(long)]
    uki: PathBuf,

    /// Key provider: sgx-v0, none or 32 bytes of hex
    #[arg(long)]
    mrkp: Option<String>,
}

#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    measurements: &'a TdxMeasurements,
    #[serde(skip_serializing_if = "Option::is_none")]
    rtmr_logs: Option<[Vec<String>; 3]>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceReport {
    rtmr1: String,
    rtmr2: String,
    workload_ids: Vec<String>,
    rtmr0s: Vec<String>,
    mrtds: Vec<String>,
    mr_aggregated: Vec<String>,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn hex_logs(logs: &RtmrLogs) -> [Vec<String>; 3] {
    logs.each_ref().map(|log| log.iter().map(hex::encode).collect())
}

fn print_measurements(m: &TdxMeasurements) {
    println!("MRTD: {}", hex::encode(&m.mrtd));
    println!("RTMR0: {}", hex::encode(&m.rtmr0));
    println!("RTMR1: {}", hex::encode(&m.rtmr1));
    println!("RTMR2: {}", hex::encode(&m.rtmr2));
    println!("MR_AGGREGATED: {}", hex::encode(&m.mr_aggregated));
    println!("MR_IMAGE: {}", hex::encode(&m.mr_image));
    println!("WORKLOAD_ID: {}", hex::encode(&m.workload_id));
}

fn measure(args: &MeasureArgs, config: &CliConfig) -> Result<()> {
    let firmware = fs::read(&args.fw).context("Failed to read firmware")?;
    let image = fs::read(&args.uki).context("Failed to read UKI")?;
    let uki = Uki::parse(&image).context("Failed to parse UKI")?;

    let memory_size = match args.memory {
        Some(memory) => memory,
        None => config.memory.bytes()?,
    };
    let mrtd = args
        .mrtd
        .as_deref()
        .map(|mrtd| hex::decode(mrtd.strip_prefix("0x").unwrap_or(mrtd)))
        .transpose()
        .context("Invalid --mrtd")?;
    let mr_key_provider = config.key_provider(args.mrkp.as_deref())?;

    let names: Vec<&str> = if args.configurations.is_empty() {
        config.configuration.iter().map(String::as_str).collect()
    } else {
        args.configurations.iter().map(String::as_str).collect()
    };
    let Some(&first) = names.first() else {
        bail!("No machine configuration selected, pass --configuration");
    };

    let machine = Machine::builder()
        .firmware(&firmware)
        .kernel(uki.image)
        .initrd(uki.initrd)
        .kernel_cmdline(&uki.cmdline)
        .memory_size(memory_size)
        .cpu_count(args.cpu.unwrap_or(config.cpu))
        .configuration(first)
        .mrtd_variant(args.mrtd_variant.unwrap_or(config.mrtd_variant))
        .maybe_mrtd(mrtd.as_deref())
        .mr_key_provider(mr_key_provider)
        .build();
    let measurer = Measurer::builder()
        .configurations(&config.configurations)
        .authenticode(&PeTools)
        .sections(&PeTools)
        .build();

    if names.len() > 1 {
        if args.logs {
            warn!("--logs is ignored when measuring several configurations");
        }
        let batch = measurer
            .measure_batch(&machine, &names)
            .context("Failed to measure machine configurations")?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&batch)?);
        } else {
            for entry in &batch.configurations {
                println!("[{}]", entry.configuration);
                print_measurements(&entry.measurements);
            }
        }
        return Ok(());
    }

    let details = measurer
        .measure_with_logs(&machine)
        .context("Failed to measure machine configuration")?;
    if args.json {
        let report = Report {
            measurements: &details.measurements,
            rtmr_logs: args.logs.then(|| hex_logs(&details.rtmr_logs)),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_measurements(&details.measurements);
        if args.logs {
            for (index, log) in details.rtmr_logs.iter().enumerate() {
                for (event, digest) in log.iter().enumerate() {
                    println!("RTMR{index}[{event}]: {}", hex::encode(digest));
                }
            }
        }
    }
    Ok(())
}

fn reference(args: &ReferenceArgs, config: &CliConfig) -> Result<()> {
    let image = fs::read(&args.uki).context("Failed to read UKI")?;
    let uki = Uki::parse(&image).context("Failed to parse UKI")?;
    let mr_key_provider = config.key_provider(args.mrkp.as_deref())?;

    let digests = KernelDigests::compute(uki.image, &PeTools, &PeTools)
        .context("Failed to digest UKI")?;
    let rtmr1 = measure_log(&kernel::rtmr1_log(&digests)?);
    let rtmr2 = measure_log(&kernel::rtmr2_log(&uki.cmdline, uki.initrd));

    let mut report = ReferenceReport {
        rtmr1: hex::encode(&rtmr1),
        rtmr2: hex::encode(&rtmr2),
        workload_ids: vec![],
        rtmr0s: vec![],
        mrtds: vec![],
        mr_aggregated: vec![],
    };
    for reference in REFERENCE_MEASUREMENTS {
        let (mrtd, rtmr0) = (&reference.mrtd, &reference.rtmr0);
        report
            .workload_ids
            .push(hex::encode(identity::workload_id(mrtd, rtmr0, &rtmr1, &rtmr2)));
        report.mr_aggregated.push(hex::encode(identity::mr_aggregated(
            mrtd,
            rtmr0,
            &rtmr1,
            &rtmr2,
            &mr_key_provider,
        )));
        report.rtmr0s.push(hex::encode(rtmr0));
        report.mrtds.push(hex::encode(mrtd));
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = CliConfig::load(cli.config.as_deref())?;
    match &cli.command {
        Commands::Measure(args) => measure(args, &config),
        Commands::Reference(args) => reference(args, &config),
    }
}
