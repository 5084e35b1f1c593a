mod progress;

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use edl_core::firehose::{FirehoseServer, PowerAction};
use edl_core::flasher::{BypassRule, FlashOptions, ProgramFlasher, generate_rawprogram};
use edl_core::partition::PartitionInfo;
use edl_core::sahara::SaharaServer;
use edl_core::session::{EdlSession, SessionConfig};
use edl_core::sparse;
use edl_core::transport::Transport;
use tracing::{error, info};

use crate::progress::BarObserver;

#[derive(Parser, Debug)]
#[command(author, version, about = "Qualcomm EDL Tool (Sahara + Firehose)", long_about = None)]
struct Args {
    /// Serial port of the device. USB is polled when omitted.
    #[arg(long, global = true)]
    port: Option<String>,

    /// Firehose programmer (prog_firehose_*.elf / .mbn)
    #[arg(long, global = true)]
    loader: Option<String>,

    /// TOML session configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage type: UFS, eMMC, ...
    #[arg(long, global = true)]
    memory: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the device identity in Sahara command mode
    Info,
    /// Print partition tables
    Printgpt {
        /// Only this LUN
        #[arg(long)]
        lun: Option<u32>,
        /// Include the PrimaryGPT/BackupGPT pseudo entries
        #[arg(long)]
        pseudo: bool,
        /// Also write the table as a rawprogram manifest
        #[arg(long)]
        rawprogram: Option<PathBuf>,
    },
    /// Dump a partition to a file
    Read {
        label: String,
        output: PathBuf,
        #[arg(long)]
        lun: Option<u32>,
    },
    /// Program an image (sparse or raw) into a partition
    Write {
        label: String,
        image: PathBuf,
        #[arg(long)]
        lun: Option<u32>,
        /// Use the two-stage pipeline for sparse images
        #[arg(long)]
        pipeline: bool,
    },
    /// Erase a partition
    Erase {
        label: String,
        #[arg(long)]
        lun: Option<u32>,
    },
    /// Flash a flat build (rawprogramN.xml / patchN.xml)
    Flash {
        dir: PathBuf,
        /// Skip `label`, `label:-1` or `label:LUN`
        #[arg(long)]
        bypass: Vec<BypassRule>,
        /// Use the two-stage pipeline for sparse images
        #[arg(long)]
        pipeline: bool,
        /// Reset the device when done
        #[arg(long)]
        reset: bool,
    },
    /// Power request: reset, off, edl
    Reset {
        #[arg(long, default_value = "reset")]
        action: PowerAction,
        #[arg(long, default_value_t = 1)]
        delay: u32,
    },
    /// Expand a sparse image to a raw file (no device needed)
    Unsparse { input: PathBuf, output: PathBuf },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn session_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(loader) = &args.loader {
        config.programmer_path = Some(loader.clone());
    }
    if let Some(memory) = &args.memory {
        config.memory_name = memory.clone();
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    if let Command::Unsparse { input, output } = &args.command {
        return unsparse(input, output);
    }

    let config = session_config(&args)?;
    let observer = Arc::new(BarObserver::new());
    let mut session = EdlSession::with_observer(config, observer.clone());

    if let Command::Info = args.command {
        let transport = session.connect()?;
        let mut sahara = SaharaServer::new(transport);
        let identity = session.identify(&mut sahara)?;
        println!("{identity}");
        session.complete();
        return Ok(());
    }

    let (identity, mut firehose) = session.open()?;
    info!(hwid = %identity.hardware_id, target = %firehose.config().target_name, "Firehose ready");

    match args.command {
        Command::Printgpt {
            lun,
            pseudo,
            rawprogram,
        } => {
            let partitions = match lun {
                Some(lun) => firehose.enumerate_partitions(lun, pseudo)?,
                None => firehose.enumerate_all_partitions(pseudo),
            };
            for partition in &partitions {
                println!("{partition}");
            }
            if let Some(path) = rawprogram {
                std::fs::write(&path, generate_rawprogram(&partitions, true))
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!(path = %path.display(), "Manifest written");
            }
        }
        Command::Read { label, output, lun } => {
            let partition = find_partition(&mut firehose, &label, lun)?;
            firehose.read_partition_to_path(&partition, &output)?.check()?;
        }
        Command::Write {
            label,
            image,
            lun,
            pipeline,
        } => {
            let mut partition = find_partition(&mut firehose, &label, lun)?;
            partition.is_sparse = sparse::is_sparse_file(&image)
                .with_context(|| format!("Failed to open {}", image.display()))?;
            partition.source_path = Some(image);
            let flasher = ProgramFlasher::new(vec![partition], Vec::new())
                .with_options(flash_options(session.config(), pipeline));
            flasher.flash(&mut firehose)?.check()?;
        }
        Command::Erase { label, lun } => {
            let partition = find_partition(&mut firehose, &label, lun)?;
            firehose.erase_partition(&partition)?.check()?;
        }
        Command::Flash {
            dir,
            bypass,
            pipeline,
            reset,
        } => {
            let flasher = ProgramFlasher::from_dir(&dir)
                .with_context(|| format!("Failed to load flat build from {}", dir.display()))?
                .with_bypass(bypass)
                .with_options(flash_options(session.config(), pipeline));
            flasher.flash(&mut firehose)?.check()?;
            if reset {
                session.reset_device(&mut firehose, 1, PowerAction::Reset)?;
            }
        }
        Command::Reset { action, delay } => {
            session.reset_device(&mut firehose, delay, action)?;
        }
        Command::Info | Command::Unsparse { .. } => unreachable!("handled above"),
    }

    observer.finish();
    session.complete();
    Ok(())
}

/// `--pipeline` forces the sparse pipeline on; otherwise the config decides.
fn flash_options(config: &SessionConfig, pipeline: bool) -> FlashOptions {
    let mut options = config.flash_options();
    options.sparse_pipeline |= pipeline;
    options
}

/// Look `label` up across every LUN, or only `lun` when given.
fn find_partition<T: Transport>(
    firehose: &mut FirehoseServer<T>,
    label: &str,
    lun: Option<u32>,
) -> Result<PartitionInfo> {
    let partitions = match lun {
        Some(lun) => firehose.enumerate_partitions(lun, true)?,
        None => firehose.enumerate_all_partitions(true),
    };
    partitions
        .into_iter()
        .find(|p| p.label == label)
        .ok_or_else(|| anyhow!("Partition '{label}' not found"))
}

fn unsparse(input: &Path, output: &Path) -> Result<()> {
    if !sparse::is_sparse_file(input)? {
        bail!("{} is not a sparse image", input.display());
    }
    let mut image = sparse::open_sparse(input)?;
    let expected = image.decoded_len();
    let mut sink = BufWriter::new(File::create(output)?);
    let written = io::copy(&mut image, &mut sink)?;
    info!(input = %input.display(), output = %output.display(), written, expected, "Image expanded");
    Ok(())
}
