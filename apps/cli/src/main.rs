use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use da_core::session::{Session, SessionOptions};
use da_core::transport::NusbTransport;
use da_core::{BootMode, Generation, LockState, TracingHandler};

#[derive(Parser, Debug)]
#[command(author, version, about = "MediaTek DA Protocol Tool (Pure Rust)", long_about = None)]
struct Args {
    /// Path to a TOML session options file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Protocol generation the connected DA speaks
    #[arg(long, value_enum)]
    generation: Option<CliGeneration>,

    /// USB vendor id (hex), default: scan known DA ports
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB product id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Transfer chunk size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump the raw partition table
    List {
        /// Output file, default: gpt.bin
        #[arg(long, default_value = "gpt.bin")]
        output: PathBuf,
    },
    /// Read one partition to a file
    Read {
        partition: String,
        /// Output file, default: <partition>.img
        output: Option<PathBuf>,
    },
    /// Read a raw flash range to a file
    ReadFlash {
        #[arg(value_parser = parse_hex_u64)]
        addr: u64,
        #[arg(value_parser = parse_hex_u64)]
        length: u64,
        output: PathBuf,
    },
    /// Read several partitions into a directory
    ReadAll {
        /// Partitions to read
        #[arg(required = true)]
        partitions: Vec<String>,
        /// Partitions to skip
        #[arg(long)]
        skip: Vec<String>,
        /// Output directory
        #[arg(long, default_value = ".")]
        outdir: PathBuf,
    },
    /// Write a file to one partition
    Write {
        partition: String,
        input: PathBuf,
    },
    /// Write a file to a raw flash range
    WriteFlash {
        #[arg(value_parser = parse_hex_u64)]
        addr: u64,
        input: PathBuf,
    },
    /// Erase one partition
    Erase { partition: String },
    /// Erase a raw flash range
    EraseFlash {
        #[arg(value_parser = parse_hex_u64)]
        addr: u64,
        #[arg(value_parser = parse_hex_u64)]
        length: u64,
    },
    /// Power the device off
    Shutdown,
    /// Reboot the device
    Reboot {
        #[arg(long, value_enum, default_value_t = CliBootMode::Normal)]
        mode: CliBootMode,
    },
    /// Read device memory
    Peek {
        #[arg(value_parser = parse_hex_u64)]
        addr: u64,
        #[arg(value_parser = parse_hex_u64)]
        length: u64,
    },
    /// Lock or unlock the security configuration
    Seccfg {
        #[arg(value_enum)]
        action: CliLockState,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliGeneration {
    V5,
    V6,
}

impl From<CliGeneration> for Generation {
    fn from(value: CliGeneration) -> Self {
        match value {
            CliGeneration::V5 => Generation::V5,
            CliGeneration::V6 => Generation::V6,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliBootMode {
    Normal,
    HomeScreen,
    Fastboot,
    Meta,
    Test,
}

impl From<CliBootMode> for BootMode {
    fn from(value: CliBootMode) -> Self {
        match value {
            CliBootMode::Normal => BootMode::Normal,
            CliBootMode::HomeScreen => BootMode::HomeScreen,
            CliBootMode::Fastboot => BootMode::Fastboot,
            CliBootMode::Meta => BootMode::Meta,
            CliBootMode::Test => BootMode::Test,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLockState {
    Lock,
    Unlock,
}

fn parse_hex_u64(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim_start_matches("0x").trim_start_matches("0X");
    let radix = if trimmed.len() == raw.len() { 10 } else { 16 };
    u64::from_str_radix(trimmed, radix).map_err(|e| e.to_string())
}

fn parse_hex_u16(raw: &str) -> Result<u16, String> {
    let trimmed = raw.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|e| e.to_string())
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

fn run(args: Args) -> Result<()> {
    let mut options = match &args.config {
        Some(path) => SessionOptions::load_from_file(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => SessionOptions::default(),
    };
    if let Some(generation) = args.generation {
        options.generation = generation.into();
    }
    if let Some(chunk) = args.chunk_size {
        options.chunk_size = Some(chunk);
    }

    let mut transport = match (args.vid, args.pid) {
        (Some(vid), Some(pid)) => NusbTransport::open_with_ids(vid, pid)?,
        (None, None) => NusbTransport::open()?,
        _ => bail!("--vid and --pid must be given together"),
    };
    transport.set_read_timeout(options.read_timeout_ms);

    let mut session = Session::open(Box::new(transport), &options, Arc::new(TracingHandler))?;
    info!(generation = ?session.generation(), "Session open");

    match args.command {
        Command::List { output } => {
            let table = session.partition_table()?;
            std::fs::write(&output, &table)?;
            info!(bytes = table.len(), path = %output.display(), "Partition table saved");
        }
        Command::Read { partition, output } => {
            let path = output.unwrap_or_else(|| PathBuf::from(format!("{}.img", partition)));
            let mut file = File::create(&path)?;
            let bytes = session.read_partition(&partition, &mut file)?;
            file.flush()?;
            info!(bytes, path = %path.display(), "Partition saved");
        }
        Command::ReadFlash {
            addr,
            length,
            output,
        } => {
            let mut file = File::create(&output)?;
            let bytes = session.read_flash(addr, length, &mut file)?;
            file.flush()?;
            info!(bytes, path = %output.display(), "Flash range saved");
        }
        Command::ReadAll {
            partitions,
            skip,
            outdir,
        } => {
            std::fs::create_dir_all(&outdir)?;
            let dir = outdir.clone();
            let results = session.read_all(&partitions, &skip, &mut move |name| {
                let file = File::create(dir.join(format!("{}.img", name)))?;
                Ok(Box::new(file))
            })?;
            for (name, bytes) in &results {
                info!(partition = %name, bytes, "Saved");
            }
        }
        Command::Write { partition, input } => {
            let size = std::fs::metadata(&input)?.len();
            let mut file = File::open(&input)?;
            session.write_partition(&partition, size, &mut file)?;
            info!(bytes = size, partition = %partition, "Partition written");
        }
        Command::WriteFlash { addr, input } => {
            let size = std::fs::metadata(&input)?.len();
            let mut file = File::open(&input)?;
            session.write_flash(addr, size, &mut file)?;
            info!(bytes = size, "Flash range written");
        }
        Command::Erase { partition } => {
            session.erase_partition(&partition)?;
            info!(partition = %partition, "Partition erased");
        }
        Command::EraseFlash { addr, length } => {
            session.erase_flash(addr, length)?;
            info!("Flash range erased");
        }
        Command::Shutdown => {
            session.shutdown()?;
            info!("Device shut down");
        }
        Command::Reboot { mode } => {
            session.reboot(mode.into())?;
            info!("Device rebooting");
        }
        Command::Peek { addr, length } => {
            let bytes = session.peek(addr, length as usize)?;
            for (i, chunk) in bytes.chunks(16).enumerate() {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
                println!("{:08X}: {}", addr + (i as u64) * 16, hex.join(" "));
            }
        }
        Command::Seccfg { action } => {
            let state = match action {
                CliLockState::Lock => LockState::Lock,
                CliLockState::Unlock => LockState::Unlock,
            };
            session.set_seccfg(state)?;
            info!(state = ?state, "Seccfg updated");
        }
    }

    Ok(())
}
