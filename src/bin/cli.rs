//! vloop CLI
//!
//! One-shot operations against a transient device bound to a backing file.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use vloop::{
    BackingRef, Config, DeviceFlags, DeviceHandle, Engine, IoRequest, LoopConfig, TenantKey,
    TRANSFORM_XOR,
};

/// vloop CLI
#[derive(Parser, Debug)]
#[command(name = "vloop")]
#[command(about = "Expose a file as a virtual block device and run one operation on it")]
#[command(version)]
struct Args {
    /// Backing file
    backing: PathBuf,

    /// Byte offset into the backing file
    #[arg(long, default_value = "0")]
    offset: u64,

    /// Cap on the exposed size in bytes
    #[arg(long)]
    size_limit: Option<u64>,

    /// Logical block size (0 derives it from the backing file)
    #[arg(long, default_value = "0")]
    block_size: u32,

    /// Apply the XOR transform with this key
    #[arg(long)]
    xor_key: Option<String>,

    /// Bind read-only
    #[arg(long)]
    read_only: bool,

    /// Use the async direct path for reads and writes
    #[arg(long)]
    direct_io: bool,

    /// Route the command through this tenant's worker
    #[arg(long)]
    tenant: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a range and print it
    Read {
        /// Device offset in bytes
        offset: u64,

        /// Length in bytes
        len: usize,

        /// Print a CRC32 of the range instead of a hex dump
        #[arg(long)]
        crc: bool,
    },

    /// Fill a range with a byte or a repeated text
    Write {
        /// Device offset in bytes
        offset: u64,

        /// Length in bytes
        len: usize,

        /// Fill byte
        #[arg(long, default_value = "0")]
        byte: u8,

        /// Repeat this text instead of a fill byte
        #[arg(long)]
        text: Option<String>,
    },

    /// Discard a range
    Discard {
        /// Device offset in bytes
        offset: u64,

        /// Length in bytes
        len: u64,
    },

    /// Print the device status
    Status,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vloop=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> vloop::Result<()> {
    let config = Config::builder().initial_devices(0).build();
    let engine = Engine::new(config)?;
    let id = engine.get_free()?;
    let handle = engine.open(id, !args.read_only)?;

    let backing = if args.read_only {
        BackingRef::path_read_only(&args.backing)
    } else {
        BackingRef::path(&args.backing)
    };
    let mut builder = LoopConfig::builder(backing)
        .offset(args.offset)
        .block_size(args.block_size);
    if let Some(limit) = args.size_limit {
        builder = builder.size_limit(limit);
    }
    if args.read_only {
        builder = builder.flag(DeviceFlags::READ_ONLY);
    }
    if args.direct_io {
        builder = builder.flag(DeviceFlags::DIRECT_IO);
    }
    if let Some(key) = &args.xor_key {
        builder = builder.transform(TRANSFORM_XOR, key.as_bytes()).crypt_name("xor");
    }
    handle.configure(builder.build())?;

    let result = run_command(&handle, &args);
    handle.clear()?;
    result
}

fn run_command(handle: &DeviceHandle, args: &Args) -> vloop::Result<()> {
    let tag = |req: IoRequest| match args.tenant {
        Some(raw) => req.tenant(TenantKey::new(raw)),
        None => req,
    };

    match &args.command {
        Commands::Read { offset, len, crc } => {
            let data = handle.execute(tag(IoRequest::read(*offset, *len))).into_bytes()?;
            if *crc {
                println!("{:08x}", crc32fast::hash(&data));
            } else {
                hex_dump(*offset, &data);
            }
        }
        Commands::Write {
            offset,
            len,
            byte,
            text,
        } => {
            let data: Vec<u8> = match text {
                Some(text) if !text.is_empty() => text.bytes().cycle().take(*len).collect(),
                _ => vec![*byte; *len],
            };
            let written = handle.execute(tag(IoRequest::write_from(*offset, &data))).result?;
            handle.flush()?;
            println!("wrote {} bytes at {}", written, offset);
        }
        Commands::Discard { offset, len } => {
            handle.execute(tag(IoRequest::discard(*offset, *len))).result?;
            println!("discarded {} bytes at {}", len, offset);
        }
        Commands::Status => {
            let status = handle.get_status()?;
            println!("device:     vloop{}", status.number);
            println!("file:       {}", status.file_name);
            println!("offset:     {}", status.offset);
            match status.size_limit {
                Some(limit) => println!("size limit: {}", limit),
                None => println!("size limit: none"),
            }
            println!("capacity:   {}", status.capacity);
            println!("block size: {}", status.block_size);
            println!("flags:      {:?}", status.flags);
            println!("transform:  {} ({})", status.transform, status.crypt_name);
            println!(
                "backing:    dev={} ino={}",
                status.backing.dev, status.backing.ino
            );
        }
    }
    Ok(())
}

fn hex_dump(base: u64, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  {}", base + (i * 16) as u64, hex.join(" "), ascii);
    }
}
