use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use blecrc::config::AppConfig;
use blecrc::protocol::{checksum, hex, ByteOrder, Frame};
use blecrc::transport::FrameReader;

#[derive(Parser)]
#[command(name = "blecrc", about = "CRC-16 checksums and frames for BLE service links")]
struct Cli {
    /// Config file to use instead of ~/.config/blecrc/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the checksum byte order from the config
    #[arg(long, global = true, value_enum)]
    order: Option<OrderArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Big,
    Little,
}

impl From<OrderArg> for ByteOrder {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Big => ByteOrder::Big,
            OrderArg::Little => ByteOrder::Little,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print the CRC-16 of some bytes
    Sum {
        #[command(flatten)]
        input: Input,
        /// Print a JSON object instead of the bare checksum
        #[arg(long)]
        json: bool,
    },
    /// Wrap a payload in a frame and print it as hex
    Frame {
        #[command(flatten)]
        input: Input,
    },
    /// Validate a frame and print its payload
    Verify {
        #[command(flatten)]
        input: Input,
    },
    /// Read a raw byte stream and print every valid frame in it
    Decode {
        /// Stream to read, `-` for stdin
        #[arg(long, default_value = "-")]
        file: PathBuf,
    },
    /// Write the effective configuration to the config file
    Init,
}

#[derive(clap::Args)]
struct Input {
    /// Hex bytes, e.g. `5a0003010203`
    #[arg(conflicts_with = "file")]
    hex: Option<String>,
    /// Read raw bytes from a file, `-` for stdin
    #[arg(long)]
    file: Option<PathBuf>,
}

impl Input {
    fn read(&self) -> Result<Vec<u8>> {
        if let Some(text) = &self.hex {
            return Ok(hex::decode(text)?);
        }
        match &self.file {
            Some(path) if path.as_os_str() != "-" => {
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))
            }
            _ => {
                let mut data = Vec::new();
                std::io::stdin()
                    .read_to_end(&mut data)
                    .context("reading stdin")?;
                Ok(data)
            }
        }
    }
}

#[derive(Serialize)]
struct SumReport {
    length: usize,
    crc: String,
    bytes: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("blecrc=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    if let Some(order) = cli.order {
        config.byte_order = order.into();
    }
    debug!("Using {:?}", config);
    let codec = config.codec();

    match cli.command {
        Command::Sum { input, json } => {
            let data = input.read()?;
            let crc = checksum(&data);
            if json {
                let report = SumReport {
                    length: data.len(),
                    crc: format!("0x{:04X}", crc),
                    bytes: hex::encode(&config.byte_order.to_bytes(crc)),
                };
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("0x{:04X}", crc);
            }
        }
        Command::Frame { input } => {
            let frame = Frame::new(input.read()?);
            let bytes = codec.encode(&frame)?;
            println!("{}", hex::encode(&bytes));
        }
        Command::Verify { input } => {
            let data = input.read()?;
            let frame = codec.decode(&data).context("frame rejected")?;
            println!("{}", hex::encode(&frame.payload));
        }
        Command::Decode { file } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(decode_stream(file, config))?;
        }
        Command::Init => match &cli.config {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        },
    }

    Ok(())
}

async fn decode_stream(file: PathBuf, config: AppConfig) -> Result<()> {
    let source: Box<dyn AsyncRead + Unpin + Send> = if file.as_os_str() == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let f = tokio::fs::File::open(&file)
            .await
            .with_context(|| format!("opening {}", file.display()))?;
        Box::new(f)
    };

    let mut reader = FrameReader::new(source, config.codec());
    let mut count = 0usize;
    while let Some(frame) = reader.next_frame().await? {
        println!("{}", frame);
        count += 1;
    }
    info!("{} frames decoded, {} dropped", count, reader.dropped());
    Ok(())
}
