//! xbdm - command-line client for the Xbox 360 debug monitor.
//!
//! Thin wrapper over the `xbdm_link` library for poking at a console from a
//! shell. Settings come from `config.json` and `XBDM_*` variables; `--host`
//! and `--port` override them.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use xbdm_link::{
    Capability, Connection, ConsoleConfig, ConsoleEvent, DynamicAddress, TemperatureSensor,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "xbdm")]
#[command(about = "Talk to an Xbox 360 debug monitor", long_about = None)]
struct Cli {
    /// Console address (overrides config and XBDM_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Console port (overrides config and XBDM_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show console name, id, execution state and detected features
    Info,
    /// Dump memory as hex
    Peek {
        /// Start address (hex)
        #[arg(value_parser = parse_hex_u32)]
        address: u32,
        /// Number of bytes
        #[arg(default_value_t = 64)]
        length: usize,
    },
    /// Write hex bytes to memory
    Poke {
        /// Start address (hex)
        #[arg(value_parser = parse_hex_u32)]
        address: u32,
        /// Bytes as a hex string, e.g. 60000000
        bytes: String,
    },
    /// Resolve a pointer chain such as 82001000->10->-4
    Resolve {
        /// Base and offsets joined by ->
        chain: DynamicAddress,
    },
    /// List memory regions
    Regions {
        /// Only regions safe to read
        #[arg(long)]
        read: bool,
        /// Only regions safe to write
        #[arg(long)]
        write: bool,
    },
    /// List threads
    Threads,
    /// Stop title execution
    Freeze,
    /// Resume title execution
    Unfreeze,
    /// Send a raw command and print the reply
    Send {
        /// Command text
        command: String,
    },
    /// Print notifications until interrupted
    Listen {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print or persist the effective configuration
    Config {
        /// Write the effective configuration to config.json
        #[arg(long)]
        save: bool,
    },
}

fn parse_hex_u32(text: &str) -> std::result::Result<u32, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex address {text:?}: {e}"))
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if let Some(bad) = text.chars().find(|c| !c.is_whitespace() && !c.is_ascii_hexdigit()) {
        bail!("invalid hex digit {bad:?}");
    }
    if digits.len() % 2 != 0 {
        bail!("hex byte string has an odd number of digits");
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).context("hex digits are ASCII")?;
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte {pair:?}"))
        })
        .collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = ConsoleConfig::load()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: ConsoleConfig) -> Result<()> {
    if let Commands::Config { save } = command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if save {
            config.save()?;
            println!("Saved to {}", ConsoleConfig::config_dir()?.join("config.json").display());
        }
        return Ok(());
    }

    let endpoint = config.endpoint();
    let conn = Connection::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?;

    let outcome = execute(&conn, command).await;
    conn.close();
    outcome
}

async fn execute(conn: &Connection, command: Commands) -> Result<()> {
    match command {
        Commands::Info => {
            let token = conn.busy().await?;
            println!("name:      {}", token.debug_name().await?);
            println!("console:   {}", token.console_id().await?);
            println!("state:     {:?}", token.execution_state().await?);
            match token.xbe_name(None).await? {
                Some(xbe) => println!("title:     {xbe}"),
                None => println!("title:     (none)"),
            }
            match token.detect_features().await {
                Ok(features) => {
                    println!("features:  {features:?}");
                    if features.contains(Capability::Jrpc2) {
                        let cpu = token.temperature(TemperatureSensor::Cpu).await?;
                        println!("cpu temp:  {cpu}");
                    }
                }
                Err(e) => println!("features:  probe failed ({e})"),
            }
        }
        Commands::Peek { address, length } => {
            let bytes = conn
                .read_bytes(address, length)
                .await
                .with_context(|| format!("Failed to read {length} bytes at {address:08X}"))?;
            for (row, line) in bytes.chunks(16).enumerate() {
                let hex: Vec<String> = line.iter().map(|b| format!("{b:02X}")).collect();
                println!("{:08X}  {}", address as usize + row * 16, hex.join(" "));
            }
        }
        Commands::Poke { address, bytes } => {
            let data = parse_hex_bytes(&bytes)?;
            let report = conn.write_bytes(address, &data).await?;
            if report.fully_mapped() {
                println!("Wrote {} bytes at {address:08X}", report.bytes_written);
            } else {
                println!(
                    "Wrote {} bytes at {address:08X}; {} chunk(s) hit unmapped memory",
                    report.bytes_written, report.unmapped_chunks
                );
            }
        }
        Commands::Resolve { chain } => match conn.resolve_pointer(&chain).await? {
            Some(address) => println!("{chain} = {address:08X}"),
            None => println!("{chain} does not resolve"),
        },
        Commands::Regions { read, write } => {
            for region in conn.memory_regions(read, write).await? {
                println!(
                    "{:08X}  {:08X}  protect={:08X}  phys={:08X}",
                    region.base, region.size, region.protection, region.physical
                );
            }
        }
        Commands::Threads => {
            let token = conn.busy().await?;
            for id in token.thread_ids().await? {
                match token.thread_info(id).await? {
                    Some(info) => println!(
                        "{id:08X}  priority={:<3} suspend={} {}",
                        info.priority,
                        info.suspend_count,
                        info.name.unwrap_or_default()
                    ),
                    None => println!("{id:08X}  (exited)"),
                }
            }
        }
        Commands::Freeze => println!("{:?}", conn.debug_freeze().await?),
        Commands::Unfreeze => println!("{:?}", conn.debug_unfreeze().await?),
        Commands::Send { command } => {
            let token = conn.busy().await?;
            let response = token.send_command(&command).await?;
            println!("{}", response.raw);
            if response.kind == xbdm_link::ResponseType::MultiResponse {
                for line in token.read_multiline().await? {
                    println!("{line}");
                }
            }
        }
        Commands::Listen { json } => {
            let _subscription = conn
                .subscribe_events(move |event: &ConsoleEvent| {
                    if json {
                        println!("{}", serde_json::to_string(event)?);
                    } else {
                        println!("{event:?}");
                    }
                    Ok(())
                })
                .await
                .context("Failed to start the notification listener")?;
            log::info!("Listening for notifications; press Ctrl-C to stop");

            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("Failed to wait for Ctrl-C")?;
                        break;
                    }
                    _ = tick.tick() => {
                        if conn.is_closed() {
                            bail!("connection closed");
                        }
                    }
                }
            }
        }
        // Handled in run() before connecting.
        Commands::Config { .. } => {}
    }
    Ok(())
}
