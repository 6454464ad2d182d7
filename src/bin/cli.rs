//! threespace CLI
//!
//! Headless access to 3-Space sensors and dongles: identify devices, read
//! orientation and sensor data, run streaming sessions and send raw commands.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threespace_core::cli::{floats_format, hex_format, key_values, StdoutSink};
use threespace_core::core::capture::capture_filename;
use threespace_core::core::discovery::{self, PortScanner, SystemPortScanner};
use threespace_core::core::protocol::{codec, commands};
use threespace_core::core::simulator::{SensorProfile, VirtualDevice};
use threespace_core::{
    CliResult, DeviceId, DeviceKind, DeviceRegistry, DeviceSession, EngineConfig,
    OutputFormat, StreamBatch, StreamDuration, StreamStatus, StreamTiming, TrafficLog,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// threespace CLI
#[derive(Parser, Debug)]
#[command(
    name = "threespace",
    version,
    about = "3-Space sensor and dongle command-line tool",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file; platform default when unset
    #[arg(long, env = "THREESPACE_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    /// Talk to a built-in virtual device instead of hardware
    #[arg(long, value_enum, global = true)]
    simulate: Option<SimulatedKind>,

    /// Capture all traffic to a file in the capture directory
    #[arg(long, global = true)]
    capture: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SimulatedKind {
    /// USB sensor
    Usb,
    /// Dongle with one paired wireless sensor at index 0
    Dongle,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List 3-Space serial ports
    ListPorts {
        /// Open each port and identify it
        #[arg(long)]
        probe: bool,

        /// Include ports of other vendors
        #[arg(long)]
        all: bool,
    },

    /// Identify a device
    Info {
        /// Serial port (e.g., COM3, /dev/ttyACM0)
        #[arg(short, long)]
        port: String,

        /// Address the sensor at this dongle table index
        #[arg(short, long)]
        wireless: Option<u8>,
    },

    /// Read one value
    Read {
        #[arg(short, long)]
        port: String,

        #[arg(short, long)]
        wireless: Option<u8>,

        /// Command name or byte (e.g., tared-quaternion, 0x00)
        #[arg(long, default_value = "tared-quaternion")]
        what: String,
    },

    /// Stream slot data until the duration ends or Ctrl+C
    Stream {
        #[arg(short, long)]
        port: String,

        #[arg(short, long)]
        wireless: Option<u8>,

        /// Comma separated command names or bytes, at most 8
        #[arg(long, value_delimiter = ',', default_value = "tared-quaternion")]
        slots: Vec<String>,

        /// Interval between batches
        #[arg(long, default_value = "10")]
        interval_ms: u64,

        /// Total duration; runs until interrupted when unset
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Send a byte-exact command
    Raw {
        #[arg(short, long)]
        port: String,

        #[arg(short, long)]
        wireless: Option<u8>,

        /// Command byte
        #[arg(long, value_parser = parse_byte)]
        cmd: u8,

        /// Payload as hex
        #[arg(long, default_value = "")]
        hex: String,

        /// Expected response length
        #[arg(long, default_value = "0")]
        response_len: usize,
    },

    /// Show the wireless table of a dongle
    DongleTable {
        #[arg(short, long)]
        port: String,
    },

    /// List known commands
    Commands,

    /// Print exit codes
    ExitCodes,
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid command byte '{s}': {e}"))
}

/// Resolve a command by table name or byte
fn parse_command(s: &str) -> anyhow::Result<u8> {
    let name = s.trim().replace('-', "_");
    if let Some(spec) = commands::by_name(&name) {
        return Ok(spec.code);
    }
    let byte = parse_byte(s).map_err(|e| anyhow!(e))?;
    if commands::lookup(byte).is_none() {
        bail!("unknown command: {s}");
    }
    Ok(byte)
}

fn init_logging(
    config: &EngineConfig,
    verbose: u8,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let dir = config
        .logging
        .directory
        .clone()
        .or_else(threespace_core::config::log_dir);
    match dir.filter(|_| config.logging.file) {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "threespace.log"));
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if config.logging.json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr);
            if config.logging.json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(threespace_core::ExitCodes::CONFIG_ERROR);
        }
    };
    let _guard = init_logging(&config, cli.verbose);

    let result = match run(&cli, config) {
        Ok(()) => CliResult::success(),
        Err(e) => CliResult::from_anyhow(&e),
    };
    if let Some(msg) = result.message().filter(|_| !result.is_success()) {
        eprintln!("Error: {msg}");
    }
    result.to_exit_code()
}

fn run(cli: &Cli, config: EngineConfig) -> anyhow::Result<()> {
    let mut out = StdoutSink::new(cli.format);
    match &cli.command {
        Commands::ListPorts { probe, all } => list_ports(&mut out, &config, *probe, *all),
        Commands::Commands => list_commands(&mut out),
        Commands::ExitCodes => {
            threespace_core::cli::print_exit_codes();
            Ok(())
        }
        Commands::Info { port, wireless } => {
            let engine = Engine::connect(cli, config, port)?;
            let sensor = engine.target(*wireless)?;
            show_info(&mut out, &sensor)
        }
        Commands::Read {
            port,
            wireless,
            what,
        } => {
            let command = parse_command(what)?;
            let engine = Engine::connect(cli, config, port)?;
            let sensor = engine.target(*wireless)?;
            read_value(&mut out, &sensor, command)
        }
        Commands::Stream {
            port,
            wireless,
            slots,
            interval_ms,
            duration_ms,
        } => {
            let slots = slots
                .iter()
                .map(|s| parse_command(s))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let engine = Engine::connect(cli, config, port)?;
            let sensor = engine.target(*wireless)?;
            let duration = duration_ms
                .map(|ms| StreamDuration::Finite(Duration::from_millis(ms)))
                .unwrap_or(StreamDuration::Infinite);
            stream(
                &mut out,
                &sensor,
                &slots,
                StreamTiming::new(Duration::from_millis(*interval_ms), duration),
            )
        }
        Commands::Raw {
            port,
            wireless,
            cmd,
            hex,
            response_len,
        } => {
            let payload = hex::decode(hex.replace(' ', "")).context("payload is not valid hex")?;
            let engine = Engine::connect(cli, config, port)?;
            let sensor = engine.target(*wireless)?;
            let response = sensor.raw_command(*cmd, &payload, *response_len)?;
            #[derive(Serialize)]
            struct RawOut {
                command: u8,
                response: String,
                timestamp: Option<u32>,
            }
            let text = hex_format(&response.raw);
            out.emit(
                &RawOut {
                    command: *cmd,
                    response: hex::encode(&response.raw),
                    timestamp: response.timestamp,
                },
                move |_| text,
            )?;
            Ok(())
        }
        Commands::DongleTable { port } => {
            let engine = Engine::connect(cli, config, port)?;
            let root = engine.root()?;
            dongle_table(&mut out, &root)
        }
    }
}

/// Registry plus the wired device opened for this invocation
struct Engine {
    registry: Arc<DeviceRegistry>,
    root: DeviceId,
    // Keeps the virtual device alive for the process lifetime
    _sim: Option<VirtualDevice>,
}

impl Engine {
    fn connect(cli: &Cli, config: EngineConfig, port: &str) -> anyhow::Result<Self> {
        let capture_format = config.logging.capture_format;
        let registry = Arc::new(DeviceRegistry::new(config));

        if cli.capture {
            let dir = threespace_core::config::capture_dir()
                .ok_or_else(|| anyhow!("no capture directory available"))?;
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(capture_filename("threespace", capture_format));
            let log = Arc::new(TrafficLog::new(4096));
            log.to_file(&path, capture_format)?;
            info!(path = %path.display(), "Capturing traffic");
            registry.set_capture(Some(log));
        }

        let (root, sim) = match cli.simulate {
            Some(SimulatedKind::Usb) => {
                let sim = VirtualDevice::usb(port);
                (registry.create_device_with(sim.link(), None)?, Some(sim))
            }
            Some(SimulatedKind::Dongle) => {
                let sim = VirtualDevice::dongle(port);
                sim.add_wireless_sensor(SensorProfile::wireless(0x0000_1001));
                sim.pair(0, 0x0000_1001);
                (registry.create_device_with(sim.link(), None)?, Some(sim))
            }
            None => (
                registry
                    .create_device(port, None)
                    .with_context(|| format!("opening {port}"))?,
                None,
            ),
        };
        debug!(id = %root, "Connected");

        Ok(Self {
            registry,
            root,
            _sim: sim,
        })
    }

    fn root(&self) -> anyhow::Result<Arc<DeviceSession>> {
        Ok(self.registry.get(self.root)?)
    }

    /// The wired device, or the wireless sensor at `index` behind it
    fn target(&self, index: Option<u8>) -> anyhow::Result<Arc<DeviceSession>> {
        match index {
            None => self.root(),
            Some(idx) => {
                let id = self
                    .registry
                    .sensor_from_dongle(self.root, idx)
                    .with_context(|| format!("wireless sensor at index {idx}"))?;
                Ok(self.registry.get(id)?)
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let stopped = self.registry.stop_all_streaming();
        if stopped > 0 {
            debug!(stopped, "Stopped streaming before exit");
        }
        self.registry.reset();
    }
}

fn list_ports(out: &mut StdoutSink, config: &EngineConfig, probe: bool, all: bool) -> anyhow::Result<()> {
    let scanner = SystemPortScanner::new(config.serial.baud_rate).include_unknown(all);
    let ports = if probe {
        discovery::find_ports(&scanner, DeviceId::ALL_SENSORS, true)?
    } else {
        scanner.ports()?
    };
    if ports.is_empty() && out.format() == OutputFormat::Text {
        eprintln!("No 3-Space ports found.");
        return Ok(());
    }
    for port in &ports {
        out.emit(port, |p| {
            let kind = p.kind_guess.map(|k| k.to_string()).unwrap_or_else(|| "?".into());
            format!("{:<20} {:<12} {}", p.path, kind, p.friendly_name)
        })?;
    }
    Ok(())
}

fn list_commands(out: &mut StdoutSink) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct CommandOut {
        code: u8,
        name: &'static str,
        response_len: usize,
    }
    for spec in commands::COMMANDS {
        out.emit(
            &CommandOut {
                code: spec.code,
                name: spec.name,
                response_len: codec::schema_len(spec.output),
            },
            |c| format!("0x{:02x}  {:<32} {}", c.code, c.name.replace('_', "-"), c.response_len),
        )?;
    }
    Ok(())
}

fn show_info(out: &mut StdoutSink, sensor: &DeviceSession) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct InfoOut {
        id: String,
        kind: DeviceKind,
        serial: String,
        firmware: String,
        hardware: String,
        wireless: bool,
    }
    let info = sensor.info();
    out.emit(
        &InfoOut {
            id: sensor.id().to_string(),
            kind: sensor.kind(),
            serial: info.serial_hex(),
            firmware: info.firmware_version.clone(),
            hardware: info.hardware_version.clone(),
            wireless: sensor.is_wireless(),
        },
        |i| {
            key_values(&[
                ("id", i.id.clone()),
                ("kind", i.kind.to_string()),
                ("serial", i.serial.clone()),
                ("firmware", i.firmware.clone()),
                ("hardware", i.hardware.clone()),
                ("wireless", i.wireless.to_string()),
            ])
        },
    )?;
    Ok(())
}

fn read_value(out: &mut StdoutSink, sensor: &DeviceSession, command: u8) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct ReadOut {
        command: String,
        values: Vec<String>,
        timestamp: Option<u32>,
        emulated: bool,
    }
    let spec = commands::lookup(command).ok_or_else(|| anyhow!("unknown command 0x{command:02x}"))?;
    let response = sensor.command(command, &[])?;
    out.emit(
        &ReadOut {
            command: spec.name.replace('_', "-"),
            values: response.fields.iter().map(ToString::to_string).collect(),
            timestamp: response.timestamp,
            emulated: response.emulated,
        },
        |r| {
            let mut line = r.values.join(", ");
            if r.emulated {
                line.push_str("  (emulated)");
            }
            line
        },
    )?;
    Ok(())
}

fn stream(
    out: &mut StdoutSink,
    sensor: &Arc<DeviceSession>,
    slots: &[u8],
    timing: StreamTiming,
) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    sensor.set_stream_slots(slots)?;
    sensor.set_stream_timing(timing)?;
    let batches = sensor.subscribe_stream()?;
    sensor.start_streaming()?;
    info!(id = %sensor.id(), slots = ?slots, "Streaming");

    let received = AtomicU64::new(0);
    let poll = Duration::from_millis(100);
    while running.load(Ordering::SeqCst) && !out.is_closed() {
        match batches.recv_timeout(poll) {
            Ok(batch) => {
                received.fetch_add(1, Ordering::Relaxed);
                emit_batch(out, &batch)?;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if sensor.stream_status() != StreamStatus::Streaming {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    if sensor.stream_status() == StreamStatus::Streaming {
        if let Err(e) = sensor.stop_streaming() {
            warn!("Failed to stop streaming: {e}");
        }
    }
    let counters = sensor.stream_counters();
    info!(
        received = received.load(Ordering::Relaxed),
        dropped = counters.dropped,
        "Stream finished"
    );
    Ok(())
}

fn emit_batch(out: &mut StdoutSink, batch: &StreamBatch) -> std::io::Result<()> {
    #[derive(Serialize)]
    struct BatchOut {
        sequence: u64,
        timestamp: Option<u32>,
        values: Vec<f32>,
    }
    out.emit(
        &BatchOut {
            sequence: batch.sequence,
            timestamp: batch.timestamp,
            values: batch.floats(),
        },
        |b| match b.timestamp {
            Some(ts) => format!("{:>8} {:>10}  {}", b.sequence, ts, floats_format(&b.values)),
            None => format!("{:>8}  {}", b.sequence, floats_format(&b.values)),
        },
    )
}

fn dongle_table(out: &mut StdoutSink, dongle: &DeviceSession) -> anyhow::Result<()> {
    if dongle.kind() != DeviceKind::Dongle {
        bail!("{} is a {}, not a dongle", dongle.id(), dongle.kind());
    }
    #[derive(Serialize)]
    struct EntryOut {
        index: u8,
        serial: String,
    }
    for idx in 0..15u8 {
        let serial = dongle.wireless_table_entry(idx)?;
        if serial == 0 {
            continue;
        }
        out.emit(
            &EntryOut {
                index: idx,
                serial: format!("{serial:08X}"),
            },
            |e| format!("{:>2}  {}", e.index, e.serial),
        )?;
    }
    Ok(())
}
