use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use serial_transport::{ByteChannel, SerialChannel};
use servo_bus::registers::{degrees_to_position, position_to_degrees, POSITION_MAX};
use servo_bus::{
    BusConfig, ErrorFlags, MetricsHub, MotionProfile, ServoBus, SharedBus, TransactionEngine,
    VirtualBus, MAX_ID,
};

const RANGE_MAX: i32 = POSITION_MAX as i32;

#[derive(Parser, Debug)]
#[command(
    name = "scs",
    version,
    about = "Feetech SCS/STS servo bus tool",
    disable_help_subcommand = true
)]
struct Cli {
    /// Serial port, e.g. /dev/ttyUSB0
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate (default 1000000)
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// YAML bus config
    #[arg(long, global = true)]
    config: Option<String>,

    /// Fixed response timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Use the in-process virtual bus instead of a serial port
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Servo ids present on the virtual bus
    #[arg(long, global = true, value_delimiter = ',', default_value = "1,2,3", value_parser = parse_id)]
    mock_ids: Vec<u8>,

    /// Print bus counters after the command
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,
    /// Ping one servo
    Ping {
        #[arg(value_parser = parse_id)]
        id: u8,
    },
    /// Sweep ids and print the model of every servo that answers
    Scan {
        #[arg(long, default_value_t = 0, value_parser = parse_id)]
        from: u8,
        #[arg(long, default_value_t = MAX_ID, value_parser = parse_id)]
        to: u8,
    },
    /// Print model, voltages, temperatures, position and limits
    State {
        /// Servo ids; defaults to the configured motors
        #[arg(value_parser = parse_id)]
        ids: Vec<u8>,
        /// Emit JSON lines instead of text
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Move one servo
    Move {
        #[arg(value_parser = parse_id)]
        id: u8,
        /// Target angle in degrees (wrapped to one turn)
        #[arg(long, conflicts_with = "position", required_unless_present = "position")]
        deg: Option<f64>,
        /// Target raw position (0..=4095)
        #[arg(long)]
        position: Option<i32>,
        #[arg(long)]
        speed: Option<u16>,
        #[arg(long)]
        acc: Option<u8>,
    },
    /// Read present positions
    Positions {
        /// Servo ids; defaults to the configured motors
        #[arg(value_parser = parse_id)]
        ids: Vec<u8>,
        /// Use one SyncRead instead of one read per servo
        #[arg(long, action = ArgAction::SetTrue)]
        sync: bool,
    },
    /// Move several servos with one SyncWrite, targets as ID=POSITION
    SyncMove {
        #[arg(required = true, value_parser = parse_target)]
        targets: Vec<(u8, i32)>,
        #[arg(long)]
        speed: Option<u16>,
        #[arg(long)]
        acc: Option<u8>,
    },
    /// Give a servo a new id (persisted to EPROM)
    ChangeId {
        #[arg(value_parser = parse_id)]
        id: u8,
        #[arg(value_parser = parse_id)]
        new_id: u8,
    },
    /// Print every servo found and write the configured voltage and temperature limits
    Calibrate {
        /// Only print state
        #[arg(long, action = ArgAction::SetTrue)]
        read_only: bool,
        /// Servo ids; defaults to a full sweep
        #[arg(value_parser = parse_id)]
        ids: Vec<u8>,
    },
    /// Step one servo back and forth across a position range
    Sweep {
        #[arg(value_parser = parse_id)]
        id: u8,
        #[arg(long, default_value_t = 0)]
        min: i32,
        #[arg(long, default_value_t = RANGE_MAX)]
        max: i32,
        #[arg(long, default_value_t = 100)]
        step: i32,
        /// Number of end stops to reach before stopping
        #[arg(long, default_value_t = 2)]
        cycles: u32,
        /// Pause after each step in milliseconds
        #[arg(long, default_value_t = 500)]
        dwell_ms: u64,
        #[arg(long)]
        speed: Option<u16>,
        #[arg(long)]
        acc: Option<u8>,
    },
    /// Move servos to the middle of their range
    Neutral {
        /// Servo ids; defaults to the configured motors
        #[arg(value_parser = parse_id)]
        ids: Vec<u8>,
        #[arg(long)]
        speed: Option<u16>,
        #[arg(long)]
        acc: Option<u8>,
    },
    /// Enable or disable holding torque
    Torque {
        #[arg(value_parser = parse_id)]
        id: u8,
        #[arg(value_enum)]
        state: Switch,
    },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = load_settings(&cli)?;

    if matches!(cli.command, Commands::Ports) {
        return list_ports(cli.mock);
    }

    let hub = MetricsHub::new().map_err(|e| anyhow!(e))?;
    if cli.mock {
        let channel = VirtualBus::with_servos(cli.mock_ids.iter().copied());
        run(open_bus(channel, &config, &hub), &cli.command, &config)?;
    } else {
        let port = config
            .port
            .clone()
            .ok_or_else(|| anyhow!("no serial port: pass --port or set `port` in the config"))?;
        let channel = SerialChannel::open(&port, config.baud_rate)
            .with_context(|| format!("opening {port} at {} baud", config.baud_rate))?;
        info!(port = %port, baud = config.baud_rate, "port open");
        run(open_bus(channel, &config, &hub), &cli.command, &config)?;
    }

    if cli.metrics {
        print!("{}", hub.encode_text());
    }
    Ok(())
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_settings(cli: &Cli) -> Result<BusConfig> {
    let mut config = match &cli.config {
        Some(path) => servo_bus::load_config_file(path)?,
        None => BusConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.port = Some(port.clone());
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeout_ms = Some(ms);
    }
    config.validate()?;
    Ok(config)
}

fn open_bus<C: ByteChannel>(channel: C, config: &BusConfig, hub: &MetricsHub) -> ServoBus<C> {
    let mut engine = TransactionEngine::new(channel).with_metrics(hub.bus.clone());
    if let Some(timeout) = config.timeout() {
        engine = engine.with_timeout(timeout);
    }
    ServoBus::new(SharedBus::new(engine)).with_byte_order(config.byte_order)
}

fn list_ports(mock: bool) -> Result<()> {
    let ports = if mock {
        VirtualBus::list()?
    } else {
        SerialChannel::list()?
    };
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn run<C: ByteChannel>(bus: ServoBus<C>, command: &Commands, config: &BusConfig) -> Result<()> {
    let result = match command {
        Commands::Ports => Ok(()),
        Commands::Ping { id } => ping(&bus, *id),
        Commands::Scan { from, to } => scan(&bus, *from, *to),
        Commands::State { ids, json } => state(&bus, &ids_or_configured(ids, config)?, *json),
        Commands::Move {
            id,
            deg,
            position,
            speed,
            acc,
        } => {
            let target = match (deg, position) {
                (Some(deg), _) => i32::from(degrees_to_position(*deg)),
                (None, Some(position)) => *position,
                (None, None) => return Err(anyhow!("pass --deg or --position")),
            };
            let motion = motion(config, *speed, *acc);
            println!(
                "moving servo {id} to {target} (speed {}, acc {})",
                motion.speed, motion.acceleration
            );
            bus.write_position(*id, target, motion.speed, motion.acceleration)
                .with_context(|| format!("moving servo {id}"))
        }
        Commands::Positions { ids, sync } => {
            positions(&bus, &ids_or_configured(ids, config)?, *sync)
        }
        Commands::SyncMove { targets, speed, acc } => bus
            .sync_write_positions(targets, motion(config, *speed, *acc))
            .context("sync write"),
        Commands::ChangeId { id, new_id } => {
            println!("changing id of servo {id} to {new_id}");
            bus.change_id(*id, *new_id)
                .with_context(|| format!("changing id {id} -> {new_id}"))?;
            println!("servo now answers as {new_id}");
            Ok(())
        }
        Commands::Calibrate { read_only, ids } => calibrate(&bus, ids, *read_only, config),
        Commands::Sweep {
            id,
            min,
            max,
            step,
            cycles,
            dwell_ms,
            speed,
            acc,
        } => {
            let targets = sweep_targets(*min, *max, *step, *cycles);
            if targets.is_empty() {
                Err(anyhow!("nothing to sweep in {min}..={max} by {step}"))
            } else {
                sweep(
                    &bus,
                    *id,
                    &targets,
                    motion(config, *speed, *acc),
                    Duration::from_millis(*dwell_ms),
                )
            }
        }
        Commands::Neutral { ids, speed, acc } => neutral(
            &bus,
            &ids_or_configured(ids, config)?,
            motion(config, *speed, *acc),
        ),
        Commands::Torque { id, state } => bus
            .set_torque(*id, *state == Switch::On)
            .with_context(|| format!("setting torque on servo {id}")),
    };
    if let Err(e) = bus.close() {
        warn!(error = %e, "closing bus");
    }
    result
}

fn motion(config: &BusConfig, speed: Option<u16>, acc: Option<u8>) -> MotionProfile {
    MotionProfile {
        speed: speed.unwrap_or(config.motion.speed),
        acceleration: acc.unwrap_or(config.motion.acceleration),
    }
}

fn ids_or_configured(ids: &[u8], config: &BusConfig) -> Result<Vec<u8>> {
    if !ids.is_empty() {
        return Ok(ids.to_vec());
    }
    let configured = config.motor_ids();
    if configured.is_empty() {
        return Err(anyhow!("no servo ids given and none configured"));
    }
    Ok(configured)
}

fn ping<C: ByteChannel>(bus: &ServoBus<C>, id: u8) -> Result<()> {
    match bus.ping_model(id) {
        Ok(model) => println!("[ID:{id:03}] ping ok, model {model}"),
        Err(e) => println!("[ID:{id:03}] no answer ({e})"),
    }
    Ok(())
}

fn scan<C: ByteChannel>(bus: &ServoBus<C>, from: u8, to: u8) -> Result<()> {
    if from > to {
        return Err(anyhow!("empty id range {from}..={to}"));
    }
    let found = bus.discover(from..=to);
    for (id, model) in &found {
        println!("[ID:{id:03}] model {model}");
    }
    println!("{} servo(s) found", found.len());
    Ok(())
}

fn state<C: ByteChannel>(bus: &ServoBus<C>, ids: &[u8], json: bool) -> Result<()> {
    for &id in ids {
        let Some(state) = bus.read_state(id) else {
            eprintln!("[ID:{id:03}] no answer");
            continue;
        };
        if json {
            println!("{}", serde_json::to_string(&state)?);
        } else {
            println!("{state}\n");
        }
    }
    Ok(())
}

fn positions<C: ByteChannel>(bus: &ServoBus<C>, ids: &[u8], sync: bool) -> Result<()> {
    if sync {
        for (id, result) in bus.sync_read_positions(ids)? {
            match result {
                Ok((p, flags)) => print_position(id, p, flags),
                Err(e) => eprintln!("[ID:{id:03}] {e}"),
            }
        }
        return Ok(());
    }
    for (id, result) in bus.read_positions(ids) {
        match result {
            Ok((p, flags)) => print_position(id, p, flags),
            Err(e) => eprintln!("[ID:{id:03}] {e}"),
        }
    }
    Ok(())
}

fn print_position(id: u8, position: i32, flags: ErrorFlags) {
    let deg = u16::try_from(position)
        .map(|p| format!("{:.1}", position_to_degrees(p)))
        .unwrap_or_else(|_| "-".to_string());
    if flags.is_empty() {
        println!("[ID:{id:03}] {position}\t{deg} deg");
    } else {
        println!("[ID:{id:03}] {position}\t{deg} deg\terrors: {flags}");
    }
}

/// Goal positions for a back-and-forth sweep starting at `min`. Each end stop reached uses up
/// one cycle; the sweep stops when the last cycle is used, before that final move.
fn sweep_targets(min: i32, max: i32, step: i32, cycles: u32) -> Vec<i32> {
    let mut targets = Vec::new();
    if step <= 0 || min >= max {
        return targets;
    }
    let (mut position, mut step, mut cycles) = (min, step, cycles);
    loop {
        position += step;
        if position >= max {
            position = max;
            step = -step;
            cycles = cycles.saturating_sub(1);
        } else if position <= min {
            position = min;
            step = -step;
            cycles = cycles.saturating_sub(1);
        }
        if cycles == 0 {
            break;
        }
        targets.push(position);
    }
    targets
}

fn sweep<C: ByteChannel>(
    bus: &ServoBus<C>,
    id: u8,
    targets: &[i32],
    motion: MotionProfile,
    dwell: Duration,
) -> Result<()> {
    println!("moving servo {id} back and forth");
    for &target in targets {
        println!("goal position: {target}");
        if let Err(e) = bus.write_position(id, target, motion.speed, motion.acceleration) {
            eprintln!("[ID:{id:03}] {e}");
        }
        thread::sleep(dwell);
    }
    Ok(())
}

fn neutral<C: ByteChannel>(bus: &ServoBus<C>, ids: &[u8], motion: MotionProfile) -> Result<()> {
    let center = RANGE_MAX / 2;
    let targets: Vec<(u8, i32)> = ids.iter().map(|&id| (id, center)).collect();
    for (id, result) in bus.set_positions(&targets, motion) {
        match result {
            Ok(()) => println!("[ID:{id:03}] moved to {center}"),
            Err(e) => eprintln!("[ID:{id:03}] {e}"),
        }
    }
    Ok(())
}

fn calibrate<C: ByteChannel>(
    bus: &ServoBus<C>,
    ids: &[u8],
    read_only: bool,
    config: &BusConfig,
) -> Result<()> {
    let ids: Vec<u8> = if ids.is_empty() {
        (0..=MAX_ID).collect()
    } else {
        ids.to_vec()
    };
    let limits = config.limits;
    for id in ids {
        if !bus.ping(id) {
            continue;
        }
        if let Some(state) = bus.read_state(id) {
            println!("{state}\n");
        }
        if read_only {
            continue;
        }
        println!(
            "setting voltage limits to {:.1} V - {:.1} V",
            f32::from(limits.min_voltage) / 10.0,
            f32::from(limits.max_voltage) / 10.0
        );
        if let Err(e) = bus.write_voltage_limits(id, limits.min_voltage, limits.max_voltage) {
            eprintln!("[ID:{id:03}] voltage limits: {e}");
        }
        println!("setting max temperature to {} C", limits.max_temperature);
        if let Err(e) = bus.write_temperature_limit(id, limits.max_temperature) {
            eprintln!("[ID:{id:03}] temperature limit: {e}");
        }
    }
    Ok(())
}

/// Decimal or 0x-prefixed hex servo id, broadcast excluded.
fn parse_id(s: &str) -> Result<u8, String> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => t.parse::<u8>(),
    }
    .map_err(|e| format!("invalid servo id '{t}': {e}"))?;
    if parsed > MAX_ID {
        return Err(format!("servo id {parsed} is above {MAX_ID}"));
    }
    Ok(parsed)
}

fn parse_target(s: &str) -> Result<(u8, i32), String> {
    let (id, position) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=POSITION, got '{s}'"))?;
    let position = position
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("invalid position '{position}': {e}"))?;
    Ok((parse_id(id)?, position))
}
