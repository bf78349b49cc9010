//! Command-line control of ilumi bulbs
//!
//! Targets come from the enrolled topology (`topology.json` in the ilumi
//! home), which `enroll` and `unenroll` maintain. Logs go to stderr; with
//! `--json` stdout carries one JSON document.

mod presets;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use ilumi_ble::BleTransport;
use ilumi_engine::{
    BulbRecord, CONFIG_FILE, DeviceIdentity, Engine, EngineConfig, ExecutionResult, FramePacer,
    JsonFileStore, MESH_GROUP_ID, Routing, SESSIONS_FILE, Sessions, TOPOLOGY_FILE, Target, Topology,
    TopologyError, generate_dfu_key, generate_network_key, ilumi_home,
};
use ilumi_proto::{Body, Color, Command, MacAddress, NetworkKey, Power};

#[derive(Parser)]
#[command(name = "ilumi")]
#[command(about = "Control ilumi bulbs over BLE")]
struct Cli {
    /// State directory (defaults to $ILUMI_HOME or ~/.ilumi)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Relay through the first target over the mesh instead of visiting each bulb
    #[arg(long, global = true)]
    mesh: bool,

    #[command(flatten)]
    targets: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Bulb address (AA:BB:CC:DD:EE:FF)
    #[arg(long, global = true)]
    mac: Option<MacAddress>,
    /// Enrolled bulb name; with --mac, the address is used when no bulb has it
    #[arg(long, global = true)]
    name: Option<String>,
    /// Enrolled group
    #[arg(long, global = true)]
    group: Option<String>,
    /// Every enrolled bulb
    #[arg(long, global = true)]
    all: bool,
}

#[derive(Args)]
struct ColorArgs {
    /// Red (0-255)
    r: i64,
    /// Green (0-255)
    g: i64,
    /// Blue (0-255)
    b: i64,
    /// White (0-255)
    #[arg(default_value = "0")]
    w: i64,
    /// Brightness (0-255)
    #[arg(long, default_value = "255")]
    brightness: i64,
}

impl ColorArgs {
    fn color(&self) -> Result<Color, ilumi_proto::ValueOutOfRange> {
        Color::new(self.r, self.g, self.b, self.w, self.brightness)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for bulbs
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Turn bulbs on
    On {
        #[arg(long, default_value = "0")]
        delay_ms: u16,
        #[arg(long, default_value = "0")]
        transit_ms: u16,
    },
    /// Turn bulbs off
    Off {
        #[arg(long, default_value = "0")]
        delay_ms: u16,
        #[arg(long, default_value = "0")]
        transit_ms: u16,
    },
    /// Set a color immediately
    Color(ColorArgs),
    /// Fade to a color in hardware
    Fade {
        #[command(flatten)]
        color: ColorArgs,
        /// Fade duration; defaults depend on how many bulbs are targeted
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Flickering candle mode
    Candle {
        #[arg(default_value = "255")]
        r: i64,
        #[arg(default_value = "190")]
        g: i64,
        #[arg(default_value = "0")]
        b: i64,
        #[arg(default_value = "29")]
        w: i64,
    },
    /// Named white profiles (leave empty to list)
    Whites {
        profile: Option<String>,
        /// Brightness (0-255)
        #[arg(default_value = "255")]
        brightness: i64,
    },
    /// Built-in animated effects (leave empty to list)
    Effect { name: Option<String> },
    /// Stream a hue sweep as raw frames to the first target
    Stream {
        /// Seconds to stream
        #[arg(long, default_value = "10")]
        duration: u64,
        /// Frames per second (at most 20)
        #[arg(long, default_value = "20")]
        fps: u32,
    },
    /// Read the current color
    GetColor,
    /// Read firmware and model information
    Info,
    /// Read the mesh routing table
    Routing,
    /// Commission the bulb at --mac into the mesh as --name (and --group)
    Enroll {
        /// Mesh node id; defaults to the next free one
        #[arg(long)]
        node_id: Option<u16>,
    },
    /// Reset bulbs to their factory, uncommissioned state
    Unenroll {
        /// Required; the bulbs leave the mesh
        #[arg(long)]
        force: bool,
    },
    /// Reboot bulbs into the firmware update bootloader
    Dfu {
        /// Required; the bulbs stop answering until reflashed
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ilumi=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    let home = match &cli.home {
        Some(home) => {
            fs::create_dir_all(home)?;
            home.clone()
        }
        None => ilumi_home()?,
    };

    if let Commands::Scan { duration } = cli.command {
        let bulbs = BleTransport::new().await?.scan(Duration::from_secs(duration)).await?;
        if cli.json {
            println!("{}", serde_json::to_string(&bulbs)?);
        } else {
            println!("Found {} bulbs:", bulbs.len());
            for bulb in &bulbs {
                let rssi =
                    bulb.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
                println!("  {} ({}) RSSI: {}", bulb.name, bulb.address, rssi);
            }
        }
        return Ok(());
    }

    // listing presets needs no bulbs
    match &cli.command {
        Commands::Whites { profile: None, .. } => {
            return list(cli.json, &presets::white_names());
        }
        Commands::Effect { name: None } => return list(cli.json, presets::EFFECTS),
        Commands::Unenroll { force: false } | Commands::Dfu { force: false } => {
            return Err("this cannot be undone from here; pass --force".into());
        }
        _ => {}
    }

    let topology_path = home.join(TOPOLOGY_FILE);
    let mut topology = match Topology::load(&topology_path) {
        Ok(topology) => topology,
        Err(TopologyError::NotFound(path)) if cli.targets.mac.is_some() => {
            warn!(path = %path.display(), "no topology; using the default network key");
            Topology::default()
        }
        Err(e) => return Err(e.into()),
    };

    if let Commands::Enroll { node_id } = cli.command {
        return enroll(&home, topology, &cli.targets, node_id, cli.json).await;
    }

    let t = &cli.targets;
    let target = Target::select(t.mac, t.name.clone(), t.group.clone(), t.all);
    let targets = topology.resolve(&target);
    if targets.is_empty() {
        return Err("no targets resolved; run enrollment or check the selectors".into());
    }

    let engine = open_engine(&home, &topology).await?;

    let routing = if cli.mesh { Routing::Mesh } else { Routing::Sequential };
    let (name, result) = match cli.command {
        Commands::Scan { .. } | Commands::Enroll { .. } => return Ok(()),
        Commands::On { delay_ms, transit_ms } => {
            let command = Command::TurnOn(Power { delay_ms, transit_ms });
            ("turn_on", dispatch(&engine, &targets, command, routing).await)
        }
        Commands::Off { delay_ms, transit_ms } => {
            let command = Command::TurnOff(Power { delay_ms, transit_ms });
            ("turn_off", dispatch(&engine, &targets, command, routing).await)
        }
        Commands::Color(args) => {
            let command = Command::SetColorAcked(args.color()?);
            ("set_color", dispatch(&engine, &targets, command, routing).await)
        }
        Commands::Fade { color, duration_ms } => {
            ("fade", engine.fade(&targets, color.color()?, routing, duration_ms).await)
        }
        Commands::Candle { r, g, b, w } => {
            let command = Command::CandleMode(Color::new(r, g, b, w, 255)?);
            ("candle", dispatch(&engine, &targets, command, routing).await)
        }
        Commands::Whites { profile, brightness } => {
            let profile = presets::normalise(profile.as_deref().unwrap_or_default());
            let Some(color) = presets::white(&profile, brightness) else {
                let valid = presets::white_names();
                return Err(format!("unknown profile {profile:?}; valid: {valid:?}").into());
            };
            let color = color?;
            let command = if profile == presets::CANDLE_PROFILE {
                Command::CandleMode(color)
            } else {
                Command::SetColorAcked(color)
            };
            ("whites", dispatch(&engine, &targets, command, routing).await)
        }
        Commands::Effect { name } => {
            let effect = presets::normalise(name.as_deref().unwrap_or_default());
            let Some(pattern) = presets::effect(&effect) else {
                let valid = presets::EFFECTS;
                return Err(format!("unknown effect {effect:?}; valid: {valid:?}").into());
            };
            let pattern = pattern?;
            let scene = pattern.scene();
            let result = engine
                .run(&targets, |_| {
                    vec![Command::DefinePattern(pattern.clone()), Command::StartPattern { scene }]
                })
                .await;
            ("play_effect", result)
        }
        Commands::Stream { duration, fps } => {
            let duration = Duration::from_secs(duration);
            return stream(&engine, &targets[0], duration, fps, cli.json).await;
        }
        Commands::GetColor => {
            ("get_color", engine.run(&targets, |_| Command::GetBulbColor).await)
        }
        Commands::Info => ("device_info", engine.run(&targets, |_| Command::GetDeviceInfo).await),
        Commands::Routing => {
            ("query_routing", engine.run(&targets, |_| Command::QueryRouting).await)
        }
        Commands::Unenroll { .. } => {
            let result = engine.unenroll(&targets).await;
            let mut removed = 0;
            for (address, outcome) in result.iter() {
                if outcome.success && topology.remove(address).is_some() {
                    removed += 1;
                }
            }
            if removed > 0 {
                topology.save(&topology_path)?;
            }
            ("unenroll", result)
        }
        Commands::Dfu { .. } => {
            let dfu_key = generate_dfu_key();
            info!(dfu_key = format_args!("{dfu_key:#010x}"), "entering bootloader");
            ("enter_bootloader", engine.enter_bootloader(&targets, dfu_key).await)
        }
    };

    report(name, &targets, &result, cli.json)?;
    if !result.all_succeeded() {
        return Err(format!("{} of {} targets failed", result.failed(), result.len()).into());
    }
    Ok(())
}

async fn open_engine(
    home: &Path,
    topology: &Topology,
) -> Result<Engine<BleTransport>, Box<dyn std::error::Error>> {
    let config = EngineConfig::load_or_create(&home.join(CONFIG_FILE))?;
    let store = JsonFileStore::open(home.join(SESSIONS_FILE))?;
    let sessions = Sessions::new(Arc::new(store), topology.network_key);
    Ok(Engine::new(BleTransport::new().await?, sessions, config))
}

/// Commission one bulb into the mesh and record it in the topology
async fn enroll(
    home: &Path,
    mut topology: Topology,
    targets: &TargetArgs,
    node_id: Option<u16>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(address) = targets.mac else {
        return Err("enroll needs --mac".into());
    };
    let Some(name) = targets.name.clone() else {
        return Err("enroll needs --name".into());
    };
    if topology.network_key == NetworkKey(0) {
        topology.network_key = generate_network_key();
        info!(network_key = topology.network_key.0, "generated a new mesh network key");
    }
    let node_id = match (node_id, topology.bulbs.get(&address)) {
        (Some(node_id), _) => node_id,
        (None, Some(existing)) => existing.node_id,
        (None, None) => topology.next_node_id(),
    };

    let engine = open_engine(home, &topology).await?;
    let (device, device_info) = engine.identify(address).await?;
    engine.commission(&device, topology.network_key, node_id, MESH_GROUP_ID).await?;

    let record = BulbRecord {
        name,
        group: targets.group.clone().unwrap_or_default(),
        node_id,
        generation: device_info.generation(),
    };
    let identity = topology.enroll(address, record);
    topology.save(&home.join(TOPOLOGY_FILE))?;

    if json {
        println!("{}", json!({ "command": "enroll", "bulb": identity }));
    } else {
        println!(
            "Enrolled {} as {:?} (group {:?}, node {}, {})",
            identity.address, identity.name, identity.group, identity.node_id, identity.generation
        );
    }
    Ok(())
}

async fn dispatch(
    engine: &Engine<BleTransport>,
    targets: &[DeviceIdentity],
    command: Command,
    routing: Routing,
) -> ExecutionResult {
    match routing {
        Routing::Mesh => engine.run_mesh(targets, &command).await,
        Routing::Sequential => engine.run(targets, |_| command.clone()).await,
    }
}

async fn stream(
    engine: &Engine<BleTransport>,
    device: &DeviceIdentity,
    duration: Duration,
    fps: u32,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = engine.open_stream(device).await?;
    let mut pacer = FramePacer::new(fps);
    let started = tokio::time::Instant::now();

    while started.elapsed() < duration {
        pacer.tick().await;
        let hue = started.elapsed().as_secs_f32() / 3.0;
        let (r, g, b) = presets::hsv_to_rgb(hue);
        stream.send(Color::rgbw(r, g, b, 0, 255)).await?;
    }

    let frames = stream.close().await?;
    let elapsed = started.elapsed().as_secs_f64();
    let rate = frames as f64 / elapsed.max(f64::EPSILON);
    if json {
        let summary =
            json!({ "command": "stream", "target": device.address, "frames": frames, "fps": rate });
        println!("{summary}");
    } else {
        println!("Sent {frames} frames in {elapsed:.2}s ({rate:.2} fps)");
    }
    Ok(())
}

fn list(json: bool, names: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string(names)?);
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}

fn report(
    command: &str,
    targets: &[DeviceIdentity],
    result: &ExecutionResult,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        let addresses: Vec<&MacAddress> = targets.iter().map(|t| &t.address).collect();
        println!("{}", json!({ "command": command, "targets": addresses, "results": result }));
        return Ok(());
    }

    for (address, outcome) in result.iter() {
        match &outcome.error {
            None => println!("{address}  ok ({:?})", outcome.delivery),
            Some(error) => println!("{address}  FAILED: {error}"),
        }
        for reply in &outcome.replies {
            if let Some(color) = reply.color() {
                println!(
                    "    color r={} g={} b={} w={} brightness={}",
                    color.r, color.g, color.b, color.w, color.brightness
                );
            }
            match &reply.body {
                Body::DeviceInfo(info) => println!(
                    "    firmware {:#06x}, bootloader {:#06x}, model {} ({}), commissioned {}",
                    info.firmware_version,
                    info.bootloader_version,
                    info.model_number,
                    info.generation(),
                    info.commission_status
                ),
                Body::Routing(entries) => {
                    for entry in entries {
                        println!("    {} hops={} rssi={}", entry.address, entry.hops, entry.rssi);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}
