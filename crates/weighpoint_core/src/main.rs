//! Weighpoint Station CLI
//!
//! Runs the control core of one weighing station.
//!
//! ## Usage
//!
//! ```bash
//! # Simulated station: in-memory link, in-memory storage, mock sensors
//! weighpoint --simulate
//!
//! # Field configuration
//! weighpoint --server 10.0.0.1:5683 --db /var/lib/weighpoint.db
//!
//! # Low-power preset
//! WEIGHPOINT_LOW_POWER=1 weighpoint
//! ```

use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use weighpoint_core::sensors::{sensing_loop, MockBatteryGauge, MockLoadCell};
use weighpoint_core::{
    Clock, Config, DeviceStore, Event, EventKind, LifecycleController, LinkConfig, LoadCell,
    LogDisplay, MemoryLink, MemoryStore, OperatorInput, Result, ServerLink, StoreBackendType,
    SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "weighpoint", version, about = "Weighpoint station control core")]
struct Args {
    /// Run against in-memory link and storage with simulated sensors
    #[arg(long)]
    simulate: bool,

    /// Collection server address (host:port)
    #[arg(long)]
    server: Option<String>,

    /// Device identity; normally assigned by the server during setup
    #[arg(long)]
    device_id: Option<String>,

    /// Path to the SQLite database file
    #[arg(long)]
    db: Option<String>,

    /// Use the low-power preset
    #[arg(long)]
    low_power: bool,
}

fn print_banner() {
    println!(
        r#"
  _      __    _      __               _      __
 | | /| / /__ (_)__ _/ /  ___  ___  (_)__  / /_
 | |/ |/ / -_) / _ `/ _ \/ _ \/ _ \/ / _ \/ __/
 |__/|__/\__/_/\_, /_//_/ .__/\___/_/_//_/\__/
              /___/    /_/   station v{}
"#,
        weighpoint_core::VERSION
    );
}

fn print_config(config: &Config) {
    println!("Configuration:");
    println!(
        "  Device identity: {}",
        config.device_id.as_deref().unwrap_or("(server-assigned)")
    );
    match &config.link {
        LinkConfig::Memory => println!("  Server link: in-memory"),
        LinkConfig::Coap { server_addr, .. } => println!("  Server link: coap://{}", server_addr),
    }
    println!("  Storage: {} ({})", config.store.backend, config.store.db_path);
    println!("  Sense interval: {:?}", config.schedule.sense_interval);
    println!("  Transmission fallback: {}", config.schedule.fallback_tx);
    println!("  Ack timeout: {:?}", config.transfer.ack_timeout);
    println!();
}

/// Operator stand-in for runs without a human at the station.
///
/// Confirms every calibration prompt and loads a simulated reference plate
/// onto the mock cell when asked to, so a first activation completes
/// end to end.
struct SimulatedOperator {
    cell: Arc<MockLoadCell>,
}

impl OperatorInput for SimulatedOperator {
    fn confirm(&self, prompt: &str) -> bool {
        if prompt.contains("plate") {
            self.cell.set_raw(120_000);
        } else {
            self.cell.set_raw(20_000);
        }
        log::info!("operator prompt confirmed: {}", prompt);
        true
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    print_banner();

    let mut config = if args.low_power {
        Config::low_power()
    } else {
        Config::from_env()
    };
    if let Some(id) = args.device_id {
        config.device_id = Some(id);
    }
    if let Some(addr) = args.server {
        config.link = LinkConfig::Coap {
            server_addr: addr.clone(),
            time_server_addr: addr,
            bind_addr: "0.0.0.0:0".to_string(),
        };
    }
    if let Some(path) = args.db {
        config.store.db_path = path;
        config.store.backend = StoreBackendType::Sqlite;
    }
    if args.simulate {
        config.link = LinkConfig::Memory;
        config.store.backend = StoreBackendType::Memory;
    }
    config.validate()?;
    print_config(&config);

    match (&config.link, config.store.backend) {
        (LinkConfig::Memory, StoreBackendType::Memory) => {
            let link = Arc::new(MemoryLink::new());
            let store = Arc::new(Mutex::new(MemoryStore::with_capacities(
                config.store.log_capacity,
                config.store.table_capacity,
            )));
            run_station(config, link, store)
        }
        (LinkConfig::Memory, StoreBackendType::Sqlite) => {
            let link = Arc::new(MemoryLink::new());
            let store = Arc::new(Mutex::new(open_sqlite(&config)?));
            run_station(config, link, store)
        }
        (LinkConfig::Coap { .. }, backend) => {
            let link = Arc::new(open_coap(&config)?);
            match backend {
                StoreBackendType::Memory => {
                    let store = Arc::new(Mutex::new(MemoryStore::with_capacities(
                        config.store.log_capacity,
                        config.store.table_capacity,
                    )));
                    run_station(config, link, store)
                }
                StoreBackendType::Sqlite => {
                    let store = Arc::new(Mutex::new(open_sqlite(&config)?));
                    run_station(config, link, store)
                }
            }
        }
    }
}

#[cfg(feature = "coap")]
fn open_coap(config: &Config) -> Result<weighpoint_core::CoapLink> {
    match &config.link {
        LinkConfig::Coap {
            server_addr,
            time_server_addr,
            bind_addr,
        } => weighpoint_core::CoapLink::open(server_addr, time_server_addr, bind_addr),
        LinkConfig::Memory => unreachable!("caller matched on LinkConfig::Coap"),
    }
}

#[cfg(not(feature = "coap"))]
fn open_coap(_config: &Config) -> Result<MemoryLink> {
    Err(weighpoint_core::Error::Config(
        weighpoint_core::ConfigError::Invalid(
            "coap link requested but the coap feature is disabled".to_string(),
        ),
    ))
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &Config) -> Result<weighpoint_core::SqliteStore> {
    weighpoint_core::SqliteStore::open(&config.store)
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &Config) -> Result<MemoryStore> {
    Err(weighpoint_core::Error::Config(
        weighpoint_core::ConfigError::Invalid(
            "sqlite storage requested but the sqlite feature is disabled".to_string(),
        ),
    ))
}

/// Wire up and run one station: controller loop plus the sensing loop.
fn run_station<L, S>(config: Config, link: Arc<L>, store: Arc<Mutex<S>>) -> Result<()>
where
    L: ServerLink + Send + Sync + 'static,
    S: DeviceStore + 'static,
{
    let cell = Arc::new(MockLoadCell::new(20_000));
    let gauge = Arc::new(MockBatteryGauge::new(3.9));
    let display = Arc::new(LogDisplay::new(config.display_mode));
    let operator = Arc::new(SimulatedOperator {
        cell: Arc::clone(&cell),
    });
    let clock = Arc::new(SystemClock);
    let sense_interval = config.schedule.sense_interval;

    let mut controller = LifecycleController::new(
        config,
        link,
        Arc::clone(&store),
        Arc::clone(&cell) as Arc<dyn LoadCell>,
        gauge,
        display,
        operator,
        Arc::clone(&clock) as Arc<dyn Clock>,
    )?;

    // Boot sequence: provision (idempotent if already provisioned), then go
    // on duty.
    let queue = controller.queue();
    queue.enqueue(Event::immediate(EventKind::Setup))?;
    queue.enqueue(Event::urgent(EventKind::Activate))?;

    let context = controller.context();
    let running = controller.running();
    // The sensing loop checks this flag on entry; raise it before the task
    // starts.
    running.store(true, Ordering::SeqCst);

    println!("Starting station, press Ctrl+C to stop");
    println!();

    smol::block_on(async move {
        let sense = smol::spawn(sensing_loop(
            store,
            Arc::clone(&cell),
            clock,
            context,
            Arc::clone(&running),
            sense_interval,
        ));

        let result = controller.run().await;
        running.store(false, Ordering::SeqCst);
        let stats = sense.await;
        let power = controller.power_stats();
        log::info!(
            "station stopped: {} events dispatched, {} measurements stored, asleep {:.0}% of uptime",
            controller.stats().dispatched,
            stats.stored,
            power.sleep_percentage()
        );
        result
    })
}
