use geomap_bridge::config::{self, Config, DeviceStore};
use geomap_bridge::control::{ControlRequest, ControlSocket};
use geomap_bridge::delivery::HttpDelivery;
use geomap_bridge::error::BridgeError;
use geomap_bridge::host::StateRegistry;
use geomap_bridge::input::mqtt::StateFeed;
use geomap_bridge::supervisor::Supervisor;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    // Environment is edited before the runtime starts its worker threads
    config::load_dotenv();
    init_logger();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run());
}

async fn run() {
    info!("Starting geomap bridge");

    let config = Config::from_env();
    info!("Configuration loaded:");
    info!("  Devices file: {:?}", config.devices_file);
    info!("  Control socket: {:?}", config.control_socket);
    match &config.mqtt {
        Some(mqtt) => info!(
            "  MQTT: {}:{} (base topic {})",
            mqtt.broker_host, mqtt.broker_port, mqtt.base_topic
        ),
        None => info!("  MQTT: disabled (MQTT_BROKER_HOST not set)"),
    }

    let control = match ControlSocket::bind(&config.control_socket) {
        Ok(socket) => socket,
        Err(BridgeError::AlreadyRunning) => {
            error!("Another geomap-bridge instance is already running");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Failed to bind control socket: {}", e);
            std::process::exit(1);
        }
    };

    let store = match DeviceStore::load(&config.devices_file) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to load device store {:?}: {}", config.devices_file, e);
            std::process::exit(1);
        }
    };

    let delivery = match HttpDelivery::new() {
        Ok(delivery) => Arc::new(delivery),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let states = StateRegistry::new();
    let feed_task = config
        .mqtt
        .clone()
        .map(|mqtt| StateFeed::new(mqtt, states.clone()).start());
    if feed_task.is_none() {
        warn!("No state feed configured; watchers will only see operator-triggered sends");
    }

    let mut supervisor = Supervisor::new(store, Arc::new(states), delivery);
    supervisor.start();

    let (control_tx, control_rx) = mpsc::channel::<ControlRequest>(16);
    let control_task = control.serve(control_tx);

    info!("Geomap bridge is running");
    info!("  - Press Ctrl+C to exit");

    supervisor
        .run(control_rx, async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        })
        .await;

    control_task.abort();
    if let Some(task) = feed_task {
        task.abort();
    }
    supervisor.shutdown();

    info!("Geomap bridge stopped");
}
