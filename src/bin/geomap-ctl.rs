//! Operator tool for a running geomap bridge.
//!
//! Usage:
//!   geomap-ctl status
//!   geomap-ctl send-now --entity-id device_tracker.phone
//!   geomap-ctl test-post --index 0 --lat 48.1 --lon 11.5
//!   geomap-ctl update-device --index 0 --poll-seconds 60
//!   geomap-ctl reload

use clap::{Parser, Subcommand};
use geomap_bridge::config::{Config, DeviceUpdate};
use geomap_bridge::control::{Command, CommandReply, send_command};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "geomap-ctl")]
#[command(about = "Send operator commands to a running geomap bridge")]
struct Cli {
    /// Control socket of the running bridge
    #[arg(long, env = "GEOMAP_CONTROL_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configured devices and watcher state
    Status,
    /// Send a device's current position now
    SendNow {
        /// Entity to send (defaults to the first device)
        #[arg(long)]
        entity_id: Option<String>,
    },
    /// Force a delivery with test coordinates
    TestPost {
        /// Device index (defaults to 0)
        #[arg(long)]
        index: Option<usize>,
        #[arg(long, allow_negative_numbers = true)]
        lat: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        lon: Option<f64>,
    },
    /// Edit a stored device and reload all watchers
    UpdateDevice {
        #[arg(long)]
        index: usize,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        entity_id: Option<String>,
        #[arg(long)]
        server_url: Option<String>,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        verify_ssl: Option<bool>,
        #[arg(long)]
        poll_seconds: Option<u64>,
    },
    /// Rebuild all watchers from the stored devices
    Reload,
}

impl From<Commands> for Command {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Status => Command::Status,
            Commands::SendNow { entity_id } => Command::SendNow { entity_id },
            Commands::TestPost { index, lat, lon } => Command::TestPost {
                device_index: index,
                lat,
                lon,
            },
            Commands::UpdateDevice {
                index,
                name,
                entity_id,
                server_url,
                key,
                enabled,
                verify_ssl,
                poll_seconds,
            } => Command::UpdateDevice {
                index,
                fields: DeviceUpdate {
                    name,
                    entity_id,
                    server_url,
                    key,
                    enabled,
                    verify_ssl,
                    poll_seconds,
                },
            },
            Commands::Reload => Command::Reload,
        }
    }
}

fn main() {
    geomap_bridge::config::load_dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let socket = cli
        .socket
        .unwrap_or_else(|| Config::from_env().control_socket);
    let command: Command = cli.command.into();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(send_command(&socket, &command)) {
        Ok(CommandReply::Ok { message }) => println!("{}", message),
        Ok(CommandReply::Error { message }) => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to reach bridge at {:?}: {}", socket, e);
            eprintln!("Make sure geomap-bridge is running.");
            std::process::exit(2);
        }
    }
}
