//! jamcore CLI - Command-line interface for jamcore nodes
//!
//! Writes node configurations and inspects them together with the last
//! status snapshot a running node persisted.

use anyhow::Result;
use clap::{Parser, Subcommand};
use jamcore::runtime::condition::{PlacementEvaluator, StaticTopology, Tier};
use jamcore::runtime::storage::{self, Storage};
use jamcore::runtime::{Runtime, RuntimeConfig, RuntimeStatus};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "jamcore")]
#[command(about = "Activity execution engine for edge/fog/cloud nodes", long_about = None)]
struct Cli {
    /// Root directory for runtime storage
    #[arg(short, long, default_value = ".jamcore")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new node configuration
    Init {
        /// Tier this node runs on (device, fog, cloud)
        #[arg(long, default_value = "device")]
        tier: Tier,

        /// Comma-separated tiers whose brokers the node connects to
        #[arg(long, value_delimiter = ',', default_value = "device")]
        links: Vec<Tier>,

        /// Broker port
        #[arg(long, default_value = "1883")]
        port: u16,

        /// Device serial number
        #[arg(long, default_value = "1")]
        serial_num: u32,

        /// Application tag
        #[arg(long, default_value = "app")]
        app_tag: String,

        /// Maximum concurrently live activities
        #[arg(long, default_value = "64")]
        activity_capacity: usize,
    },

    /// Show node configuration and last known status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            tier,
            links,
            port,
            serial_num,
            app_tag,
            activity_capacity,
        } => {
            let config = RuntimeConfig {
                root: cli.root.clone(),
                tier,
                links,
                port,
                serial_num,
                app_tag,
                activity_capacity,
                ..RuntimeConfig::default()
            };
            config.validate()?;

            Runtime::init(&config)?;
            println!("Initialized jamcore node {} at {:?}", config.device_id, cli.root);
        }

        Commands::Status { json } => {
            let config = storage::load_config(&cli.root)?;
            let status = Storage::new(cli.root.clone())
                .load_status()?
                .unwrap_or_else(|| RuntimeStatus::from_config(&config));

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            let topology = StaticTopology::new(&config.links);
            println!("Device:     {}", status.device_id);
            println!("App tag:    {}", status.app_tag);
            println!("Tier:       {}", status.tier);
            println!("Links:      {:?}", topology.tiers());
            println!("Root tier:  {}", topology.current_root_tier());
            println!("Port:       {}", config.port);
            println!(
                "Activities: {} live, {} free",
                status.activities.len(),
                status.free_slots()
            );
            println!("In flight:  {}", status.in_flight);
            for activity in &status.activities {
                println!(
                    "  {} {} [{}] last access {}",
                    activity.id, activity.name, activity.state, activity.access_time
                );
            }
        }
    }

    Ok(())
}
