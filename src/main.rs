//! Syndicate UG CLI
//!
//! Command-line entry point for running and managing a User Gateway.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syndicate_ug::closure::GatewayKeys;
use syndicate_ug::ms::{MemMsClient, MsClient};
use syndicate_ug::replication::{MemRgClient, RgClient};
use syndicate_ug::{Config, Gateway};

#[derive(Parser)]
#[command(name = "syndicate-ug")]
#[command(version = "0.1.0")]
#[command(about = "Syndicate User Gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/syndicate-ug/config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway and serve peer requests
    Run,

    /// Show gateway configuration and key identity
    Status,

    /// Initialize a data directory and gateway key
    Init {
        /// Data directory path
        #[arg(short, long, default_value = "/var/lib/syndicate-ug")]
        data_root: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    match cli.command {
        Commands::Run => run(config),

        Commands::Status => {
            println!("Gateway:      {} (id {})", config.gateway_name, config.gateway_id);
            println!("Volume:       {}", config.volume);
            println!("MS URL:       {}", config.ms_url);
            println!("Public URL:   {}", config.public_url);
            println!("Data root:    {}", config.data_root.display());
            println!("Staging:      {}", config.staging_dir().display());

            match GatewayKeys::load(&config.private_key_path) {
                Ok(keys) => println!("Public key:   {}", keys.public_base64()),
                Err(_) => println!("Public key:   (no key at {})", config.private_key_path.display()),
            }
        }

        Commands::Init { data_root } => {
            info!("Initializing data directory at {:?}", data_root);

            let staging = data_root.join("staging");
            if let Err(e) = std::fs::create_dir_all(&staging) {
                error!("Failed to create {:?}: {}", staging, e);
                std::process::exit(1);
            }

            let key_path = data_root.join("gateway.key");
            match GatewayKeys::load_or_generate(&key_path) {
                Ok(keys) => info!("Gateway public key: {}", keys.public_base64()),
                Err(e) => {
                    error!("Failed to create gateway key: {}", e);
                    std::process::exit(1);
                }
            }

            info!("  {}/staging/  - block staging tree", data_root.display());
            info!("  {}/gateway.key - gateway identity", data_root.display());
            info!("Initialization complete");
        }
    }
}

fn run(config: Config) {
    // The wire MS and RG clients are deployment-specific; a gateway built
    // without them runs against the in-process doubles (standalone mode).
    let ms: Arc<dyn MsClient> = Arc::new(MemMsClient::new(1, 4096));
    let rg: Arc<dyn RgClient> = Arc::new(MemRgClient::new());

    let bind = peer_bind_address(&config.public_url);
    let gateway = match Gateway::init(config, ms, rg) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!("Gateway initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let gateway_for_peers = Arc::clone(&gateway);
    let _server = match syndicate_ug::network::PeerServer::start(&bind, move |msg| {
        gateway_for_peers.handle_peer_message(msg)
    }) {
        Ok(s) => s,
        Err(e) => {
            error!("Peer server failed to start on {}: {}", bind, e);
            gateway.shutdown();
            std::process::exit(1);
        }
    };

    // Runs until the process is stopped; the supervisor's signal tears the
    // process (and with it the flush pool and vacuumer) down.
    info!("Gateway running; peer requests on {}", bind);
    loop {
        std::thread::park();
    }
}

/// Peer listener address derived from the public URL
fn peer_bind_address(public_url: &str) -> String {
    let hostport = public_url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let hostport = hostport.split('/').next().unwrap_or(hostport);
    format!("0.0.0.0:{}", hostport.rsplit(':').next().unwrap_or("9600"))
}
