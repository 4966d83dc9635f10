//! Gatehouse - game server network boundary
//!
//! Runs an auth or world gateway, or probes one.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gatehouse::config::{self, Config};
use gatehouse::crypto::default_cipher;
use gatehouse::handlers::register_gateway_handlers;
use gatehouse::network::{resolve_host, DispatchRegistry, Listener, ProbeClient};
use gatehouse::protocol::{self, ConnectionType, Opcode};

/// Gatehouse - game server network boundary
#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(author = "Gatehouse Contributors")]
#[command(version)]
#[command(about = "Framing, codec and connection handling for game clients", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a gateway listener
    Serve {
        /// Port to listen on (overrides the configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides the configuration)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Connect to a gateway and print its greeting
    Probe {
        /// Gateway host name or address
        host: String,

        /// Gateway port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,

        /// Connect timeout in seconds
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the opcode registry
    Opcodes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose || config.general.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                config.network.port = port;
            }
            if let Some(bind) = bind {
                config.network.bind_address = bind;
            }
            config.validate()?;
            run_gateway(config).await?;
        }
        Commands::Probe {
            host,
            port,
            timeout,
        } => {
            run_probe(&config, &host, port, Duration::from_secs(timeout)).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Opcodes => {
            print_opcodes();
        }
    }

    Ok(())
}

/// Run a gateway until Ctrl+C
async fn run_gateway(config: Config) -> anyhow::Result<()> {
    let registry = register_gateway_handlers(DispatchRegistry::builder())?.build();
    let settings = config.to_settings();

    tracing::info!(
        "Starting {:?} gateway '{}' (protocol {}, encryption {})",
        config.connection.connection_type,
        config.general.name,
        protocol::PROTOCOL_VERSION,
        if config.encryption.enabled { "on" } else { "off" }
    );

    let mut listener = Listener::start(
        config.bind_addr()?,
        registry,
        settings,
        config.network.accept_workers,
    )
    .await?;

    println!("\n========================================");
    println!("  Gatehouse Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Listening: {}", listener.local_addr());
    println!("  Type: {:?}", config.connection.connection_type);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    listener.stop().await;
    tracing::info!("Gateway stopped");

    Ok(())
}

/// Connect, decode the greeting and disconnect
async fn run_probe(config: &Config, host: &str, port: u16, timeout: Duration) -> anyhow::Result<()> {
    let addr = resolve_host(host, port).await?;
    let client = ProbeClient::connect(
        addr,
        timeout,
        default_cipher(config.encryption.enabled),
        config.encryption.seeds(),
    )
    .await?;

    let greeting = client.greeting();
    let connection_type = client.connection_type();

    println!("Greeting from {}", client.server_addr());
    println!("  Protocol version: {}", greeting.auth_version);
    println!("  Connection type:  {:?} ({})", connection_type, greeting.connection_type);
    println!("  Realm:            {} (group {})", greeting.realm_id, greeting.realm_group_id);
    println!("  Listen port:      {}", greeting.listen_port);
    println!("  Startup time:     {}", greeting.startup_time);
    println!("  Message CRC:      0x{:08X}", greeting.network_message_crc);
    println!("  Process id:       {}", greeting.process_id);

    if greeting.auth_version != protocol::PROTOCOL_VERSION {
        println!(
            "\nWarning: server speaks protocol {}, this build speaks {}",
            greeting.auth_version,
            protocol::PROTOCOL_VERSION
        );
    }
    if connection_type == ConnectionType::World {
        println!("\nWorld gateways expect a session key from the auth gateway first.");
    }

    client.close().await?;
    Ok(())
}

fn print_opcodes() {
    println!("Gatehouse {} opcode registry", gatehouse::VERSION);
    println!("================================\n");

    for opcode in Opcode::ALL {
        println!("  0x{:04X}  {:<20} {}", opcode.as_u16(), opcode.name(), opcode.display_name());
    }
}
