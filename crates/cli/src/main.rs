use anyhow::Context;
use clap::{Parser, Subcommand};
use serialnet::client::{Client, PortEvent};
use serialnet::config;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "serialnet")]
#[command(about = "Serial ports over WebSocket", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway, exposing this machine's serial ports over WebSocket.
    Serve {
        /// Config file path (default: SERIALNET_CONFIG_PATH or ~/.serialnet/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,

        /// Bind address (default from config or 127.0.0.1)
        #[arg(long, short)]
        bind: Option<String>,

        /// Serve a simulated loopback device with this name instead of real ports (repeatable).
        #[arg(long, value_name = "NAME")]
        simulate: Vec<String>,
    },

    /// List the serial devices of a gateway as JSON.
    List {
        /// Config file path (default: SERIALNET_CONFIG_PATH or ~/.serialnet/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway WebSocket URL (default: SERIALNET_URL or client.url from config)
        #[arg(long, short)]
        url: Option<String>,
    },

    /// Open a remote port: stdin lines are written to it, received bytes go to stdout.
    Monitor {
        /// Port name on the gateway (e.g. /dev/ttyUSB0 or COM3)
        port: String,

        /// Baud rate
        #[arg(long, short, default_value_t = 9600)]
        baud: u32,

        /// Config file path (default: SERIALNET_CONFIG_PATH or ~/.serialnet/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway WebSocket URL (default: SERIALNET_URL or client.url from config)
        #[arg(long, short)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("serialnet {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve {
            config,
            port,
            bind,
            simulate,
        }) => {
            if let Err(e) = run_serve(config, port, bind, simulate).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::List { config, url }) => {
            if let Err(e) = run_list(config, url).await {
                log::error!("list failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Monitor {
            port,
            baud,
            config,
            url,
        }) => {
            if let Err(e) = run_monitor(port, baud, config, url).await {
                log::error!("monitor failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
    simulate: Vec<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if let Some(b) = bind {
        config.gateway.bind = b;
    }
    if !simulate.is_empty() {
        config.simulated = simulate;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    let driver = serialnet::device::driver_from_config(&config);
    serialnet::gateway::run_gateway(config, driver).await
}

async fn connect(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<Client> {
    let (config, _) = config::load_config(config_path)?;
    let url = url.unwrap_or_else(|| config::resolve_client_url(&config));
    Client::connect(&url, config.client.options())
        .await
        .with_context(|| format!("connecting to {}", url))
}

async fn run_list(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<()> {
    let client = connect(config_path, url).await?;
    let devices = client.list_ports().await?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    client.disconnect();
    Ok(())
}

async fn run_monitor(
    port: String,
    baud: u32,
    config_path: Option<PathBuf>,
    url: Option<String>,
) -> anyhow::Result<()> {
    let client = connect(config_path, url).await?;
    let mut remote = client.open_port(port.as_str(), baud).await?;
    log::info!("monitoring {} at {} baud", port, baud);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        remote.write(format!("{}\n", line)).await?;
                    }
                    None => {
                        stdin_open = false;
                        remote.close().await?;
                    }
                }
            }
            event = remote.recv() => {
                match event {
                    Some(PortEvent::Data(data)) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    Some(PortEvent::Error(message)) => {
                        eprintln!("{}: {}", port, message);
                    }
                    Some(PortEvent::Close) | None => break,
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}
