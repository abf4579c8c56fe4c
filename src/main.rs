use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

use whisper_bridge::client::{BridgeClient, DEFAULT_URL};
use whisper_bridge::config::{BridgeConfig, ConfigLoader};
use whisper_bridge::server;
use whisper_bridge::subprocess::TokioWorkerSpawner;
use whisper_bridge::Orchestrator;

/// Extra client-side wait on top of the bridge's own request timeout
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// HTTP bridge to a whisper speech recognition worker
#[derive(Parser)]
#[command(name = "whisper-bridge", version)]
#[command(about = "Serve a line-oriented whisper worker over HTTP, one request at a time", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file (default: ./whisper-bridge.toml)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker and serve HTTP requests (default command)
    Serve(ServeArgs),
    /// Print the resolved configuration as TOML
    Config,
    /// Send a file to a running bridge and print the recognition
    Recognize {
        /// Path of the audio file, as seen by the worker
        file: String,

        /// Base URL of the bridge (default: the configured listen address)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker executable, relative to the worker root unless absolute
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Working directory of the worker
    #[arg(long)]
    root: Option<PathBuf>,

    /// Arguments for the worker, given after `--`
    #[arg(last = true)]
    worker_args: Vec<String>,
}

impl ServeArgs {
    fn apply(self, config: &mut BridgeConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(executable) = self.executable {
            config.worker.executable = executable;
        }
        if let Some(root) = self.root {
            config.worker.root = root;
        }
        if !self.worker_args.is_empty() {
            config.worker.args = self.worker_args;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigLoader::new(cli.config.clone()).load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    init_logging(cli.verbose, config.log_level.as_deref());

    debug!("whisper-bridge started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Some(Commands::Serve(args)) => run_serve(config, args).await,
        Some(Commands::Config) => print_config(&config),
        Some(Commands::Recognize { file, url }) => run_recognize(&config, &file, url).await,
        None => run_serve(config, ServeArgs::default()).await,
    };

    if let Err(e) = result {
        error!("Fatal error: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8, configured: Option<&str>) {
    let filter = match verbose {
        0 => std::env::var("RUST_LOG")
            .ok()
            .or_else(|| configured.map(str::to_string))
            .unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        2 => "trace".to_string(),
        _ => "trace,hyper=debug,tower=debug".to_string(), // -vvv shows everything including dependencies
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .with_thread_ids(verbose >= 3)
        .with_line_number(verbose >= 3)
        .init();
}

async fn run_serve(mut config: BridgeConfig, args: ServeArgs) -> anyhow::Result<()> {
    args.apply(&mut config);
    config.validate()?;

    let spawner = Arc::new(TokioWorkerSpawner::new(config.worker.kill_grace));
    let (service, orchestrator) = Orchestrator::spawn(&config, spawner);

    server::run_server(&config.bind_address(), service).await?;
    orchestrator.await?;
    Ok(())
}

fn print_config(config: &BridgeConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

async fn run_recognize(
    config: &BridgeConfig,
    file: &str,
    url: Option<String>,
) -> anyhow::Result<()> {
    let url = url.unwrap_or_else(|| {
        if config.server.host.is_empty() {
            DEFAULT_URL.to_string()
        } else {
            format!("http://{}", config.bind_address())
        }
    });

    let client = BridgeClient::new(&url, config.timing.request_timeout + CLIENT_TIMEOUT_SLACK)?;
    let recognition = client.recognize(file).await?;
    println!("{}", recognition.recognition);
    Ok(())
}
