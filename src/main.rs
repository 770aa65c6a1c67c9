//! Binary entrypoint for the inkfleet CLI.
//!
//! Commands:
//! - `start` - run the fleet server (MQTT transport + playback scheduler)
//! - `init` - create a starter `config.toml` and the data directory
//! - `status [--device <code>] [--limit <n>]` - print push ledger totals and,
//!   for one device, its recent push history
//!
//! See the library crate docs for module-level details: `inkfleet::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use inkfleet::config::Config;
use inkfleet::fleet::FleetServer;
use inkfleet::ledger::PushLedger;

#[derive(Parser)]
#[command(name = "inkfleet")]
#[command(about = "Content scheduler for an e-ink billboard fleet over MQTT")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the fleet server
    Start,
    /// Initialize a new configuration file and data directory
    Init,
    /// Show push ledger totals and device history
    Status {
        /// Print recent push history for this device
        #[arg(short, long)]
        device: Option<String>,
        /// Number of history entries to print
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            info!("Starting inkfleet v{}", env!("CARGO_PKG_VERSION"));
            let server = FleetServer::new(config)?;
            server.run().await?;
        }
        Commands::Init => {
            info!("Initializing new fleet configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);

            let config = Config::load(&cli.config).await?;
            tokio::fs::create_dir_all(&config.storage.data_dir).await?;
            info!("Data directory created at {}", config.storage.data_dir);
        }
        Commands::Status { device, limit } => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            let ledger_path = std::path::Path::new(&config.storage.data_dir).join("ledger");
            let ledger = PushLedger::open(&ledger_path)?;

            let counts = ledger.counts()?;
            println!("Push ledger: {}", ledger.path().display());
            println!("  pending: {}", counts.pending);
            println!("  sent:    {}", counts.sent);
            println!("  success: {}", counts.success);
            println!("  failed:  {}", counts.failed);
            println!("  total:   {}", counts.total());

            if let Some(device_code) = device {
                println!("\nRecent pushes for {device_code}:");
                let history = ledger.history(&device_code, limit)?;
                if history.is_empty() {
                    println!("  (none)");
                }
                for entry in history {
                    println!(
                        "  {} {:8} content={} ({}) by {}{}",
                        entry.issued_at.format("%Y-%m-%dT%H:%M:%SZ"),
                        entry.status.as_str(),
                        entry.content_id,
                        entry.content_kind,
                        entry.submitter_id,
                        entry
                            .error
                            .as_deref()
                            .map(|e| format!(" error: {e}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|cfg| cfg.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // rumqttc's state machine is chatty at debug level
    builder.filter_module("rumqttc", log::LevelFilter::Info);

    if let Some(file) = config.as_ref().and_then(|cfg| cfg.logging.file.clone()) {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When stdout is a TTY (foreground mode), echo log lines to the
            // console as well as the file.
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
            let _ = builder.try_init();
            return;
        }
    }

    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
