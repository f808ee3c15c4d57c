//! pvedash - terminal dashboard for Proxmox VE clusters

use clap::Parser;
use pvedash_api::{Aggregator, Client};
use pvedash_common::{Error, ResponseCache};
use pvedash_web::VncBridge;
use std::path::PathBuf;
use std::sync::Arc;

mod app;
mod config;
mod dispatcher;
mod shell;
mod theme;
mod ui;

use config::{Config, Overrides};
use dispatcher::AppContext;

/// Keyboard-driven dashboard for Proxmox VE clusters
#[derive(Parser)]
#[command(name = "pvedash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// API address, e.g. https://pve.example.com:8006
    #[arg(long)]
    addr: Option<String>,

    /// API user name without the realm
    #[arg(long)]
    user: Option<String>,

    /// Authentication realm
    #[arg(long)]
    realm: Option<String>,

    /// Password for ticket auth
    #[arg(long)]
    password: Option<String>,

    /// API token id
    #[arg(long)]
    token_id: Option<String>,

    /// API token secret
    #[arg(long)]
    token_secret: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// User for SSH shells
    #[arg(long)]
    ssh_user: Option<String>,

    /// Disable the response cache
    #[arg(long)]
    no_cache: bool,

    /// Verbose request logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            addr: self.addr.clone(),
            user: self.user.clone(),
            realm: self.realm.clone(),
            password: self.password.clone(),
            token_id: self.token_id.clone(),
            token_secret: self.token_secret.clone(),
            insecure: self.insecure.then_some(true),
            ssh_user: self.ssh_user.clone(),
            cache_dir: None,
            debug: self.debug.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let config = match Config::resolve(config_path.as_deref(), &cli.overrides()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e}");
        eprintln!(
            "edit {} or pass --addr/--user plus --password or --token-id/--token-secret",
            config_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "~/.config/pvedash/config.toml".to_string())
        );
        std::process::exit(1);
    }

    init_logging(&config)?;

    // The UI owns stdout; the cache and log live in cache_dir.
    let cache = if cli.no_cache {
        ResponseCache::new()
    } else {
        ResponseCache::with_disk(&config.cache_dir)
            .unwrap_or_else(|_| ResponseCache::new())
    };

    let client = Arc::new(Client::new(&config.connection_options(), cache)?.with_no_cache(cli.no_cache));
    Arc::clone(&client).spawn_ticket_renewal();

    // One authenticated round-trip before taking over the terminal.
    if let Err(e) = client.verify().await {
        match &e {
            Error::AuthRejected(_) | Error::AuthRequired => {
                eprintln!("authentication failed: {e}");
                eprintln!(
                    "check your credentials in {}",
                    config_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "the environment".to_string())
                );
            }
            _ => {
                eprintln!("could not reach {}: {e}", config.addr);
            }
        }
        std::process::exit(1);
    }

    let aggregator = Arc::new(Aggregator::new(Arc::clone(&client)));
    let bridge = Arc::new(VncBridge::new(
        Arc::clone(&client),
        config.insecure,
        config.is_using_token_auth(),
    ));

    let ctx = Arc::new(AppContext {
        config,
        client,
        aggregator,
        bridge,
    });

    // The event loop blocks; the runtime keeps serving workers meanwhile.
    tokio::task::spawn_blocking(move || dispatcher::run(ctx)).await??;
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.cache_dir)?;
    let log_file = std::fs::File::create(config.cache_dir.join("pvedash.log"))?;
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}
