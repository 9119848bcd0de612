mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use optbridge_api::AppState;
use optbridge_brokers_iqoption::IqOptionBroker;
use optbridge_core::{parse_balance_types, InstrumentLookup, LoginRequest, OrderStore, ResultStore};
use optbridge_data::{MemoryStore, PgStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::BridgeConfig;

#[derive(Parser)]
#[command(name = "optbridge")]
#[command(about = "Bridge to the IQ Option venue: REST server and one-shot queries")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database URL (overrides the config file)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Credentials {
    /// Venue login (email)
    #[arg(long, env = "IQ_IDENTIFIER")]
    identifier: Option<String>,

    /// Venue password
    #[arg(long, env = "IQ_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl Credentials {
    fn login_request(&self) -> Option<LoginRequest> {
        match (&self.identifier, &self.password) {
            (Some(identifier), Some(password)) => Some(LoginRequest {
                identifier: identifier.clone(),
                password: password.clone(),
                two_factor_code: None,
            }),
            _ => None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Server {
        /// Bind address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Print account balances
    Balances {
        /// Comma-separated balance types (1 = REAL, 4 = DEMO)
        #[arg(short, long, default_value = "1,4")]
        types: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Resolve a ticker to a venue instrument id
    Resolve {
        /// Ticker symbol (e.g. "EURUSD")
        ticker: String,

        /// Instrument category: digital-option, fx-option or auto
        #[arg(short = 't', long = "type", default_value = "auto")]
        lookup: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Print the latest state of an order
    Status {
        /// Venue order id
        order_id: i64,

        #[command(flatten)]
        credentials: Credentials,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.log_json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    let mut config = BridgeConfig::load(cli.config.as_deref())?;
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }

    match cli.command {
        Commands::Server { bind, credentials } => {
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let (orders, results) = open_stores(&config).await?;
            let broker = Arc::new(IqOptionBroker::connect(config.iqoption.clone(), orders.clone())?);
            if let Some(request) = credentials.login_request() {
                let response = broker.login(&request).await?;
                tracing::info!(success = response.success, "Startup login");
            }
            let state = Arc::new(AppState::new(broker, orders, results));
            optbridge_api::start_server(state, &bind).await?;
        }
        Commands::Balances { types, credentials } => {
            let broker = one_shot_broker(&config, &credentials).await?;
            let types = parse_balance_types(Some(&types));
            print_json(&broker.get_balances(&types).await)?;
        }
        Commands::Resolve {
            ticker,
            lookup,
            credentials,
        } => {
            let lookup: InstrumentLookup = lookup.parse()?;
            let broker = one_shot_broker(&config, &credentials).await?;
            print_json(&broker.resolve_instrument(lookup, &ticker).await?)?;
        }
        Commands::Status {
            order_id,
            credentials,
        } => {
            let broker = one_shot_broker(&config, &credentials).await?;
            print_json(&broker.order_status(order_id).await?)?;
        }
    }

    Ok(())
}

async fn open_stores(
    config: &BridgeConfig,
) -> Result<(Arc<dyn OrderStore>, Arc<dyn ResultStore>)> {
    match &config.database_url {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url).await.context("opening database")?);
            let orders: Arc<dyn OrderStore> = store.clone();
            let results: Arc<dyn ResultStore> = store;
            Ok((orders, results))
        }
        None => {
            tracing::warn!("No database configured, orders and results are kept in memory");
            let store = Arc::new(MemoryStore::new());
            let orders: Arc<dyn OrderStore> = store.clone();
            let results: Arc<dyn ResultStore> = store;
            Ok((orders, results))
        }
    }
}

/// A logged-in broker for a single query. Orders are never placed from the
/// CLI, so nothing is persisted.
async fn one_shot_broker(config: &BridgeConfig, credentials: &Credentials) -> Result<IqOptionBroker> {
    let request = credentials
        .login_request()
        .context("IQ_IDENTIFIER and IQ_PASSWORD (or --identifier/--password) are required")?;
    let broker = IqOptionBroker::connect(config.iqoption.clone(), Arc::new(MemoryStore::new()))?;
    let response = broker.login(&request).await?;
    if !response.success {
        anyhow::bail!("Login rejected: {}", response.raw);
    }
    Ok(broker)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
