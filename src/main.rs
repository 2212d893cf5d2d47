use std::sync::Arc;

use clap::{CommandFactory, Parser};
use log::{info, warn};
use rustls::crypto::{CryptoProvider, ring};

use marketfeed::exchanges;
use marketfeed::gateway::ExchangeGateway;
use marketfeed::settings::FeedSettings;
use marketfeed::sinks::Sink;
use marketfeed::sinks::csv::CsvSink;
use marketfeed::sinks::kdb::KdbSink;
use marketfeed::sinks::redis_kv::RedisSink;
use marketfeed::sinks::socket::SocketSink;
use marketfeed::sinks::sql::SqlSink;
use marketfeed::subscription::load_subscriptions;

/// Multi-venue cryptocurrency market-data feed handler.
#[derive(Debug, Parser)]
#[command(name = "marketfeed")]
struct Args {
    /// Instrument subscription file.
    #[arg(long, default_value = "subscriptions.ini")]
    subscriptions: String,

    /// Stamp rows with the venue-reported timestamp instead of the
    /// local clock.
    #[arg(long)]
    use_exchange_timestamp: bool,

    /// SQLite database path.
    #[arg(long)]
    sqlite: Option<String>,

    /// MySQL destination, formatted as user:pwd@host:port.
    #[arg(long)]
    mysql: Option<String>,

    /// MySQL schema.
    #[arg(long, default_value = "marketfeed")]
    mysql_schema: String,

    /// PostgreSQL destination, formatted as user:pwd@host:port.
    #[arg(long)]
    postgres: Option<String>,

    /// PostgreSQL schema.
    #[arg(long, default_value = "marketfeed")]
    postgres_schema: String,

    /// CSV output directory.
    #[arg(long)]
    csv: Option<String>,

    /// Kdb+ destination, formatted as host:port.
    #[arg(long)]
    kdb: Option<String>,

    /// Socket publisher destination, for example tcp://127.0.0.1:3306.
    #[arg(long)]
    socket_publisher: Option<String>,

    /// Key-value store destination, formatted as host:port.
    #[arg(long)]
    kv: Option<String>,

    /// Key-value database index.
    #[arg(long, default_value_t = 0)]
    kv_db: u32,

    /// Proxy URL for venue connections.
    #[arg(long)]
    proxy: Option<String>,

    /// Log file path; stderr when absent.
    #[arg(long)]
    log: Option<String>,
}

fn init_logger(path: Option<&str>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = path {
        let file = std::fs::File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

async fn build_sinks(args: &Args) -> anyhow::Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if let Some(path) = &args.sqlite {
        sinks.push(Arc::new(SqlSink::connect_sqlite(path).await?));
    }
    if let Some(dest) = &args.mysql {
        sinks.push(Arc::new(SqlSink::connect_mysql(dest, &args.mysql_schema).await?));
    }
    if let Some(dest) = &args.postgres {
        sinks.push(Arc::new(
            SqlSink::connect_postgres(dest, &args.postgres_schema).await?,
        ));
    }
    if let Some(dir) = &args.csv {
        sinks.push(Arc::new(CsvSink::connect(dir)?));
    }
    if let Some(dest) = &args.kdb {
        sinks.push(Arc::new(KdbSink::connect(dest).await?));
    }
    if let Some(dest) = &args.socket_publisher {
        sinks.push(Arc::new(SocketSink::connect(dest)?));
    }
    if let Some(dest) = &args.kv {
        sinks.push(Arc::new(RedisSink::connect(dest, args.kv_db).await?));
    }
    Ok(sinks)
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {message}");
    let _ = Args::command().print_help();
    eprintln!();
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger(args.log.as_deref())?;

    // rustls needs its CryptoProvider installed exactly once, before the
    // first TLS handshake.
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    let sinks = build_sinks(&args).await?;
    if sinks.is_empty() {
        usage_error("please select at least one sink");
    }

    let subscriptions = match load_subscriptions(&args.subscriptions) {
        Ok(subscriptions) => subscriptions,
        Err(err) => usage_error(&err.to_string()),
    };
    if subscriptions.is_empty() {
        usage_error(&format!(
            "no instrument found in subscription file '{}'",
            args.subscriptions
        ));
    }

    let settings = FeedSettings {
        is_local_timestamp: !args.use_exchange_timestamp,
        proxy: args.proxy.clone(),
        ..FeedSettings::default()
    };
    let gateway = Arc::new(ExchangeGateway::new(sinks, settings)?);
    gateway.init_snapshot_table().await;

    info!("subscription file = {}", args.subscriptions);
    for sub in &subscriptions {
        info!("{}/{}/{}", sub.exchange, sub.instmt_name, sub.instmt_code);
    }

    let mut handles = Vec::new();
    for sub in &subscriptions {
        let Some(venue) = exchanges::get_venue(&sub.exchange) else {
            warn!("exchange '{}' is not supported", sub.exchange);
            continue;
        };
        info!("starting instrument {}-{}", sub.exchange, sub.instmt_name);
        handles.extend(gateway.start(venue, sub).await);
    }
    if handles.is_empty() {
        usage_error("no subscription matched a supported exchange");
    }

    // Workers run forever; the process exits on external signal only.
    futures_util::future::pending::<()>().await;
    Ok(())
}
