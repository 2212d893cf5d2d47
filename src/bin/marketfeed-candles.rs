use clap::{CommandFactory, Parser};
use log::info;

use marketfeed::subscription::load_subscriptions;
use marketfeed::workers::candles::CandleWorker;
use marketfeed::workers::connect_kv;

/// Aggregate the bucketed trade stream into per-second OHLCV candles.
#[derive(Debug, Parser)]
#[command(name = "marketfeed-candles")]
struct Args {
    /// Instrument subscription file.
    #[arg(long, default_value = "subscriptions.ini")]
    subscriptions: String,

    /// Key-value store destination, formatted as host:port.
    #[arg(long)]
    kv: Option<String>,

    /// Key-value database index.
    #[arg(long, default_value_t = 0)]
    kv_db: u32,

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

    let Some(kv) = &args.kv else {
        usage_error("please define the key-value store destination");
    };
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

    let conn = connect_kv(kv, args.kv_db).await?;
    info!("candle worker sweeping {} instrument(s)", subscriptions.len());
    CandleWorker::new(conn, &subscriptions).run().await;
    Ok(())
}
