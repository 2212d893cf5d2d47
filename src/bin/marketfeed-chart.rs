use clap::{CommandFactory, Parser};

use marketfeed::subscription::load_subscriptions;
use marketfeed::workers::chart::ChartWorker;
use marketfeed::workers::connect_kv;

/// Render a rolling two-minute ASCII price chart for one instrument.
#[derive(Debug, Parser)]
#[command(name = "marketfeed-chart")]
struct Args {
    /// Instrument subscription file; the first subscription is charted.
    #[arg(long, default_value = "subscriptions.ini")]
    subscriptions: String,

    /// Key-value store destination, formatted as host:port.
    #[arg(long)]
    kv: Option<String>,

    /// Key-value database index.
    #[arg(long, default_value_t = 0)]
    kv_db: u32,

    /// Log file path; logging is off when absent so frames stay clean.
    #[arg(long)]
    log: Option<String>,
}

fn init_logger(path: Option<&str>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();
    match path {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            builder
                .filter_level(log::LevelFilter::Info)
                .target(env_logger::Target::Pipe(Box::new(file)));
        }
        None => {
            builder.filter_level(log::LevelFilter::Off);
        }
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
    let Some(first) = subscriptions.first() else {
        usage_error(&format!(
            "no instrument found in subscription file '{}'",
            args.subscriptions
        ));
    };

    let conn = connect_kv(kv, args.kv_db).await?;
    ChartWorker::new(conn, &first.exchange, &first.instmt_name)
        .run()
        .await?;
    Ok(())
}
