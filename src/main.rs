//! quotegate demo binary.
//!
//! Wires one or two venue feeds into a consumer for a single market and
//! prints a once-per-second top-of-book table (or JSON lines) from the
//! snapshot reader, the same surface a visualiser would consume.
//!
//! Usage:
//!   # Bitvavo websocket feed only:
//!   cargo run --release -- --market BTC-EUR
//!
//!   # Add a FIX/TCP feed alongside it:
//!   cargo run --release -- --market BTC-EUR \
//!       --fix-host fix.example.com --fix-port 9880 --fix-symbol EUR/USD

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use quotegate::{
    BookView, ConsumerConfig, FixSessionConfig, OrderBookSnapshot, QuoteConsumer, QuoteObtainer,
    VenueConfig,
};

#[derive(Parser, Debug)]
#[command(name = "quotegate")]
#[command(about = "Multi-venue Level-2 order book ingestion demo")]
struct Args {
    /// Market to subscribe to (venue spelling, e.g. BTC-EUR)
    #[arg(long, default_value = "BTC-EUR")]
    market: String,

    /// Websocket venue host
    #[arg(long, default_value = "ws.bitvavo.com")]
    ws_host: String,

    #[arg(long, default_value = "443")]
    ws_port: u16,

    /// Optional FIX venue host; enables the TCP feed when set
    #[arg(long)]
    fix_host: Option<String>,

    #[arg(long, default_value = "9880")]
    fix_port: u16,

    #[arg(long, default_value = "FIXSIM-CLIENT-MKD")]
    fix_sender_comp_id: String,

    #[arg(long, default_value = "FIXSIM-SERVER-MKD")]
    fix_target_comp_id: String,

    /// FIX symbol when it differs from the websocket market id
    #[arg(long)]
    fix_symbol: Option<String>,

    #[arg(long, default_value = "5000")]
    connect_timeout_ms: u64,

    /// Snapshot coalescing window for depth-only updates
    #[arg(long, default_value = "20")]
    publish_period_ms: u64,

    /// Levels per side copied into each snapshot
    #[arg(long, default_value = "80")]
    publish_levels: usize,

    #[arg(long, default_value = "10")]
    max_reconnect_attempts: u32,

    /// Emit one JSON snapshot line per second instead of the table
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quotegate=info")),
        )
        .init();

    let args = Args::parse();
    let connect_timeout = Duration::from_millis(args.connect_timeout_ms);

    let mut obtainers: Vec<QuoteObtainer> = Vec::new();

    obtainers.push(QuoteObtainer::websocket(VenueConfig {
        host: args.ws_host.clone(),
        port: args.ws_port,
        market: args.market.clone(),
        connect_timeout,
        max_reconnect_attempts: args.max_reconnect_attempts,
    }));

    if let Some(fix_host) = &args.fix_host {
        let fix_market = args.fix_symbol.clone().unwrap_or_else(|| args.market.clone());
        obtainers.push(QuoteObtainer::fix(
            VenueConfig {
                host: fix_host.clone(),
                port: args.fix_port,
                market: fix_market,
                connect_timeout,
                max_reconnect_attempts: args.max_reconnect_attempts,
            },
            FixSessionConfig {
                sender_comp_id: args.fix_sender_comp_id.clone(),
                target_comp_id: args.fix_target_comp_id.clone(),
                ..FixSessionConfig::default()
            },
        ));
    }

    let consumer = QuoteConsumer::new(
        args.market.clone(),
        ConsumerConfig {
            publish_period: Duration::from_millis(args.publish_period_ms),
            publish_levels: args.publish_levels,
        },
    );
    for obtainer in obtainers.iter_mut() {
        consumer.add_obtainer(obtainer);
    }

    let view = Arc::new(BookView::new());
    consumer.attach_view(Arc::clone(&view));
    let reader = consumer
        .reader()
        .expect("view attached above, reader must exist");

    consumer.start();

    if !args.json {
        print_header();
    }

    let mut last_total_quotes = 0u64;
    loop {
        std::thread::sleep(Duration::from_secs(1));

        let snapshot = reader.read();
        let total_quotes: u64 = obtainers.iter().map(|o| o.stats().quotes_ingested).sum();
        let rate = total_quotes.saturating_sub(last_total_quotes);
        last_total_quotes = total_quotes;

        if args.json {
            println!("{}", serde_json::to_string(&snapshot)?);
        } else {
            print_line(&args.market, &snapshot, &obtainers, rate);
        }
    }
}

fn print_header() {
    println!(
        "{:<19} | {:<8} | {:>12} | {:>12} | {:>5} | {:>5} | {:>12} | {:>12} | {:>7}",
        "Time", "Market", "Best Bid", "Best Ask", "BDpth", "ADpth", "Peak Bid", "Peak Ask", "Quote/s"
    );
    println!("{}", "-".repeat(118));
}

fn print_line(market: &str, snapshot: &OrderBookSnapshot, obtainers: &[QuoteObtainer], rate: u64) {
    let fmt_px = |px: f64| {
        if px.is_nan() {
            "-".to_string()
        } else {
            format!("{px:.2}")
        }
    };
    let peak_bid = obtainers
        .iter()
        .filter_map(|o| o.peak_bid())
        .map(|q| q.price)
        .fold(f64::NAN, f64::max);
    let peak_ask = obtainers
        .iter()
        .filter_map(|o| o.peak_ask())
        .map(|q| q.price)
        .fold(f64::NAN, f64::min);

    println!(
        "{:<19} | {:<8} | {:>12} | {:>12} | {:>5} | {:>5} | {:>12} | {:>12} | {:>7}",
        chrono::Local::now().format("%F %T"),
        market,
        fmt_px(snapshot.best_bid),
        fmt_px(snapshot.best_ask),
        snapshot.bid_levels.len(),
        snapshot.ask_levels.len(),
        fmt_px(peak_bid),
        fmt_px(peak_ask),
        rate
    );
}
