//! ice_history - Print recent license plate records and the bag total.
//!
//! Reads `license_plates/{date}` for the last N days from the configured
//! store. With `--follow`, keeps printing `total_count` as it changes until
//! Ctrl-C.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use ice_tracker::config::StoreKind;
use ice_tracker::history::{
    fetch_plate_history, read_total_count, summarize, watch_total_count, PlateRow,
};
use ice_tracker::runtime::build_store;
use ice_tracker::TrackerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Show stored license plates and bag counts")]
struct Args {
    /// JSON config file; only the store section is used.
    #[arg(long, env = "ICE_TRACKER_CONFIG")]
    config: Option<PathBuf>,

    /// Firebase Realtime Database URL (overrides the config).
    #[arg(long)]
    store_url: Option<String>,

    /// Number of days to show, counting today.
    #[arg(long, default_value_t = 7)]
    days: u32,

    /// Print rows as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Keep running and print every change to the bag total.
    #[arg(long)]
    follow: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.days == 0 {
        return Err(anyhow!("--days must be at least 1"));
    }

    let mut cfg = TrackerConfig::load_from(args.config.as_deref()).context("load config")?;
    if let Some(url) = args.store_url {
        cfg.store.url = Some(url);
        cfg.store.kind = StoreKind::Firebase;
    }
    if cfg.store.kind == StoreKind::Memory {
        return Err(anyhow!(
            "no store configured; pass --store-url or set ICE_STORE_URL"
        ));
    }
    let store = build_store(&cfg.store)?;

    let today = Local::now().date_naive();
    let rows = fetch_plate_history(store.as_ref(), today, args.days);
    let total = read_total_count(store.as_ref()).unwrap_or_else(|e| {
        log::warn!("reading total_count failed: {:#}", e);
        None
    });

    if args.json {
        let out = serde_json::json!({
            "rows": rows,
            "summary": summarize(&rows),
            "total_count": total,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_table(&rows);
        let summary = summarize(&rows);
        println!(
            "\n{} plates, {} bags attributed; total_count = {}",
            summary.plates,
            summary.bags,
            total.map_or_else(|| "-".to_string(), |t| t.to_string())
        );
    }

    if args.follow {
        let (tx, rx) = mpsc::channel();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .expect("error setting Ctrl-C handler");
        let subscription = watch_total_count(store.as_ref(), |total| {
            println!("total_count = {}", total);
        })?;
        log::info!("following total_count (Ctrl-C to stop)...");
        let _ = rx.recv();
        subscription.cancel();
    }
    Ok(())
}

fn print_table(rows: &[PlateRow]) {
    println!("{:<12} {:<16} {:>5}  {:<8}", "DATE", "PLATE", "BAGS", "TIME");
    for row in rows {
        println!(
            "{:<12} {:<16} {:>5}  {:<8}",
            row.date, row.plate, row.bag, row.timestamp
        );
    }
}
