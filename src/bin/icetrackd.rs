//! icetrackd - Ice Tracker daemon
//!
//! Runs both camera streams until the stop key or Ctrl-C:
//! 1. Plate stream: detect plates, read them under a cooldown, log new ones
//! 2. Bag stream: track bags and count each one entering the ROI
//! 3. Display: side-by-side composite of the latest annotated frames
//! 4. Write worker: pushes plate records and the running total to the store

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use ice_tracker::config::StoreKind;
use ice_tracker::{Runtime, RuntimeParts, StopSignal, TrackerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Count ice bags and log license plates")]
struct Args {
    /// JSON config file. `ICE_*` environment variables override its values.
    #[arg(long, env = "ICE_TRACKER_CONFIG")]
    config: Option<PathBuf>,

    /// Plate camera: local video file or stub:// scene.
    #[arg(long)]
    plate_source: Option<String>,

    /// Bag camera: local video file or stub:// scene.
    #[arg(long)]
    bag_source: Option<String>,

    /// Firebase Realtime Database URL. Without one, records stay in memory.
    #[arg(long)]
    store_url: Option<String>,

    /// Write the composite view to this image file.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Do not read the stop key from stdin; stop with Ctrl-C only.
    #[arg(long)]
    headless: bool,

    /// Stop on our own once both streams have ended.
    #[arg(long)]
    exit_on_end: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = TrackerConfig::load_from(args.config.as_deref()).context("load config")?;
    if let Some(source) = args.plate_source {
        cfg.plate.source = source;
    }
    if let Some(source) = args.bag_source {
        cfg.bags.source = source;
    }
    if let Some(url) = args.store_url {
        cfg.store.url = Some(url);
        cfg.store.kind = StoreKind::Firebase;
    }
    if let Some(path) = args.snapshot {
        cfg.display.snapshot_path = Some(path);
    }
    if args.headless {
        cfg.display.headless = true;
    }

    log::info!(
        "icetrackd {}: plate={} bags={} store={:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.plate.source,
        cfg.bags.source,
        cfg.store.kind
    );

    let stop = StopSignal::new();
    let ctrlc_stop = stop.clone();
    ctrlc::set_handler(move || {
        if ctrlc_stop.trigger() {
            log::info!("shutdown signal received");
        }
    })
    .expect("error setting Ctrl-C handler");

    let parts = RuntimeParts::from_config(&cfg)?;
    let handle = Runtime::launch(parts, stop.clone())?;

    if args.exit_on_end {
        while !handle.wait_for_stop_timeout(Duration::from_millis(250)) {
            if handle.streams_finished() {
                log::info!("both streams ended");
                stop.trigger();
            }
        }
    } else {
        handle.wait_for_stop();
    }

    let report = handle.shutdown(cfg.shutdown_join, cfg.writer.drain_timeout);
    for stream in [&report.plate, &report.bags].into_iter().flatten() {
        log::info!(
            "{}: {:?}, {} frames read, {} dropped",
            stream.name,
            stream.exit,
            stream.frames_read,
            stream.frames_dropped
        );
    }
    if let Some(display) = &report.display {
        log::info!("display: {} composites rendered", display.rendered);
    }
    if !report.all_joined() {
        log::warn!("some threads did not stop in time and were abandoned");
    }
    Ok(())
}
