use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use ice_tracker::config::{DetectorSettings, RecognizerSettings, StoreKind, TrackerConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ICE_TRACKER_CONFIG",
        "ICE_PLATE_SOURCE",
        "ICE_BAG_SOURCE",
        "ICE_STORE_URL",
        "ICE_STORE_AUTH",
        "ICE_COOLDOWN_MS",
        "ICE_SNAPSHOT_PATH",
        "ICE_HEADLESS",
        "ICE_PLATE_TEXTS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = TrackerConfig::load().expect("load defaults");
    assert!(cfg.plate.source.starts_with("stub://"));
    assert!(cfg.bags.source.starts_with("stub://"));
    assert_eq!(cfg.plate.cooldown, Duration::from_millis(1500));
    assert!((cfg.plate.confidence - 0.4).abs() < f32::EPSILON);
    assert!((cfg.bags.confidence - 0.25).abs() < f32::EPSILON);
    assert!((cfg.plate.resize_ratio - 0.7).abs() < f32::EPSILON);
    assert_eq!(
        cfg.bags.roi,
        vec![(494, 335), (451, 709), (590, 677), (630, 363)]
    );
    assert_eq!(cfg.store.kind, StoreKind::Memory);
    assert_eq!(cfg.writer.poll_interval, Duration::from_millis(500));
    assert_eq!(cfg.display.target_height, 480);
    assert_eq!(cfg.display.stop_key, 'q');
    assert!(!cfg.display.headless);

    clear_env();
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "plate": {
                "source": "/data/gate.mp4",
                "target_fps": 10,
                "confidence": 0.5,
                "cooldown_ms": 2000,
                "pattern": "^[0-9]{2}[A-Z]",
                "recognizer": { "kind": "http", "endpoint": "http://127.0.0.1:9000/ocr", "timeout_ms": 750 }
            },
            "bags": {
                "source": "/data/belt.mp4",
                "roi": [[0, 0], [100, 0], [100, 100], [0, 100]],
                "max_age": 4,
                "detector": { "kind": "brightness", "luma_threshold": 180, "min_pixels": 20 }
            },
            "store": { "url": "https://ice.example.app/", "auth": "file-secret" },
            "writer": { "poll_ms": 200, "drain_ms": 1000 },
            "display": { "target_height": 360, "stop_key": "x" },
            "shutdown": { "join_ms": 1500 }
        }"#,
    );

    std::env::set_var("ICE_TRACKER_CONFIG", file.path());
    std::env::set_var("ICE_BAG_SOURCE", "stub://belt?pattern=bags");
    std::env::set_var("ICE_STORE_AUTH", "env-secret");
    std::env::set_var("ICE_COOLDOWN_MS", "3000");
    std::env::set_var("ICE_HEADLESS", "true");

    let cfg = TrackerConfig::load().expect("load config");

    assert_eq!(cfg.plate.source, "/data/gate.mp4");
    assert_eq!(cfg.plate.target_fps, 10);
    assert_eq!(cfg.plate.cooldown, Duration::from_millis(3000));
    assert_eq!(cfg.plate.pattern.as_deref(), Some("^[0-9]{2}[A-Z]"));
    assert_eq!(
        cfg.plate.recognizer,
        RecognizerSettings::Http {
            endpoint: "http://127.0.0.1:9000/ocr".to_string(),
            timeout: Duration::from_millis(750),
        }
    );
    assert_eq!(cfg.bags.source, "stub://belt?pattern=bags");
    assert_eq!(cfg.bags.roi.len(), 4);
    assert_eq!(cfg.bags.max_age, 4);
    assert_eq!(
        cfg.bags.detector,
        DetectorSettings::Brightness {
            luma_threshold: 180,
            min_pixels: 20
        }
    );
    assert_eq!(cfg.store.kind, StoreKind::Firebase);
    assert_eq!(cfg.store.url.as_deref(), Some("https://ice.example.app/"));
    assert_eq!(cfg.store.auth.as_deref(), Some("env-secret"));
    assert_eq!(cfg.writer.poll_interval, Duration::from_millis(200));
    assert_eq!(cfg.writer.drain_timeout, Duration::from_millis(1000));
    assert_eq!(cfg.display.target_height, 360);
    assert_eq!(cfg.display.stop_key, 'x');
    assert!(cfg.display.headless);
    assert_eq!(cfg.shutdown_join, Duration::from_millis(1500));

    clear_env();
}

#[test]
fn plate_texts_env_switches_to_cycling_recognizer() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ICE_PLATE_TEXTS", "AAA-1, BBB-2,,");
    let cfg = TrackerConfig::load().expect("load config");
    assert_eq!(
        cfg.plate.recognizer,
        RecognizerSettings::Cycling(vec!["AAA-1".to_string(), "BBB-2".to_string()])
    );

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let short_roi = write_config(r#"{ "bags": { "roi": [[0, 0], [10, 10]] } }"#);
    std::env::set_var("ICE_TRACKER_CONFIG", short_roi.path());
    assert!(TrackerConfig::load().is_err());

    let bad_store = write_config(r#"{ "store": { "kind": "firebase" } }"#);
    std::env::set_var("ICE_TRACKER_CONFIG", bad_store.path());
    assert!(TrackerConfig::load().is_err());

    let bad_ratio = write_config(r#"{ "plate": { "resize_ratio": 0.0 } }"#);
    std::env::set_var("ICE_TRACKER_CONFIG", bad_ratio.path());
    assert!(TrackerConfig::load().is_err());

    let bad_pattern = write_config(r#"{ "plate": { "pattern": "([" } }"#);
    std::env::set_var("ICE_TRACKER_CONFIG", bad_pattern.path());
    assert!(TrackerConfig::load().is_err());

    let bad_detector = write_config(r#"{ "bags": { "detector": { "kind": "magic" } } }"#);
    std::env::set_var("ICE_TRACKER_CONFIG", bad_detector.path());
    assert!(TrackerConfig::load().is_err());

    clear_env();
    std::env::set_var("ICE_COOLDOWN_MS", "soon");
    assert!(TrackerConfig::load().is_err());

    clear_env();
    std::env::set_var("ICE_TRACKER_CONFIG", "/nonexistent/ice_tracker.json");
    assert!(TrackerConfig::load().is_err());

    clear_env();
}
