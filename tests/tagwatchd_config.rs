use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use tagwatch::config::TagwatchConfig;
use tagwatch::BacklogPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TAGWATCH_CONFIG",
        "TAGWATCH_SOURCE_URL",
        "TAGWATCH_SOURCE_FPS",
        "TAGWATCH_READOUT_ADDR",
        "TAGWATCH_VIDEO_STDOUT",
        "TAGWATCH_VIDEO_HEIGHT",
        "TAGWATCH_DISPLAY",
        "TAGWATCH_HIGHLIGHTED",
        "TAGWATCH_UUID",
        "TAGWATCH_FRAME_STRIDE",
        "TAGWATCH_FRAME_IDS",
        "TAGWATCH_NEW_TAG_DIR",
        "TAGWATCH_RENEW_PERIOD_SECS",
        "TAGWATCH_MAX_WORKERS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "source": { "url": "stub://arena", "fps": 12, "width": 800, "height": 600 },
        "readout": { "addr": "tcp://127.0.0.1:4002" },
        "video": { "height": 300, "force_integer_scaling": true },
        "display": { "enabled": true, "highlighted": [3, 7], "overlay_shards": 2 },
        "process": {
            "uuid": "box-1",
            "frame_stride": 3,
            "frame_ids": [0],
            "new_tag_output_dir": "/var/lib/tagwatch",
            "new_tag_roi_size": 300,
            "image_renew_period_secs": 600,
            "max_workers": 4,
            "backlog_threshold": 2
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("TAGWATCH_CONFIG", file.path());
    std::env::set_var("TAGWATCH_SOURCE_FPS", "20");
    std::env::set_var("TAGWATCH_FRAME_IDS", "0,2");
    std::env::set_var("TAGWATCH_MAX_WORKERS", "6");

    let cfg = TagwatchConfig::load().expect("load config");

    assert_eq!(cfg.source.url, "stub://arena");
    assert_eq!(cfg.source.fps, 20);
    assert_eq!((cfg.source.width, cfg.source.height), (800, 600));
    assert_eq!(cfg.readout_addr.as_deref(), Some("tcp://127.0.0.1:4002"));
    assert!(cfg.display.enabled);
    assert_eq!(cfg.display.highlighted, vec![3, 7]);
    assert_eq!(cfg.process.frame_ids, vec![0, 2]);
    assert_eq!(cfg.process.max_workers, 6);

    let options = cfg.pipeline_options();
    assert_eq!(options.producer_uuid, "box-1");
    assert_eq!(options.frame_stride, 3);
    assert_eq!(
        options.new_tag_output_dir,
        Some(PathBuf::from("/var/lib/tagwatch"))
    );
    assert_eq!(options.new_tag_roi_size, 300);
    assert_eq!(options.image_renew_period, Duration::from_secs(600));
    assert_eq!(options.backlog, BacklogPolicy::DropWhenQueued { threshold: 2 });
    assert_eq!(options.working_height, 300);
    assert!(options.force_integer_scaling);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [source]
        url = "stub://bench"

        [process]
        backlog_threshold = 0
    "#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("TAGWATCH_CONFIG", file.path());

    let cfg = TagwatchConfig::load().expect("load config");
    assert_eq!(cfg.source.url, "stub://bench");
    assert_eq!(cfg.pipeline_options().backlog, BacklogPolicy::NeverDrop);

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("TAGWATCH_SOURCE_FPS", "fast");
    assert!(TagwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("TAGWATCH_READOUT_ADDR", "udp://host:1");
    assert!(TagwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("TAGWATCH_FRAME_STRIDE", "4");
    assert!(TagwatchConfig::load().is_err());
    clear_env();
}
