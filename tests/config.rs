use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use ppe_sentinel::config::SentinelConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PPE_CONFIG",
        "THING_NAME",
        "RTSP_URL",
        "USE_SIMULATION",
        "RECONNECT_DELAY_SECS",
        "MODEL_PATH",
        "CONF_THRESHOLD",
        "NMS_THRESHOLD",
        "ALERT_COOLDOWN_SECS",
        "STATUS_INTERVAL_SECS",
        "MQTT_BROKER_ADDR",
        "MQTT_CLIENT_ID",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
        "EVIDENCE_DIR",
        "EVIDENCE_URL",
        "EVIDENCE_LABEL_FONT",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "device_id": "site-a-cam-2",
            "source": {
                "url": "rtsp://10.0.0.5/stream1",
                "use_simulation": false,
                "queue_capacity": 4,
                "reconnect_delay_secs": 3
            },
            "detector": {
                "model_path": "/opt/models/ppe.onnx",
                "conf_threshold": 0.6
            },
            "alerts": {
                "cooldown_secs": 45
            },
            "mqtt": {
                "broker_addr": "mqtts://broker.local:8883"
            }
        }"#,
    );

    std::env::set_var("PPE_CONFIG", file.path());
    std::env::set_var("CONF_THRESHOLD", "0.7");
    std::env::set_var("ALERT_COOLDOWN_SECS", "10");
    std::env::set_var("MQTT_USERNAME", "sentinel");

    let cfg = SentinelConfig::load().expect("load config");
    assert_eq!(cfg.device_id, "site-a-cam-2");
    assert_eq!(cfg.source.url.as_deref(), Some("rtsp://10.0.0.5/stream1"));
    assert!(!cfg.simulated_source());
    assert!(!cfg.detector.use_simulation);
    assert_eq!(cfg.source.queue_capacity, 4);
    assert_eq!(cfg.source.reconnect_delay, Duration::from_secs(3));
    assert_eq!(
        cfg.detector.model_path.as_deref(),
        Some(std::path::Path::new("/opt/models/ppe.onnx"))
    );
    assert_eq!(cfg.detector.conf_threshold, 0.7);
    assert_eq!(cfg.alerts.cooldown, Duration::from_secs(10));
    assert_eq!(cfg.alerts.status_interval, Duration::from_secs(60));

    let mqtt = cfg.mqtt_settings().expect("mqtt configured");
    assert_eq!(mqtt.broker_addr, "mqtts://broker.local:8883");
    assert_eq!(mqtt.client_id, "site-a-cam-2");
    assert_eq!(mqtt.username.as_deref(), Some("sentinel"));

    clear_env();
}

#[test]
fn loads_toml_config_from_explicit_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
device_id = "yard-1"

[source]
sim_width = 320
sim_height = 240
frame_timeout_ms = 250

[alerts]
status_interval_secs = 15
log_interval_frames = 0

[evidence]
dir = "/var/lib/ppe-sentinel/evidence"
jpeg_quality = 70
label_font = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"
"#,
    );

    let cfg = SentinelConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.device_id, "yard-1");
    assert!(cfg.simulated_source());
    assert_eq!((cfg.source.sim_width, cfg.source.sim_height), (320, 240));
    assert_eq!(cfg.frame_timeout, Duration::from_millis(250));
    assert_eq!(cfg.alerts.status_interval, Duration::from_secs(15));
    assert_eq!(cfg.alerts.log_interval_frames, 0);
    assert_eq!(cfg.evidence.jpeg_quality, 70);
    assert!(cfg.evidence.dir.is_some());
    assert_eq!(
        cfg.evidence.label_font.as_deref(),
        Some(std::path::Path::new("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"))
    );
}

#[test]
fn env_only_configuration() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("THING_NAME", "orangepi5-core-007");
    std::env::set_var("RTSP_URL", "rtsp://cam.local/live");
    std::env::set_var("USE_SIMULATION", "false");
    std::env::set_var("RECONNECT_DELAY_SECS", "2");

    let cfg = SentinelConfig::load().expect("load config");
    assert_eq!(cfg.device_id, "orangepi5-core-007");
    assert!(!cfg.simulated_source());
    assert_eq!(cfg.source.reconnect_delay, Duration::from_secs(2));
    assert!(cfg.mqtt_settings().is_none());

    clear_env();
}

#[test]
fn rejects_unknown_fields_and_bad_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let unknown = write_config(".json", r#"{ "detector": { "threshold": 0.5 } }"#);
    assert!(SentinelConfig::load_from(Some(unknown.path())).is_err());

    let impossible = write_config(".json", r#"{ "detector": { "conf_threshold": 1.5 } }"#);
    assert!(SentinelConfig::load_from(Some(impossible.path())).is_err());

    std::env::set_var("USE_SIMULATION", "sometimes");
    assert!(SentinelConfig::load().is_err());
    clear_env();

    std::env::set_var("ALERT_COOLDOWN_SECS", "soon");
    assert!(SentinelConfig::load().is_err());
    clear_env();

    std::env::set_var("THING_NAME", "site/#");
    assert!(SentinelConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let missing = std::path::Path::new("/nonexistent/ppe-sentinel.toml");
    assert!(SentinelConfig::load_from(Some(missing)).is_err());
}
