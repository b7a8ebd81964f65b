use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use vigil::config::VigilConfig;
use vigil::consumer::PathConvention;
use vigil::notify::StartTls;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VIGIL_CONFIG",
        "VIGIL_DB_PATH",
        "VIGIL_SNAPSHOT_DIR",
        "VIGIL_POLL_INTERVAL_MS",
        "VIGIL_API_ADDR",
        "VIGIL_BROKER",
        "VIGIL_CHANNEL",
        "VIGIL_MQTT_USERNAME",
        "VIGIL_MQTT_PASSWORD",
        "VIGIL_RECONNECT_DELAY_SECS",
        "VIGIL_SOURCES",
        "VIGIL_DETECTIONS",
        "VIGIL_CLASSES",
        "VIGIL_MIN_CONFIDENCE",
        "VIGIL_ALERT_CLASS",
        "VIGIL_ALERT_MIN_CONFIDENCE",
        "VIGIL_ALERT_COOLDOWN_SECS",
        "VIGIL_PATH_CONVENTION",
        "VIGIL_SMTP_SERVER",
        "VIGIL_SMTP_USERNAME",
        "VIGIL_SMTP_PASSWORD",
        "VIGIL_SMTP_FROM",
        "VIGIL_SMTP_TO",
        "VIGIL_SMTP_STARTTLS",
        "VIGIL_SMTP_TLS_CA_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = VigilConfig::load().expect("load defaults");

    assert_eq!(cfg.db_path, PathBuf::from("data/surveillance.db"));
    assert_eq!(cfg.snapshot_dir, PathBuf::from("data/snapshots"));
    assert_eq!(cfg.api_addr, "127.0.0.1:8008");
    assert_eq!(cfg.bus.channel, "surveillance_events");
    assert_eq!(cfg.bus.broker, "127.0.0.1:1883");
    assert_eq!(cfg.bus.reconnect_delay, Duration::from_secs(5));
    assert_eq!(cfg.bus.max_reconnect_attempts, None);
    assert_eq!(cfg.ingest.classes, vec!["person"]);
    assert_eq!(cfg.ingest.min_confidence, 0.8);
    assert_eq!(cfg.alert.class_name, "person");
    assert_eq!(cfg.alert.min_confidence, 0.8);
    assert_eq!(cfg.alert.cooldown, Duration::from_secs(30));
    assert_eq!(cfg.alert.dedup_capacity, 1000);
    assert_eq!(cfg.alert.path_convention, PathConvention::host());
    assert!(cfg.smtp.is_none());

    clear_env();
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "/var/lib/vigil/events.db",
        "bus": {
            "broker": "mqtts://broker.lan:8883",
            "channel": "yard_events",
            "max_reconnect_attempts": 3
        },
        "ingest": {
            "sources": ["data/videos/gate", "stub://porch?frames=5"],
            "classes": ["person", " car "],
            "min_confidence": 0.6
        },
        "alert": {
            "dedup_capacity": 50,
            "path_convention": "windows"
        },
        "smtp": {
            "server": "smtp.example.org:587",
            "from": "cams@example.org",
            "to": ["guard@example.org"]
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("VIGIL_CONFIG", file.path());
    std::env::set_var("VIGIL_CHANNEL", "night_events");
    std::env::set_var("VIGIL_ALERT_MIN_CONFIDENCE", "0.9");
    std::env::set_var("VIGIL_SMTP_TO", "a@example.org, b@example.org");

    let cfg = VigilConfig::load().expect("load config");

    assert_eq!(cfg.db_path, PathBuf::from("/var/lib/vigil/events.db"));
    assert_eq!(cfg.bus.broker, "mqtts://broker.lan:8883");
    assert_eq!(cfg.bus.channel, "night_events");
    assert_eq!(cfg.bus.max_reconnect_attempts, Some(3));
    assert_eq!(
        cfg.ingest.sources,
        vec!["data/videos/gate", "stub://porch?frames=5"]
    );
    assert_eq!(cfg.ingest.classes, vec!["person", "car"]);
    assert_eq!(cfg.ingest.min_confidence, 0.6);
    assert_eq!(cfg.alert.min_confidence, 0.9);
    assert_eq!(cfg.alert.dedup_capacity, 50);
    assert_eq!(cfg.alert.path_convention, PathConvention::Windows);
    let smtp = cfg.smtp.expect("smtp section");
    assert_eq!(smtp.server, "smtp.example.org:587");
    assert_eq!(smtp.to, vec!["a@example.org", "b@example.org"]);
    assert_eq!(smtp.starttls, StartTls::Required);
    assert!(!smtp.allow_plaintext_auth);

    let mqtt = cfg.bus.mqtt_settings("vigil-test").expect("mqtt settings");
    assert!(mqtt.endpoint.uses_tls());
    assert_eq!(mqtt.endpoint.port, 8883);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
snapshot_dir = "/srv/snapshots"
poll_interval_ms = 25

[alert]
cooldown_secs = 120
path_convention = "wsl"

[api]
addr = "0.0.0.0:9100"
"#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("VIGIL_CONFIG", file.path());

    let cfg = VigilConfig::load().expect("load toml config");

    assert_eq!(cfg.snapshot_dir, PathBuf::from("/srv/snapshots"));
    assert_eq!(cfg.poll_interval, Duration::from_millis(25));
    assert_eq!(cfg.alert.cooldown, Duration::from_secs(120));
    assert_eq!(cfg.alert.path_convention, PathConvention::Wsl);
    assert_eq!(cfg.api_addr, "0.0.0.0:9100");

    clear_env();
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_MIN_CONFIDENCE", "1.5");
    assert!(VigilConfig::load().is_err());
    clear_env();

    std::env::set_var("VIGIL_MIN_CONFIDENCE", "high");
    assert!(VigilConfig::load().is_err());
    clear_env();

    std::env::set_var("VIGIL_PATH_CONVENTION", "amiga");
    assert!(VigilConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"alert": {"dedup_capacity": 0}}"#)
        .expect("write config");
    std::env::set_var("VIGIL_CONFIG", file.path());
    assert!(VigilConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"smtp": {"server": "mail:25", "from": "x@y"}}"#)
        .expect("write config");
    std::env::set_var("VIGIL_CONFIG", file.path());
    assert!(VigilConfig::load().is_err(), "smtp without recipients");
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"smtp": {"from": "x@y", "to": ["z@y"]}}"#)
        .expect("write config");
    std::env::set_var("VIGIL_CONFIG", file.path());
    let err = VigilConfig::load().expect_err("smtp without server");
    assert!(err.to_string().contains("server"), "{}", err);
    clear_env();

    std::env::set_var("VIGIL_SMTP_SERVER", "mail:587");
    std::env::set_var("VIGIL_SMTP_FROM", "x@y");
    std::env::set_var("VIGIL_SMTP_TO", "z@y");
    std::env::set_var("VIGIL_SMTP_STARTTLS", "sometimes");
    assert!(VigilConfig::load().is_err());
    clear_env();
}

#[test]
fn smtp_tls_settings_reach_the_mailer() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut ca = NamedTempFile::new().expect("ca file");
    ca.write_all(b"-----BEGIN CERTIFICATE-----\n").expect("write ca");
    let mut file = NamedTempFile::new().expect("temp config");
    let json = format!(
        r#"{{"smtp": {{
            "server": "smtp.lan:25",
            "from": "cams@lan",
            "to": ["guard@lan"],
            "starttls": "opportunistic",
            "allow_plaintext_auth": true,
            "tls_ca_path": {:?}
        }}}}"#,
        ca.path().to_string_lossy()
    );
    file.write_all(json.as_bytes()).expect("write config");
    std::env::set_var("VIGIL_CONFIG", file.path());

    let cfg = VigilConfig::load().expect("load config");
    let smtp = cfg.smtp.expect("smtp section");
    assert_eq!(smtp.starttls, StartTls::Opportunistic);
    let settings = smtp.mailer_settings().expect("mailer settings");
    assert_eq!(settings.starttls, StartTls::Opportunistic);
    assert!(settings.allow_plaintext_auth);
    assert_eq!(
        settings.tls_ca.as_deref(),
        Some(&b"-----BEGIN CERTIFICATE-----\n"[..])
    );

    std::env::set_var("VIGIL_SMTP_STARTTLS", "off");
    std::env::set_var("VIGIL_SMTP_TLS_CA_PATH", "/nonexistent/ca.pem");
    let cfg = VigilConfig::load().expect("load config");
    let smtp = cfg.smtp.expect("smtp section");
    assert_eq!(smtp.starttls, StartTls::Disabled);
    assert!(smtp.mailer_settings().is_err());

    clear_env();
}

#[test]
fn detection_script_per_source_from_directory() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("tempdir");
    std::env::set_var("VIGIL_DETECTIONS", dir.path());
    let cfg = VigilConfig::load().expect("load config");
    assert_eq!(
        cfg.ingest.detections_for("data/videos/video2"),
        Some(dir.path().join("video2.jsonl"))
    );
    assert_eq!(
        cfg.ingest.detections_for("stub://porch?frames=2"),
        Some(dir.path().join("porch.jsonl"))
    );

    let file = NamedTempFile::new().expect("script file");
    std::env::set_var("VIGIL_DETECTIONS", file.path());
    let cfg = VigilConfig::load().expect("load config");
    assert_eq!(
        cfg.ingest.detections_for("data/videos/anything"),
        Some(file.path().to_path_buf())
    );

    clear_env();
}
