use std::io::Write;
use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use stenosis_screen::config::ScreeningConfig;
use stenosis_screen::Severity;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "STENOSIS_CONFIG",
        "STENOSIS_API_ADDR",
        "STENOSIS_SESSION_TTL_SECS",
        "STENOSIS_DETECTOR",
        "STENOSIS_MODEL_PATH",
        "STENOSIS_DETECTIONS_FIXTURE",
        "STENOSIS_CM_PER_PX",
        "STENOSIS_MODERATE_ABOVE_CM3",
        "STENOSIS_SEVERE_ABOVE_CM3",
        "STENOSIS_LLM_BASE_URL",
        "STENOSIS_LLM_MODEL",
        "STENOSIS_LLM_TIMEOUT_SECS",
        "STENOSIS_FALLBACK_DIR",
        "STENOSIS_FONT_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ScreeningConfig::load().expect("load defaults");
    assert_eq!(cfg.api.addr, "127.0.0.1:8790");
    assert_eq!(cfg.api.session_ttl.as_secs(), 86400);
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.cm_per_px, 0.1);
    assert_eq!(cfg.detector.confidence_threshold, 0.25);
    assert_eq!(cfg.detector.iou_threshold, 0.7);
    assert_eq!(cfg.llm.base_url, "https://api.groq.com/openai/v1");
    assert_eq!(cfg.llm.model, "llama-3.1-8b-instant");
    assert_eq!(cfg.llm.timeout.as_secs(), 30);
    assert_eq!(cfg.llm.api_key_env, "GROQ_API_KEY");
    assert!(cfg.fallback_dir.is_none());
    assert!(cfg.annotation.enabled);

    let thresholds = cfg.thresholds().unwrap();
    assert_eq!(thresholds.bucket(1.0), Severity::Moderate);
    assert_eq!(thresholds.bucket(1.01), Severity::Severe);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "127.0.0.1:9100", "session_ttl_secs": 600 },
        "detector": { "backend": "stub", "fixture_path": "fixtures/two_boxes.json" },
        "calibration": { "cm_per_px": 0.05 },
        "severity": { "moderate_above_cm3": 2.0, "severe_above_cm3": 8.0 },
        "llm": { "model": "llama-3.3-70b-versatile", "timeout_secs": 10 },
        "annotation": { "enabled": false }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("STENOSIS_CONFIG", file.path());
    std::env::set_var("STENOSIS_CM_PER_PX", "0.02");
    std::env::set_var("STENOSIS_LLM_TIMEOUT_SECS", "5");

    let cfg = ScreeningConfig::load().expect("load config");
    assert_eq!(cfg.api.addr, "127.0.0.1:9100");
    assert_eq!(cfg.api.session_ttl.as_secs(), 600);
    assert_eq!(
        cfg.detector.fixture_path.as_deref(),
        Some(std::path::Path::new("fixtures/two_boxes.json"))
    );
    assert_eq!(cfg.cm_per_px, 0.02);
    assert_eq!(cfg.moderate_above_cm3, 2.0);
    assert_eq!(cfg.severe_above_cm3, 8.0);
    assert_eq!(cfg.llm.model, "llama-3.3-70b-versatile");
    assert_eq!(cfg.llm.timeout.as_secs(), 5);
    assert!(!cfg.annotation.enabled);

    clear_env();
}

#[test]
fn severity_thresholds_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("STENOSIS_MODERATE_ABOVE_CM3", "5");
    std::env::set_var("STENOSIS_SEVERE_ABOVE_CM3", "50");
    let cfg = ScreeningConfig::load().expect("load config");
    assert_eq!(cfg.moderate_above_cm3, 5.0);
    assert_eq!(cfg.severe_above_cm3, 50.0);
    let thresholds = cfg.thresholds().unwrap();
    assert_eq!(thresholds.bucket(4.0), Severity::Mild);
    assert_eq!(thresholds.bucket(20.0), Severity::Moderate);
    assert_eq!(thresholds.bucket(90.0), Severity::Severe);
    clear_env();

    std::env::set_var("STENOSIS_SEVERE_ABOVE_CM3", "0.2");
    assert!(ScreeningConfig::load().is_err());
    clear_env();

    std::env::set_var("STENOSIS_MODERATE_ABOVE_CM3", "low");
    assert!(ScreeningConfig::load().is_err());
    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
[api]
addr = "127.0.0.1:9200"

[detector]
backend = "STUB"

[llm]
base_url = "http://127.0.0.1:11434/v1"
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = ScreeningConfig::load_from(file.path()).expect("load toml");
    assert_eq!(cfg.api.addr, "127.0.0.1:9200");
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.llm.base_url, "http://127.0.0.1:11434/v1");
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("STENOSIS_CM_PER_PX", "0");
    assert!(ScreeningConfig::load().is_err());
    clear_env();

    std::env::set_var("STENOSIS_CM_PER_PX", "wide");
    assert!(ScreeningConfig::load().is_err());
    clear_env();

    std::env::set_var("STENOSIS_DETECTOR", "tract");
    let err = ScreeningConfig::load().unwrap_err();
    assert!(err.to_string().contains("model_path"));
    clear_env();

    std::env::set_var("STENOSIS_DETECTOR", "opencv");
    assert!(ScreeningConfig::load().is_err());
    clear_env();

    std::env::set_var("STENOSIS_LLM_TIMEOUT_SECS", "0");
    assert!(ScreeningConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "severity": { "moderate_above_cm3": 3.0, "severe_above_cm3": 1.0 } }"#)
        .expect("write config");
    assert!(ScreeningConfig::load_from(file.path()).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ not json").expect("write config");
    assert!(ScreeningConfig::load_from(file.path()).is_err());
}
