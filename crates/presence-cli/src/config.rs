use anyhow::{Context, Result};
use presence_session::{EnrollmentOptions, FailurePolicy, HttpGateway, VerificationPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration: defaults, then the TOML file, then `PRESENCE_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the attendance backend, without a trailing slash.
    pub api_url: String,
    /// Bearer token sent with every request.
    pub api_token: Option<String>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Preferred V4L2 device path; otherwise a rear-facing or first device.
    pub camera_device: Option<String>,
    /// Number of samples in one enrollment profile.
    pub target_samples: usize,
    /// Auto-capture period during enrollment.
    pub auto_capture_ms: u64,
    /// Whether the attendance method requires a face match.
    pub face_required: bool,
    pub face_policy: FailurePolicy,
    /// Compute the descriptor locally and attach it to attendance payloads.
    pub analyze_on_device: bool,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let enrollment = EnrollmentOptions::default();
        let policy = VerificationPolicy::default();
        Self {
            api_url: "http://localhost:8000/api".to_string(),
            api_token: None,
            model_dir: presence_core::default_model_dir(),
            camera_device: None,
            target_samples: enrollment.target_count,
            auto_capture_ms: enrollment.interval.as_millis() as u64,
            face_required: policy.face_required,
            face_policy: policy.on_failure,
            analyze_on_device: policy.analyze_on_device,
            http_timeout_secs: 15,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location if that file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Overlay `PRESENCE_*` variables. Unparseable values keep the current setting.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("PRESENCE_API_URL") {
            self.api_url = url;
        }
        if let Some(token) = var("PRESENCE_API_TOKEN") {
            self.api_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(dir) = var("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(device) = var("PRESENCE_CAMERA_DEVICE") {
            self.camera_device = Some(device).filter(|d| !d.is_empty());
        }
        self.target_samples = env_parse(&var, "PRESENCE_TARGET_SAMPLES", self.target_samples);
        self.auto_capture_ms = env_parse(&var, "PRESENCE_AUTO_CAPTURE_MS", self.auto_capture_ms);
        self.face_required = env_flag(&var, "PRESENCE_FACE_REQUIRED", self.face_required);
        self.face_policy = env_parse(&var, "PRESENCE_FACE_POLICY", self.face_policy);
        self.analyze_on_device =
            env_flag(&var, "PRESENCE_ANALYZE_ON_DEVICE", self.analyze_on_device);
        self.http_timeout_secs =
            env_parse(&var, "PRESENCE_HTTP_TIMEOUT_SECS", self.http_timeout_secs);
    }

    pub fn enrollment_options(&self) -> EnrollmentOptions {
        EnrollmentOptions {
            target_count: self.target_samples.max(1),
            interval: Duration::from_millis(self.auto_capture_ms.max(100)),
            auto_capture: true,
        }
    }

    pub fn verification_policy(&self) -> VerificationPolicy {
        VerificationPolicy {
            face_required: self.face_required,
            on_failure: self.face_policy,
            analyze_on_device: self.analyze_on_device,
        }
    }

    pub fn gateway(&self) -> Result<HttpGateway> {
        Ok(HttpGateway::new(
            self.api_url.clone(),
            self.api_token.clone(),
            Duration::from_secs(self.http_timeout_secs),
        )?)
    }
}

/// `$XDG_CONFIG_HOME/presence/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("presence/config.toml")
}

fn env_parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    current: T,
) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}

fn env_flag(var: &impl Fn(&str) -> Option<String>, key: &str, current: bool) -> bool {
    var(key)
        .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(current)
}
