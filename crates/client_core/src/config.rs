use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use mls::GroupConfig;
use serde::Deserialize;
use storage::StorageOptions;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "engine.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    pub notification_deadline_secs: u64,
    pub transaction_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub reconcile_window_secs: u64,
    pub fallback_title: String,
    pub fallback_body: String,
    pub max_past_epochs: u64,
    pub out_of_order_tolerance: u64,
    pub maximum_forward_distance: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            notification_deadline_secs: 25,
            transaction_timeout_ms: 5_000,
            busy_timeout_ms: 3_000,
            reconcile_window_secs: 120,
            fallback_title: "New Message".into(),
            fallback_body: "You have a new encrypted message".into(),
            max_past_epochs: 5,
            out_of_order_tolerance: 10,
            maximum_forward_distance: 2000,
        }
    }
}

impl EngineSettings {
    pub fn notification_deadline(&self) -> Duration {
        Duration::from_secs(self.notification_deadline_secs)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Saturates at `TimeDelta::MAX` for values chrono cannot represent.
    pub fn reconcile_window(&self) -> chrono::TimeDelta {
        i64::try_from(self.reconcile_window_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    /// Group parameters for every group the engine creates or joins, clamped
    /// to what OpenMLS accepts.
    pub fn group_config(&self) -> GroupConfig {
        GroupConfig {
            max_past_epochs: usize::try_from(self.max_past_epochs).unwrap_or(usize::MAX),
            out_of_order_tolerance: u32::try_from(self.out_of_order_tolerance).unwrap_or(u32::MAX),
            maximum_forward_distance: u32::try_from(self.maximum_forward_distance)
                .unwrap_or(u32::MAX),
        }
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            ..StorageOptions::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    data_dir: Option<PathBuf>,
    notification_deadline_secs: Option<u64>,
    transaction_timeout_ms: Option<u64>,
    busy_timeout_ms: Option<u64>,
    reconcile_window_secs: Option<u64>,
    fallback_title: Option<String>,
    fallback_body: Option<String>,
    max_past_epochs: Option<u64>,
    out_of_order_tolerance: Option<u64>,
    maximum_forward_distance: Option<u64>,
}

/// Defaults, then `path` (or `engine.toml` in the working directory), then
/// `APP__*` environment variables.
pub fn load_settings(path: Option<&Path>) -> EngineSettings {
    let mut settings = EngineSettings::default();
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(e) => warn!("config: ignoring unreadable {}: {e}", path.display()),
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut EngineSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.data_dir {
        settings.data_dir = v;
    }
    if let Some(v) = file_cfg.notification_deadline_secs {
        settings.notification_deadline_secs = v;
    }
    if let Some(v) = file_cfg.transaction_timeout_ms {
        settings.transaction_timeout_ms = v;
    }
    if let Some(v) = file_cfg.busy_timeout_ms {
        settings.busy_timeout_ms = v;
    }
    if let Some(v) = file_cfg.reconcile_window_secs {
        settings.reconcile_window_secs = v;
    }
    if let Some(v) = file_cfg.fallback_title {
        settings.fallback_title = v;
    }
    if let Some(v) = file_cfg.fallback_body {
        settings.fallback_body = v;
    }
    if let Some(v) = file_cfg.max_past_epochs {
        settings.max_past_epochs = v;
    }
    if let Some(v) = file_cfg.out_of_order_tolerance {
        settings.out_of_order_tolerance = v;
    }
    if let Some(v) = file_cfg.maximum_forward_distance {
        settings.maximum_forward_distance = v;
    }
}

fn apply_env(settings: &mut EngineSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__DATA_DIR") {
        settings.data_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("APP__FALLBACK_TITLE") {
        settings.fallback_title = v;
    }
    if let Some(v) = lookup("APP__FALLBACK_BODY") {
        settings.fallback_body = v;
    }

    let numeric = [
        (
            "APP__NOTIFICATION_DEADLINE_SECS",
            &mut settings.notification_deadline_secs,
        ),
        (
            "APP__TRANSACTION_TIMEOUT_MS",
            &mut settings.transaction_timeout_ms,
        ),
        ("APP__BUSY_TIMEOUT_MS", &mut settings.busy_timeout_ms),
        (
            "APP__RECONCILE_WINDOW_SECS",
            &mut settings.reconcile_window_secs,
        ),
        ("APP__MAX_PAST_EPOCHS", &mut settings.max_past_epochs),
        (
            "APP__OUT_OF_ORDER_TOLERANCE",
            &mut settings.out_of_order_tolerance,
        ),
        (
            "APP__MAXIMUM_FORWARD_DISTANCE",
            &mut settings.maximum_forward_distance,
        ),
    ];
    for (key, slot) in numeric {
        if let Some(v) = lookup(key) {
            match v.parse::<u64>() {
                Ok(parsed) => *slot = parsed,
                Err(_) => warn!("config: ignoring {key}={v}, expected an unsigned integer"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            "data_dir = \"/var/lib/chat\"\nnotification_deadline_secs = 10\nfallback_title = \"Chat\"\n",
        )
        .expect("write config");

        let settings = load_settings(Some(&path));
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/chat"));
        assert_eq!(settings.notification_deadline(), Duration::from_secs(10));
        assert_eq!(settings.fallback_title, "Chat");
        assert_eq!(settings.fallback_body, EngineSettings::default().fallback_body);
    }

    #[test]
    fn env_overrides_win_and_bad_numbers_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("APP__BUSY_TIMEOUT_MS", "250"),
            ("APP__RECONCILE_WINDOW_SECS", "soon"),
            ("APP__FALLBACK_BODY", "Encrypted message"),
        ]);
        let mut settings = EngineSettings::default();
        apply_env(&mut settings, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.storage_options().busy_timeout, Duration::from_millis(250));
        assert_eq!(settings.reconcile_window_secs, 120);
        assert_eq!(settings.fallback_body, "Encrypted message");
    }

    #[test]
    fn reconcile_window_follows_settings_and_saturates() {
        let settings = EngineSettings {
            reconcile_window_secs: 30,
            ..EngineSettings::default()
        };
        assert_eq!(settings.reconcile_window(), chrono::TimeDelta::seconds(30));

        let huge = EngineSettings {
            reconcile_window_secs: u64::MAX,
            ..EngineSettings::default()
        };
        assert_eq!(huge.reconcile_window(), chrono::TimeDelta::MAX);

        let env: HashMap<&str, &str> =
            HashMap::from([("APP__RECONCILE_WINDOW_SECS", "9223372036854775807")]);
        let mut from_env = EngineSettings::default();
        apply_env(&mut from_env, |key| env.get(key).map(|v| v.to_string()));
        assert_eq!(from_env.reconcile_window(), chrono::TimeDelta::MAX);
    }

    #[test]
    fn group_config_defaults_overrides_and_clamping() {
        assert_eq!(EngineSettings::default().group_config(), GroupConfig::default());

        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("engine.toml");
        fs::write(&path, "max_past_epochs = 2\nout_of_order_tolerance = 4\n")
            .expect("write config");
        let mut settings = load_settings(Some(&path));
        let env: HashMap<&str, &str> =
            HashMap::from([("APP__MAXIMUM_FORWARD_DISTANCE", "99999999999")]);
        apply_env(&mut settings, |key| env.get(key).map(|v| v.to_string()));

        let config = settings.group_config();
        assert_eq!(config.max_past_epochs, 2);
        assert_eq!(config.out_of_order_tolerance, 4);
        assert_eq!(config.maximum_forward_distance, u32::MAX);
    }

    #[test]
    fn unreadable_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("engine.toml");
        fs::write(&path, "notification_deadline_secs = \"soon\"").expect("write config");

        let settings = load_settings(Some(&path));
        assert_eq!(settings.notification_deadline_secs, 25);
    }
}
