use anyhow::{anyhow, bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::detection::{AgentState, ArbiterConfig};

pub const CONFIG_ENV: &str = "AGENTWATCH_CONFIG";
pub const DEBUG_ENV: &str = "AGENTWATCH_DEBUG";
const DEFAULT_CONFIG_FILE: &str = "agentwatch.json";
/// Upper bound for every `*_secs` setting (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRepeatSettings {
    pub idle_secs: u64,
    pub run_command_secs: u64,
}

impl Default for AlertRepeatSettings {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            run_command_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextSignalSettings {
    pub enabled: bool,
    pub idle_keywords: Vec<String>,
}

impl Default for TextSignalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_keywords: vec![
                "do you want to proceed".into(),
                "waiting for input".into(),
                "press enter".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub confidence_threshold: f64,
    pub min_confidence_gap: f64,
    pub required_confirmations: usize,
    pub history_window_secs: u64,
    pub min_state_change_interval_secs: u64,
    pub min_notification_interval_secs: u64,
    pub check_interval_secs: u64,
    pub cycle_timeout_secs: u64,
    pub alert_repeat: AlertRepeatSettings,
    /// State name (`idle`, `active`, `run_command`) to reference image directory.
    pub reference_dirs: BTreeMap<String, PathBuf>,
    pub pyramid_levels: usize,
    pub capture_path: PathBuf,
    pub db_path: PathBuf,
    pub muted: bool,
    pub text_signal: TextSignalSettings,
    pub event_retention_days: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let reference_dirs = [
            ("idle", "references/idle"),
            ("active", "references/active"),
            ("run_command", "references/run_command"),
        ]
        .into_iter()
        .map(|(state, dir)| (state.to_string(), PathBuf::from(dir)))
        .collect();

        Self {
            confidence_threshold: 0.8,
            min_confidence_gap: 0.1,
            required_confirmations: 2,
            history_window_secs: 10,
            min_state_change_interval_secs: 3,
            min_notification_interval_secs: 30,
            check_interval_secs: 2,
            cycle_timeout_secs: 10,
            alert_repeat: AlertRepeatSettings::default(),
            reference_dirs,
            pyramid_levels: 3,
            capture_path: PathBuf::from("capture/latest.png"),
            db_path: PathBuf::from("data/agentwatch.db"),
            muted: false,
            text_signal: TextSignalSettings::default(),
            event_retention_days: 30,
        }
    }
}

impl MonitorSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.min_confidence_gap) {
            bail!(
                "min_confidence_gap must be within [0, 1], got {}",
                self.min_confidence_gap
            );
        }
        if self.required_confirmations == 0 {
            bail!("required_confirmations must be at least 1");
        }
        if self.check_interval_secs == 0 {
            bail!("check_interval_secs must be at least 1");
        }
        if self.cycle_timeout_secs == 0 {
            bail!("cycle_timeout_secs must be at least 1");
        }
        for (name, secs) in [
            ("history_window_secs", self.history_window_secs),
            ("min_state_change_interval_secs", self.min_state_change_interval_secs),
            ("min_notification_interval_secs", self.min_notification_interval_secs),
            ("check_interval_secs", self.check_interval_secs),
            ("cycle_timeout_secs", self.cycle_timeout_secs),
            ("alert_repeat.idle_secs", self.alert_repeat.idle_secs),
            ("alert_repeat.run_command_secs", self.alert_repeat.run_command_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                bail!("{name} must be at most {MAX_INTERVAL_SECS}, got {secs}");
            }
        }
        // The window must still hold the oldest confirmation when the last
        // one arrives, otherwise nothing can ever be confirmed.
        let confirmation_span = (self.required_confirmations as u64 - 1)
            .saturating_mul(self.check_interval_secs);
        if self.history_window_secs < confirmation_span {
            bail!(
                "history_window_secs ({}) is shorter than {} confirmations {}s apart ({}s)",
                self.history_window_secs,
                self.required_confirmations,
                self.check_interval_secs,
                confirmation_span
            );
        }
        for name in self.reference_dirs.keys() {
            match name.parse::<AgentState>() {
                Ok(AgentState::Unknown) | Err(_) => {
                    bail!("reference_dirs has unsupported state '{name}'")
                }
                Ok(_) => {}
            }
        }
        Ok(())
    }

    pub fn arbiter(&self) -> ArbiterConfig {
        ArbiterConfig {
            threshold: self.confidence_threshold,
            min_gap: self.min_confidence_gap,
        }
    }

    pub fn history_window(&self) -> Duration {
        Duration::seconds(self.history_window_secs as i64)
    }

    pub fn min_state_change_interval(&self) -> Duration {
        Duration::seconds(self.min_state_change_interval_secs as i64)
    }

    pub fn min_notification_interval(&self) -> Duration {
        Duration::seconds(self.min_notification_interval_secs as i64)
    }

    /// Repeat-alert period for a state, if it alerts at all.
    pub fn alert_repeat_interval(&self, state: AgentState) -> Option<Duration> {
        let secs = match state {
            AgentState::Idle => self.alert_repeat.idle_secs,
            AgentState::RunCommand => self.alert_repeat.run_command_secs,
            AgentState::Active | AgentState::Unknown => return None,
        };
        (secs > 0).then(|| Duration::seconds(secs as i64))
    }
}

/// Settings file location: `AGENTWATCH_CONFIG`, else `agentwatch.json`.
pub fn default_settings_path() -> PathBuf {
    env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

pub fn debug_enabled() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<MonitorSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            MonitorSettings::default()
        };
        data.validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn current(&self) -> Result<MonitorSettings> {
        Ok(self.read()?.clone())
    }

    /// Applies `change`, validates the result and writes it to disk.
    /// Nothing is stored if validation fails.
    pub fn update<F>(&self, change: F) -> Result<MonitorSettings>
    where
        F: FnOnce(&mut MonitorSettings),
    {
        let mut guard = self.write()?;
        let mut next = guard.clone();
        change(&mut next);
        next.validate()?;
        self.persist(&next)?;
        *guard = next.clone();
        Ok(next)
    }

    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.update(|settings| settings.muted = muted).map(|_| ())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: MonitorSettings = serde_json::from_str(&contents)?;
        data.validate()?;
        *self.write()? = data;
        Ok(())
    }

    fn persist(&self, data: &MonitorSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MonitorSettings>> {
        self.data
            .read()
            .map_err(|_| anyhow!("settings lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MonitorSettings>> {
        self.data
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))
    }
}
