use crate::subscription::{Subscription, SubscriptionSet};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

/// Top-level settings loaded from edit-watchdog.toml.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub watchdog: WatchdogSettings,
    pub alert: AlertConfig,
    pub router: RouterConfig,
    pub reload: ReloadConfig,
}

/// The `[watchdog]` section as written on disk.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub countdown_secs: u64,
    pub terminal_use_threshold_secs: u64,
    pub recent_terminal_threshold_mins: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertBackend {
    /// Desktop notification plus platform sound.
    Desktop,
    /// Terminal bell on stderr.
    Bell,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub backend: AlertBackend,
    pub notification: bool,
    pub sound: bool,
    pub title: String,
    pub message: String,
    /// Overrides the platform's default alert sound (Linux and macOS).
    pub sound_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Glob patterns for documents that never count as code changes.
    pub exclude_patterns: Vec<String>,
    /// File name suffixes that count as source files.
    pub code_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub poll_interval_secs: u64,
}

/// Resolved, validated watchdog settings. Replaced wholesale, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub countdown_duration: Duration,
    /// Reserved; not read by any scheduling decision.
    pub terminal_use_threshold: Duration,
    /// Reserved; not read by any scheduling decision.
    pub recent_terminal_threshold: Duration,
}

// --- Default implementations ---

const DEFAULT_COUNTDOWN_SECS: u64 = 60;
const MAX_COUNTDOWN_SECS: u64 = 24 * 60 * 60;

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
            terminal_use_threshold_secs: 10,
            recent_terminal_threshold_mins: 1,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            backend: AlertBackend::Desktop,
            notification: true,
            sound: true,
            title: "AI code generation complete".to_string(),
            message: "No editing activity for a while. Time to review.".to_string(),
            sound_file: None,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: [
                "*/.git/*",
                "*/.github/*",
                "*/node_modules/*",
                "*/.vscode/*",
                "*/target/*",
                "*/dist/*",
                "*package-lock.json",
                "*.lock",
                "*.log",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            code_extensions: [
                ".js", ".ts", ".jsx", ".tsx", ".py", ".java", ".cpp", ".c", ".cs", ".php", ".rb",
                ".go", ".rs", ".swift", ".kt", ".scala", ".html", ".css", ".scss", ".less",
                ".vue", ".svelte", ".md", ".json", ".xml",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogSettings::default().resolve()
    }
}

impl WatchdogSettings {
    /// Validate and convert to the runtime snapshot.
    ///
    /// `countdown_secs` must lie in 1..=86400. Anything else is replaced with
    /// the default.
    pub fn resolve(&self) -> WatchdogConfig {
        let countdown_secs = if (1..=MAX_COUNTDOWN_SECS).contains(&self.countdown_secs) {
            self.countdown_secs
        } else {
            tracing::warn!(
                countdown_secs = self.countdown_secs,
                max = MAX_COUNTDOWN_SECS,
                default = DEFAULT_COUNTDOWN_SECS,
                "countdown_secs out of range, using default"
            );
            DEFAULT_COUNTDOWN_SECS
        };

        WatchdogConfig {
            enabled: self.enabled,
            countdown_duration: Duration::from_secs(countdown_secs),
            terminal_use_threshold: Duration::from_secs(self.terminal_use_threshold_secs),
            recent_terminal_threshold: Duration::from_secs(
                self.recent_terminal_threshold_mins.saturating_mul(60),
            ),
        }
    }
}

impl ReloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Default settings file written by `edit-watchdog init`.
pub const DEFAULT_SETTINGS: &str = "\
# edit-watchdog settings

[watchdog]
enabled = true
# Seconds without editing activity before the alert fires.
countdown_secs = 60

[alert]
# \"desktop\" (notification + sound) or \"bell\" (terminal bell only)
backend = \"desktop\"
notification = true
sound = true

[reload]
poll_interval_secs = 2
";

/// Errors from reading or writing the settings file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Serialize {
        source: toml::ser::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A section that must be a table holds some other value.
    Malformed {
        path: PathBuf,
        key: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ConfigError::Serialize { source } => {
                write!(f, "failed to serialize settings: {}", source)
            }
            ConfigError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            ConfigError::Malformed { path, key } => {
                write!(f, "{}: `{}` must be a table", path.display(), key)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize { source } => Some(source),
            ConfigError::Write { source, .. } => Some(source),
            ConfigError::Malformed { .. } => None,
        }
    }
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Write `contents` next to `path` and rename it into place.
fn write_atomic(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let write_err = |e: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents.as_bytes()).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Write the default settings file unless one exists. Returns true if written.
pub fn init_settings(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    write_atomic(path, DEFAULT_SETTINGS)?;
    Ok(true)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn lock_settings(settings: &Mutex<Settings>) -> std::sync::MutexGuard<'_, Settings> {
    settings.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-through access to the settings file with last-known-good fallback.
///
/// Every read goes back to disk. If the file cannot be read or parsed the
/// previous good settings are returned instead (the defaults, if nothing has
/// loaded yet), so a half-saved file never takes the watchdog down.
pub struct ConfigSource {
    path: PathBuf,
    last_good: Arc<Mutex<Settings>>,
    subscriptions: SubscriptionSet,
}

impl ConfigSource {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let source = Self {
            path,
            last_good: Arc::new(Mutex::new(Settings::default())),
            subscriptions: SubscriptionSet::new(),
        };
        source.settings();
        source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings, re-read from disk.
    pub fn settings(&self) -> Settings {
        read_with_fallback(&self.path, &self.last_good)
    }

    /// Current watchdog snapshot, re-read from disk.
    pub fn get_configuration(&self) -> WatchdogConfig {
        self.settings().watchdog.resolve()
    }

    /// Call `callback` with the fresh watchdog snapshot whenever the settings
    /// file's modification time changes. Polls every `interval`.
    pub fn on_configuration_changed<F>(&mut self, interval: Duration, callback: F)
    where
        F: Fn(WatchdogConfig) + Send + Sync + 'static,
    {
        let path = self.path.clone();
        let last_good = Arc::clone(&self.last_good);
        let mut last_seen = modified_time(&path);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = modified_time(&path);
                if current == last_seen {
                    continue;
                }
                last_seen = current;
                let settings = read_with_fallback(&path, &last_good);
                tracing::info!(path = %path.display(), "settings changed, reloading");
                callback(settings.watchdog.resolve());
            }
        });
        self.subscriptions
            .push(Subscription::from_task("config-reload", task));
    }

    /// Flip `[watchdog] enabled` in the persisted file, keeping every other key.
    /// Returns the new value.
    pub fn toggle_enabled(&self) -> Result<bool, ConfigError> {
        let mut table = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents
                .parse::<toml::Table>()
                .map_err(|e| ConfigError::Parse {
                    path: self.path.clone(),
                    source: e,
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let section = table
            .entry("watchdog")
            .or_insert(toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| ConfigError::Malformed {
                path: self.path.clone(),
                key: "watchdog".to_string(),
            })?;
        let current = section
            .get("enabled")
            .and_then(toml::Value::as_bool)
            .unwrap_or(WatchdogSettings::default().enabled);
        let enabled = !current;
        section.insert("enabled".to_string(), toml::Value::Boolean(enabled));

        let contents =
            toml::to_string_pretty(&table).map_err(|e| ConfigError::Serialize { source: e })?;
        write_atomic(&self.path, &contents)?;
        tracing::info!(enabled, path = %self.path.display(), "toggled watchdog");
        Ok(enabled)
    }

    pub fn dispose(&mut self) {
        self.subscriptions.dispose();
    }
}

fn read_with_fallback(path: &Path, last_good: &Mutex<Settings>) -> Settings {
    match load_settings(path) {
        Ok(settings) => {
            *lock_settings(last_good) = settings.clone();
            settings
        }
        Err(e) => {
            tracing::warn!(error = %e, "settings unavailable, using last known good");
            lock_settings(last_good).clone()
        }
    }
}
