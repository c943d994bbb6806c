use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::providers::ProviderKind;

/// Configuration for Print Sentinel loaded from environment variables.
///
/// All values come from the environment to support containerized
/// deployments. `Config::from_lookup` takes any key lookup so the same
/// parsing can be driven from a map in tests.
#[derive(Debug, Clone)]
pub struct Config {
    /// Vision backend selection and credentials.
    pub provider: ProviderConfig,

    /// Timer, thresholds, retention and prompt settings.
    pub monitor: MonitorSettings,

    /// Which notification transports are enabled on emergency stop.
    pub notifications: NotificationSettings,

    /// HTTP URL returning a single JPEG frame.
    /// Environment variable: `SNAPSHOT_URL`
    pub snapshot_url: String,

    /// Moonraker API URL for printer telemetry and the cancel command.
    ///
    /// Only the standalone daemon needs it; hosts embedding the library
    /// provide their own print controller.
    /// Environment variable: `MOONRAKER_API_URL`
    pub moonraker_api_url: Option<String>,

    /// Directory holding `verdict_history.json` and `snapshots/`.
    /// Environment variable: `DATA_DIR`
    pub data_dir: PathBuf,

    /// Start a session automatically when a print starts.
    /// Environment variable: `AUTO_START`
    pub auto_start: bool,
}

/// Parameter bundle handed to a vision provider on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Base URL of the backend API. Defaults per provider; required for Azure.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Azure OpenAI deployment name.
    pub azure_deployment: String,
    /// Azure OpenAI `api-version` query parameter.
    pub azure_api_version: String,
}

impl ProviderConfig {
    /// Build a config for `kind` with that provider's default endpoint and model.
    pub fn for_kind(kind: ProviderKind, api_key: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: kind.default_endpoint().to_string(),
            api_key: api_key.into(),
            model: kind.default_model().to_string(),
            azure_deployment: constants::DEFAULT_AZURE_DEPLOYMENT.to_string(),
            azure_api_version: constants::DEFAULT_AZURE_API_VERSION.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Check that the credential and endpoint this provider needs are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind.requires_api_key() && self.api_key.trim().is_empty() {
            return Err(ConfigError::missing("VISION_API_KEY"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::missing("VISION_ENDPOINT"));
        }
        if self.kind == ProviderKind::AzureOpenAi && self.azure_deployment.trim().is_empty() {
            return Err(ConfigError::missing("AZURE_DEPLOYMENT"));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::missing("VISION_MODEL"));
        }
        Ok(())
    }
}

/// Boundaries between the early, mid and late prompt stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageBands {
    /// Layers at or below this count as early.
    pub early_layer_max: u32,
    /// With the layer unknown, progress below this counts as early.
    pub early_progress_max: f32,
    /// Progress above this counts as late.
    pub late_progress_min: f32,
}

impl Default for StageBands {
    fn default() -> Self {
        Self {
            early_layer_max: 5,
            early_progress_max: 5.0,
            late_progress_min: 80.0,
        }
    }
}

/// Settings that shape a monitoring session.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Delay between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Cycles are skipped while the known layer is below this.
    pub min_layer: u32,
    /// Consecutive FAIL verdicts that trigger the emergency stop (1..=10).
    pub strike_threshold: u32,
    /// Maximum number of history entries (and snapshot artifacts) kept.
    pub retention: usize,
    /// Used to estimate the layer from Z height.
    pub layer_height: f32,
    /// Verbatim prompt override; disables stage injection.
    pub custom_prompt: Option<String>,
    /// When false every verdict is recorded with zero cost.
    pub cost_tracking: bool,
    pub stage_bands: StageBands,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(constants::DEFAULT_INTERVAL_SECONDS),
            min_layer: constants::DEFAULT_MIN_LAYER,
            strike_threshold: constants::DEFAULT_STRIKE_THRESHOLD,
            retention: constants::DEFAULT_RETENTION,
            layer_height: constants::DEFAULT_LAYER_HEIGHT,
            custom_prompt: None,
            cost_tracking: true,
            stage_bands: StageBands::default(),
        }
    }
}

impl MonitorSettings {
    /// The interval actually used by the timer, never below the minimum.
    pub fn effective_interval(&self) -> Duration {
        self.interval
            .max(Duration::from_secs(constants::MIN_INTERVAL_SECONDS))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = constants::MIN_STRIKE_THRESHOLD..=constants::MAX_STRIKE_THRESHOLD;
        if !range.contains(&self.strike_threshold) {
            return Err(ConfigError::invalid(
                "FAIL_STRIKES",
                self.strike_threshold,
                "must be between 1 and 10",
            ));
        }
        if self.retention == 0 {
            return Err(ConfigError::invalid(
                "SNAPSHOT_RETENTION",
                self.retention,
                "must be at least 1",
            ));
        }
        if !(self.layer_height > 0.0) {
            return Err(ConfigError::invalid(
                "LAYER_HEIGHT",
                self.layer_height,
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Telegram bot credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

/// Notification transports. A transport is enabled when its settings are present.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationSettings {
    /// Host-native popup. Environment variable: `POPUP_ENABLED`
    pub popup: bool,
    /// Arbitrary JSON webhook. Environment variable: `WEBHOOK_URL`
    pub webhook_url: Option<String>,
    /// Discord webhook. Environment variable: `DISCORD_WEBHOOK`
    pub discord_webhook: Option<String>,
    /// Environment variables: `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID`
    pub telegram: Option<TelegramSettings>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            popup: true,
            webhook_url: None,
            discord_webhook: None,
            telegram: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a variable is present but cannot be parsed.
    /// Missing credentials are reported later by [`Config::validate`], so a
    /// daemon can come up and only refuse to start sessions.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// let config = print_sentinel::Config::from_env().expect("Failed to load configuration");
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let kind = match get("VISION_PROVIDER") {
            Some(name) => name
                .parse::<ProviderKind>()
                .map_err(|e| ConfigError::invalid("VISION_PROVIDER", &name, e))?,
            None => ProviderKind::OpenAi,
        };

        let azure_deployment = get("AZURE_DEPLOYMENT")
            .unwrap_or_else(|| constants::DEFAULT_AZURE_DEPLOYMENT.to_string());
        let default_model = match kind {
            ProviderKind::AzureOpenAi => azure_deployment.clone(),
            other => other.default_model().to_string(),
        };

        let provider = ProviderConfig {
            kind,
            endpoint: get("VISION_ENDPOINT").unwrap_or_else(|| kind.default_endpoint().to_string()),
            api_key: get("VISION_API_KEY").unwrap_or_default(),
            model: get("VISION_MODEL").unwrap_or(default_model),
            azure_deployment,
            azure_api_version: get("AZURE_API_VERSION")
                .unwrap_or_else(|| constants::DEFAULT_AZURE_API_VERSION.to_string()),
        };

        let interval_seconds: u64 = parse(&get, "INTERVAL_SECONDS", constants::DEFAULT_INTERVAL_SECONDS)?;
        let defaults = StageBands::default();
        let monitor = MonitorSettings {
            interval: Duration::from_secs(interval_seconds.max(constants::MIN_INTERVAL_SECONDS)),
            min_layer: parse(&get, "MIN_LAYER", constants::DEFAULT_MIN_LAYER)?,
            strike_threshold: parse(&get, "FAIL_STRIKES", constants::DEFAULT_STRIKE_THRESHOLD)?,
            retention: parse(&get, "SNAPSHOT_RETENTION", constants::DEFAULT_RETENTION)?,
            layer_height: parse(&get, "LAYER_HEIGHT", constants::DEFAULT_LAYER_HEIGHT)?,
            custom_prompt: lookup("CUSTOM_PROMPT").filter(|p| !p.trim().is_empty()),
            cost_tracking: parse(&get, "COST_TRACKING", true)?,
            stage_bands: StageBands {
                early_layer_max: parse(&get, "EARLY_LAYER_MAX", defaults.early_layer_max)?,
                early_progress_max: parse(&get, "EARLY_PROGRESS_MAX", defaults.early_progress_max)?,
                late_progress_min: parse(&get, "LATE_PROGRESS_MIN", defaults.late_progress_min)?,
            },
        };

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramSettings { bot_token, chat_id }),
            _ => None,
        };
        let notifications = NotificationSettings {
            popup: parse(&get, "POPUP_ENABLED", true)?,
            webhook_url: get("WEBHOOK_URL"),
            discord_webhook: get("DISCORD_WEBHOOK"),
            telegram,
        };

        Ok(Config {
            provider,
            monitor,
            notifications,
            snapshot_url: get("SNAPSHOT_URL")
                .unwrap_or_else(|| constants::DEFAULT_SNAPSHOT_URL.to_string()),
            moonraker_api_url: get("MOONRAKER_API_URL"),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".to_string())),
            auto_start: parse(&get, "AUTO_START", true)?,
        })
    }

    /// Check everything a session needs before it may enter monitoring.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider.validate()?;
        self.monitor.validate()?;
        if self.snapshot_url.trim().is_empty() {
            return Err(ConfigError::missing("SNAPSHOT_URL"));
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Default delay between monitoring cycles.
    pub const DEFAULT_INTERVAL_SECONDS: u64 = 60;

    /// Shortest permitted delay between monitoring cycles.
    pub const MIN_INTERVAL_SECONDS: u64 = 10;

    pub const DEFAULT_MIN_LAYER: u32 = 2;

    /// Consecutive failures before the print is cancelled.
    pub const DEFAULT_STRIKE_THRESHOLD: u32 = 3;
    pub const MIN_STRIKE_THRESHOLD: u32 = 1;
    pub const MAX_STRIKE_THRESHOLD: u32 = 10;

    /// History entries kept before the oldest are evicted.
    pub const DEFAULT_RETENTION: usize = 100;

    pub const DEFAULT_LAYER_HEIGHT: f32 = 0.2;

    /// Number of recent error messages kept in the monitor state.
    pub const MAX_STATE_ERRORS: usize = 10;

    /// Per-print session summaries kept.
    pub const MAX_SESSIONS: usize = 100;

    pub const DEFAULT_SNAPSHOT_URL: &str = "http://localhost:8080/?action=snapshot";

    pub const DEFAULT_AZURE_DEPLOYMENT: &str = "gpt-4o-mini";
    pub const DEFAULT_AZURE_API_VERSION: &str = "2025-01-01-preview";

    /// Snapshot fetch timeout.
    pub const SNAPSHOT_TIMEOUT_SECONDS: u64 = 10;

    /// Pause before the single snapshot retry.
    pub const SNAPSHOT_RETRY_DELAY_MILLIS: u64 = 500;

    /// Deadline for a hosted provider call.
    pub const PROVIDER_TIMEOUT_SECONDS: u64 = 30;

    /// Deadline for a local Ollama call; local models can be slow.
    pub const OLLAMA_TIMEOUT_SECONDS: u64 = 120;

    pub const NOTIFICATION_TIMEOUT_SECONDS: u64 = 15;

    /// Upper bound on the model's reply length.
    pub const MAX_OUTPUT_TOKENS: u32 = 150;

    /// How often the daemon polls Moonraker for print state.
    pub const PRINTER_POLL_SECONDS: u64 = 5;
}
