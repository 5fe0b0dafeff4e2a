use serde::Deserialize;

/// Top-level configuration settings for the engine.
///
/// Groups the activity runtime, logging and snapshot store settings.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Settings {
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
    pub persistence: PersistenceSettings,
}

/// Runtime settings handed to every activity through its context.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EngineSettings {
    /// Log an `activity.error` event that nothing listens to at error level.
    pub strict_errors: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Configuration for the sled snapshot store.
///
/// Snapshots older than `ttl_secs` are dropped on load and at most
/// `max_snapshots_per_key` are retained per key.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub path: String,
    pub ttl_secs: i64,
    pub max_snapshots_per_key: usize,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub engine: Option<PartialEngineSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialEngineSettings {
    pub strict_errors: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPersistenceSettings {
    pub path: Option<String>,
    pub ttl_secs: Option<i64>,
    pub max_snapshots_per_key: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            strict_errors: false,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            path: "popflow_db".to_string(),
            ttl_secs: 86_400,
            max_snapshots_per_key: 10,
        }
    }
}
