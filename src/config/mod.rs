mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{EngineSettings, LoggingSettings, PersistenceSettings, Settings};

/// Loads the configuration from `config/default.toml` and `POPFLOW__*`
/// environment variables, then fills whatever is missing from the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPFLOW")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial))
}

fn merge(partial: PartialSettings) -> Settings {
    let default = Settings::default();

    let engine = partial.engine.as_ref();
    let logging = partial.logging.as_ref();
    let persistence = partial.persistence.as_ref();

    Settings {
        engine: EngineSettings {
            strict_errors: engine
                .and_then(|e| e.strict_errors)
                .unwrap_or(default.engine.strict_errors),
        },
        logging: LoggingSettings {
            level: logging
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
        persistence: PersistenceSettings {
            path: persistence
                .and_then(|p| p.path.clone())
                .unwrap_or(default.persistence.path),
            ttl_secs: persistence
                .and_then(|p| p.ttl_secs)
                .unwrap_or(default.persistence.ttl_secs),
            max_snapshots_per_key: persistence
                .and_then(|p| p.max_snapshots_per_key)
                .unwrap_or(default.persistence.max_snapshots_per_key),
        },
    }
}

#[cfg(test)]
mod tests;
