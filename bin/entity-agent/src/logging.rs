use entity_config::GenericConfiguration;
use entity_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_false() -> bool {
    false
}

#[derive(Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    #[serde(default = "default_false")]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(EnvFilter);

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes console logging.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error is returned.
pub fn initialize_logging(config: LoggingConfiguration) -> Result<(), GenericError> {
    let formatting_layer = if config.log_format_json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(formatting_layer.with_filter(config.log_level.0))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use entity_config::ConfigurationLoader;
    use serde_json::json;

    use super::*;

    fn load(values: serde_json::Value) -> Result<LoggingConfiguration, GenericError> {
        let config = ConfigurationLoader::default().add_static_values(values).into_generic();
        LoggingConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults() {
        let config = load(json!({})).unwrap();
        assert!(!config.log_format_json);
        assert_eq!(config.log_level.0.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn directives() {
        let config = load(json!({ "log_level": "debug,entity_store=trace", "log_format_json": true })).unwrap();
        assert!(config.log_format_json);
        assert_eq!(config.log_level.0.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn empty_level_is_rejected() {
        assert!(load(json!({ "log_level": "" })).is_err());
    }
}
