//! Layered configuration loading and querying.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use entity_error::GenericError;
use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::FileProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Configuration key '{}' is not set. {}", field, help_text))]
    MissingField {
        /// Help text describing how the field could be set.
        ///
        /// Includes the environment variable form of the key when environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field had a different data type than the one asked for.
    #[snafu(display(
        "Configuration key '{}' should be {} but is {}.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Configuration lookup failed."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&HashSet::new(), e)
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// Loads configuration from files and the environment.
///
/// Sources added later take precedence over sources added earlier. The merged result can either be deserialized
/// directly ([`into_typed`][Self::into_typed]) or kept around for key-based lookups
/// ([`into_generic`][Self::into_generic]).
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables, which must share a prefix (see [`from_environment`][Self::from_environment])
/// - in-memory values, mostly useful for defaults and tests (see [`add_static_values`][Self::add_static_values])
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefixes: HashSet<String>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Adds a YAML file as a configuration source.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or does not parse as YAML.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = FileProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Adds a YAML file as a configuration source when it can be read, skipping it otherwise.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match FileProvider::from_yaml(&path) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Skipping unreadable YAML configuration file.");
            }
        }
        self
    }

    /// Adds a JSON file as a configuration source.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or does not parse as JSON.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = FileProvider::from_json(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads configuration from environment variables.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `entity` matches
    /// `ENTITY_MODE`, `ENTITY_REGION`, and so on. Matching is case-insensitive and keys are lowercased.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment could not be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        // `Env` isn't `Send + Sync`, so snapshot its values into a serialized provider instead.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
            self.env_prefixes.insert(prefix.to_uppercase());
        }
        Ok(self)
    }

    /// Adds a set of in-memory values as a configuration source.
    ///
    /// `values` must serialize to a map.
    pub fn add_static_values<T>(mut self, values: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.providers.push(BoxedProvider(Box::new(Serialized::defaults(values))));
        self
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let env_prefixes = self.env_prefixes.clone();
        self.into_figment()
            .extract()
            .map_err(|e| from_figment_error(&env_prefixes, e))
    }

    /// Consumes the loader and wraps the merged configuration for key-based lookups.
    pub fn into_generic(self) -> GenericConfiguration {
        let env_prefixes = self.env_prefixes.clone();
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.into_figment(),
                env_prefixes,
            }),
        }
    }

    fn into_figment(self) -> Figment {
        self.providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: HashSet<String>,
}

/// Merged configuration, queryable by key.
///
/// Keys use `a.b.c` notation for nested values. Given:
///
/// ```json
/// { "imds": { "endpoint": "http://127.0.0.1:1338" } }
/// ```
///
/// querying `imds.endpoint` returns `"http://127.0.0.1:1338"`. Since environment variables cannot express nesting,
/// a nested key that is missing is retried once with periods replaced by underscores (`imds_endpoint`).
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => self
                .inner
                .figment
                .extract_inner(&key.replace('.', "_"))
                .map_err(|fallback_e| from_figment_error(&self.inner.env_prefixes, fallback_e)),
            Err(e) => Err(from_figment_error(&self.inner.env_prefixes, e)),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or its value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, falling back to `T::default()` on any error.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the key exists but its value could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.env_prefixes, e))
    }
}

fn from_figment_error(env_prefixes: &HashSet<String>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = env_prefixes
                .iter()
                .map(|prefix| format!("{}{}", prefix, field.replace('.', "_").to_uppercase()))
                .collect::<Vec<_>>();
            valid_keys.sort();
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Set it with `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
