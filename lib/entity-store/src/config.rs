//! Entity store configuration.

use std::{fmt, time::Duration};

use entity_config::GenericConfiguration;
use entity_error::GenericError;
use serde::Deserialize;

use crate::metadata::ImdsConfiguration;

/// Deployment mode of the host running the agent.
///
/// Selects which background refreshers are started and which attributes are attached to entities.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(from = "String")]
pub enum Mode {
    /// Plain EC2 instance.
    Ec2,

    /// ECS task.
    Ecs,

    /// EKS worker node.
    Eks,

    /// Self-managed Kubernetes on EC2.
    K8sEc2,

    /// Self-managed Kubernetes on-premises.
    K8sOnPrem,

    /// Anything else.
    #[default]
    OnPrem,
}

impl Mode {
    /// Returns the Kubernetes flavor implied by this mode, if any.
    pub const fn as_kubernetes_mode(self) -> Option<KubernetesMode> {
        match self {
            Self::Eks => Some(KubernetesMode::Eks),
            Self::K8sEc2 => Some(KubernetesMode::K8sEc2),
            Self::K8sOnPrem => Some(KubernetesMode::K8sOnPrem),
            Self::Ec2 | Self::Ecs | Self::OnPrem => None,
        }
    }

    /// Returns the configuration string for this mode.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ec2 => "EC2",
            Self::Ecs => "ECS",
            Self::Eks => "EKS",
            Self::K8sEc2 => "K8sEC2",
            Self::K8sOnPrem => "K8sOnPrem",
            Self::OnPrem => "onPrem",
        }
    }
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<&str> for Mode {
    fn from(value: &str) -> Self {
        match value {
            "EC2" => Self::Ec2,
            "ECS" => Self::Ecs,
            "EKS" => Self::Eks,
            "K8sEC2" => Self::K8sEc2,
            "K8sOnPrem" => Self::K8sOnPrem,
            _ => Self::OnPrem,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes flavor the agent is running under.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KubernetesMode {
    /// EKS.
    Eks,

    /// Self-managed Kubernetes on EC2.
    K8sEc2,

    /// Self-managed Kubernetes on-premises.
    K8sOnPrem,
}

impl KubernetesMode {
    /// Returns the configuration string for this flavor.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eks => "EKS",
            Self::K8sEc2 => "K8sEC2",
            Self::K8sOnPrem => "K8sOnPrem",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "EKS" => Some(Self::Eks),
            "K8sEC2" => Some(Self::K8sEc2),
            "K8sOnPrem" => Some(Self::K8sOnPrem),
            _ => None,
        }
    }
}

impl fmt::Display for KubernetesMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential settings handed to the EC2 client factory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CredentialConfiguration {
    /// Region to issue requests against.
    pub region: String,

    /// Named credential profile.
    pub profile: String,

    /// Role to assume before issuing requests.
    pub role_arn: String,

    /// Path to a shared credentials file.
    pub shared_credential_file: String,
}

/// Entity store configuration.
#[derive(Clone, Debug, Default)]
pub struct EntityStoreConfiguration {
    mode: Mode,
    kubernetes_mode: Option<KubernetesMode>,
    credentials: CredentialConfiguration,
    imds: ImdsConfiguration,
}

impl EntityStoreConfiguration {
    /// Creates a new `EntityStoreConfiguration` from the given configuration.
    ///
    /// Every key is optional. A missing or unrecognized `mode` means on-premises.
    ///
    /// # Errors
    ///
    /// If a key is present but holds a value of the wrong type, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let kubernetes_mode = config
            .try_get_typed::<String>("kubernetes_mode")?
            .as_deref()
            .and_then(KubernetesMode::parse);

        let mut imds = ImdsConfiguration::default();
        if let Some(endpoint) = config.try_get_typed::<String>("imds_endpoint")? {
            imds = imds.with_endpoint(endpoint);
        }
        if let Some(timeout_secs) = config.try_get_typed::<u64>("imds_timeout_secs")? {
            imds = imds.with_timeout(Duration::from_secs(timeout_secs));
        }

        Ok(Self {
            mode: config.try_get_typed("mode")?.unwrap_or_default(),
            kubernetes_mode,
            credentials: CredentialConfiguration {
                region: config.try_get_typed("region")?.unwrap_or_default(),
                profile: config.try_get_typed("profile")?.unwrap_or_default(),
                role_arn: config.try_get_typed("role_arn")?.unwrap_or_default(),
                shared_credential_file: config.try_get_typed("shared_credential_file")?.unwrap_or_default(),
            },
            imds,
        })
    }

    /// Sets the deployment mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the Kubernetes flavor.
    pub fn with_kubernetes_mode(mut self, kubernetes_mode: Option<KubernetesMode>) -> Self {
        self.kubernetes_mode = kubernetes_mode;
        self
    }

    /// Sets the region.
    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.credentials.region = region.into();
        self
    }

    /// Returns the deployment mode.
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns the Kubernetes flavor in effect.
    ///
    /// An explicitly configured flavor wins. Otherwise, Kubernetes deployment modes imply their own flavor.
    pub fn kubernetes_mode(&self) -> Option<KubernetesMode> {
        self.kubernetes_mode.or_else(|| self.mode.as_kubernetes_mode())
    }

    /// Returns the configured region.
    pub fn region(&self) -> &str {
        &self.credentials.region
    }

    /// Returns the credential settings.
    pub const fn credentials(&self) -> &CredentialConfiguration {
        &self.credentials
    }

    /// Returns the IMDS client settings.
    pub const fn imds(&self) -> &ImdsConfiguration {
        &self.imds
    }
}
