//! Service name discovery and attribution.
//!
//! [`ServiceProvider`] collects candidate service names from several sources and merges them, in a fixed priority
//! order, into the [`ServiceAttribute`] attached to an entity. Each source can supply the service name, the
//! environment, or both, and the two fields are filled independently: a higher-priority source providing only a name
//! still lets a lower-priority source provide the environment.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use entity_common::{sync::RwLockExt as _, task::spawn_traced_named};
use entity_error::{generic_error, ErrorContext as _, GenericError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::Mode,
    ec2::{AutoScalingGroup, AUTO_SCALING_GROUP_TAG_KEY},
    metadata::{Arn, MetadataProvider},
    retry::{Retryer, DEFAULT_SUCCESS_JITTER_MAX, DEFAULT_SUCCESS_JITTER_MIN, LONG_BACKOFF_SCHEDULE},
};

/// Service name used when no source provides one.
pub const UNKNOWN_SERVICE_NAME: &str = "unknown_service";

/// Environment used on EC2 when no source provides one.
pub const DEFAULT_EC2_ENVIRONMENT: &str = "ec2:default";

const ENVIRONMENT_EC2_PREFIX: &str = "ec2:";
const INSTANCE_PROFILE_PREFIX: &str = "instance-profile/";

/// Instance tag keys checked for a service name, highest priority first.
const SERVICE_NAME_TAG_KEYS: &[&str] = &["service", "application", "app"];

/// Origin of a service name.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum ServiceNameSource {
    /// Name of the IAM role attached to the instance.
    ClientIamRole,

    /// Resource attributes of instrumented telemetry.
    Instrumentation,

    /// Instance tags.
    ResourceTags,

    /// No source provided a name.
    Unknown,

    /// The agent configuration.
    UserConfiguration,

    /// A Kubernetes workload.
    K8sWorkload,
}

impl ServiceNameSource {
    /// Returns the string form of the source.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientIamRole => "ClientIamRole",
            Self::Instrumentation => "Instrumentation",
            Self::ResourceTags => "ResourceTags",
            Self::Unknown => "Unknown",
            Self::UserConfiguration => "UserConfiguration",
            Self::K8sWorkload => "K8sWorkload",
        }
    }
}

impl fmt::Display for ServiceNameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service name, where it came from, and the deployment environment.
///
/// The source is present if and only if the service name is non-empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceAttribute {
    service_name: String,
    service_name_source: Option<ServiceNameSource>,
    environment: String,
}

impl ServiceAttribute {
    /// Creates an attribute with a service name from the given source.
    ///
    /// If `service_name` is empty, the source is dropped.
    pub fn named<N, E>(service_name: N, source: ServiceNameSource, environment: E) -> Self
    where
        N: Into<String>,
        E: Into<String>,
    {
        let service_name = service_name.into();
        let service_name_source = (!service_name.is_empty()).then_some(source);
        Self {
            service_name,
            service_name_source,
            environment: environment.into(),
        }
    }

    /// Creates an attribute that only carries an environment.
    pub fn environment_only<E: Into<String>>(environment: E) -> Self {
        Self {
            environment: environment.into(),
            ..Self::default()
        }
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the source of the service name.
    pub fn service_name_source(&self) -> Option<ServiceNameSource> {
        self.service_name_source
    }

    /// Returns the environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn is_complete(&self) -> bool {
        !self.service_name.is_empty() && !self.environment.is_empty()
    }

    /// Fills in whichever fields are still empty from `other`.
    fn fill_from(&mut self, other: ServiceAttribute) {
        if self.service_name.is_empty() {
            self.service_name = other.service_name;
            self.service_name_source = other.service_name_source;
        }
        if self.environment.is_empty() {
            self.environment = other.environment;
        }
    }
}

/// Merges attributes from `providers`, highest priority first, stopping as soon as both fields are set.
fn merge_service_attributes(providers: &[&dyn Fn() -> ServiceAttribute]) -> ServiceAttribute {
    let mut merged = ServiceAttribute::default();
    for provider in providers {
        merged.fill_from(provider());
        if merged.is_complete() {
            break;
        }
    }
    merged
}

/// A log file glob from the agent configuration.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct LogFileGlob(String);

impl LogFileGlob {
    /// Returns the glob as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for LogFileGlob {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// A log group name.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct LogGroupName(String);

impl LogGroupName {
    /// Returns the log group name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for LogGroupName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

#[derive(Default)]
struct DiscoveredNames {
    iam_role: String,
    imds_service_name: String,
}

#[derive(Default)]
struct Associations {
    log_files: HashMap<LogFileGlob, ServiceAttribute>,
    log_groups: HashMap<LogGroupName, ServiceAttribute>,
}

/// Discovers and merges service attributes.
///
/// Names discovered in the background and associations supplied by callers are kept behind separate locks, so
/// refreshers never contend with configuration or telemetry writers.
pub struct ServiceProvider {
    mode: Mode,
    metadata_provider: Arc<dyn MetadataProvider>,
    auto_scaling_group: AutoScalingGroup,
    discovered: RwLock<DiscoveredNames>,
    associations: RwLock<Associations>,
    shutdown: CancellationToken,
}

impl ServiceProvider {
    /// Creates a new `ServiceProvider`.
    pub fn new(
        mode: Mode, metadata_provider: Arc<dyn MetadataProvider>, auto_scaling_group: AutoScalingGroup,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            mode,
            metadata_provider,
            auto_scaling_group,
            discovered: RwLock::new(DiscoveredNames::default()),
            associations: RwLock::new(Associations::default()),
            shutdown,
        }
    }

    /// Starts the IAM role and instance tag refreshers, returning their task handles.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let iam_role_provider = Arc::clone(self);
        let iam_role_task = spawn_traced_named("service-provider-iam-role", async move {
            iam_role_provider
                .refresh_loop("iam_role")
                .run(|| iam_role_provider.refresh_iam_role())
                .await;
        });

        let tags_provider = Arc::clone(self);
        let tags_task = spawn_traced_named("service-provider-instance-tags", async move {
            tags_provider
                .refresh_loop("instance_tags")
                .run(|| tags_provider.refresh_instance_tags())
                .await;
        });

        vec![iam_role_task, tags_task]
    }

    fn refresh_loop(&self, name: &'static str) -> Retryer {
        Retryer::new(name, self.shutdown.clone())
            .retry_any_error(true)
            .success_jitter(DEFAULT_SUCCESS_JITTER_MIN, DEFAULT_SUCCESS_JITTER_MAX)
            .backoff_schedule(LONG_BACKOFF_SCHEDULE)
    }

    /// Returns the IAM role name, or an empty string if it is not known.
    pub fn iam_role(&self) -> String {
        self.discovered.read_lock().iam_role.clone()
    }

    /// Returns the service name from instance tags, or an empty string if it is not known.
    pub fn imds_service_name(&self) -> String {
        self.discovered.read_lock().imds_service_name.clone()
    }

    /// Returns the auto-scaling group name, or an empty string if it is not known.
    pub fn auto_scaling_group(&self) -> String {
        self.auto_scaling_group.get().to_string()
    }

    /// Associates a log file glob with a service attribute, replacing any existing association.
    pub fn add_entry_for_log_file(&self, glob: LogFileGlob, attribute: ServiceAttribute) {
        self.associations.write_lock().log_files.insert(glob, attribute);
    }

    /// Associates a log group with a service attribute, replacing any existing association.
    pub fn add_entry_for_log_group(&self, group: LogGroupName, attribute: ServiceAttribute) {
        self.associations.write_lock().log_groups.insert(group, attribute);
    }

    /// Returns the service attribute for logs from the given file and log group.
    ///
    /// Sources are consulted in this order:
    ///
    /// 1. the log group association
    /// 2. the log file association
    /// 3. the instance tag service name
    /// 4. the IAM role name
    /// 5. the auto-scaling group, as `ec2:<name>` (environment only)
    /// 6. `unknown_service`, plus `ec2:default` as the environment on EC2
    pub fn log_file_service_attribute(&self, glob: &LogFileGlob, group: &LogGroupName) -> ServiceAttribute {
        merge_service_attributes(&[
            &|| self.attribute_for_log_group(group),
            &|| self.attribute_for_log_file(glob),
            &|| self.attribute_from_instance_tags(),
            &|| self.attribute_from_iam_role(),
            &|| self.attribute_from_auto_scaling_group(),
            &|| self.fallback_attribute(),
        ])
    }

    /// Returns the service name and its source, without log file or log group context.
    pub fn service_name_and_source(&self) -> (String, ServiceNameSource) {
        let merged = merge_service_attributes(&[
            &|| self.attribute_from_instance_tags(),
            &|| self.attribute_from_iam_role(),
            &|| self.fallback_attribute(),
        ]);
        let source = merged.service_name_source.unwrap_or(ServiceNameSource::Unknown);
        (merged.service_name, source)
    }

    fn attribute_for_log_group(&self, group: &LogGroupName) -> ServiceAttribute {
        if group.as_str().is_empty() {
            return ServiceAttribute::default();
        }
        self.associations
            .read_lock()
            .log_groups
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    fn attribute_for_log_file(&self, glob: &LogFileGlob) -> ServiceAttribute {
        if glob.as_str().is_empty() {
            return ServiceAttribute::default();
        }
        self.associations
            .read_lock()
            .log_files
            .get(glob)
            .cloned()
            .unwrap_or_default()
    }

    fn attribute_from_instance_tags(&self) -> ServiceAttribute {
        ServiceAttribute::named(self.imds_service_name(), ServiceNameSource::ResourceTags, "")
    }

    fn attribute_from_iam_role(&self) -> ServiceAttribute {
        ServiceAttribute::named(self.iam_role(), ServiceNameSource::ClientIamRole, "")
    }

    fn attribute_from_auto_scaling_group(&self) -> ServiceAttribute {
        match self.auto_scaling_group.get() {
            "" => ServiceAttribute::default(),
            name => ServiceAttribute::environment_only(format!("{}{}", ENVIRONMENT_EC2_PREFIX, name)),
        }
    }

    fn fallback_attribute(&self) -> ServiceAttribute {
        let environment = if self.mode == Mode::Ec2 {
            DEFAULT_EC2_ENVIRONMENT
        } else {
            ""
        };
        ServiceAttribute::named(UNKNOWN_SERVICE_NAME, ServiceNameSource::Unknown, environment)
    }

    /// Refreshes the IAM role name from the instance profile attached to the instance.
    pub(crate) async fn refresh_iam_role(&self) -> Result<(), GenericError> {
        let profile_arn = self
            .metadata_provider
            .client_iam_role()
            .await
            .error_context("Failed to retrieve instance profile.")?;
        let arn = Arn::parse(&profile_arn).error_context("Failed to parse instance profile ARN.")?;

        let role = arn.resource.strip_prefix(INSTANCE_PROFILE_PREFIX).ok_or_else(|| {
            generic_error!(
                "Instance profile resource does not follow the expected pattern '{}<role_name>'.",
                INSTANCE_PROFILE_PREFIX
            )
        })?;

        self.discovered.write_lock().iam_role = role.to_string();
        debug!("Refreshed IAM role.");
        Ok(())
    }

    /// Refreshes the service name and auto-scaling group from instance tags.
    pub(crate) async fn refresh_instance_tags(&self) -> Result<(), GenericError> {
        let tags = self
            .metadata_provider
            .instance_tags()
            .await
            .error_context("Failed to retrieve instance tags.")?;

        let keys_by_lowercase = tags
            .iter()
            .map(|key| (key.to_lowercase(), key.as_str()))
            .collect::<HashMap<_, _>>();

        let mut service_name = String::new();
        if let Some(key) = SERVICE_NAME_TAG_KEYS
            .iter()
            .find_map(|candidate| keys_by_lowercase.get(*candidate))
        {
            service_name = self
                .metadata_provider
                .instance_tag_value(key)
                .await
                .error_context("Failed to retrieve service name tag value.")?;
        }
        self.discovered.write_lock().imds_service_name = service_name;

        if tags.iter().any(|key| key == AUTO_SCALING_GROUP_TAG_KEY) {
            let name = self
                .metadata_provider
                .instance_tag_value(AUTO_SCALING_GROUP_TAG_KEY)
                .await
                .error_context("Failed to retrieve auto-scaling group tag value.")?;
            if self.auto_scaling_group.set(name) {
                debug!("Retrieved auto-scaling group from instance tags.");
            }
        }

        debug!("Refreshed instance tags.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::test_util::{wait_for, MockMetadataProvider};

    fn provider_with(mode: Mode, metadata: MockMetadataProvider) -> ServiceProvider {
        ServiceProvider::new(
            mode,
            Arc::new(metadata),
            AutoScalingGroup::new(),
            CancellationToken::new(),
        )
    }

    fn provider(mode: Mode) -> ServiceProvider {
        provider_with(mode, MockMetadataProvider::default())
    }

    fn set_names(provider: &ServiceProvider, iam_role: &str, imds_service_name: &str) {
        let mut discovered = provider.discovered.write_lock();
        discovered.iam_role = iam_role.to_string();
        discovered.imds_service_name = imds_service_name.to_string();
    }

    fn attribute(provider: &ServiceProvider) -> ServiceAttribute {
        provider.log_file_service_attribute(&"/var/log/app.log".into(), &"app-group".into())
    }

    #[test]
    fn service_attribute_source_follows_name() {
        let attribute = ServiceAttribute::named("", ServiceNameSource::ResourceTags, "prod");
        assert_eq!(attribute.service_name_source(), None);
        assert_eq!(attribute.environment(), "prod");

        let attribute = ServiceAttribute::named("svc", ServiceNameSource::ResourceTags, "");
        assert_eq!(attribute.service_name_source(), Some(ServiceNameSource::ResourceTags));

        let attribute = ServiceAttribute::environment_only("ec2:asg");
        assert_eq!(attribute.service_name(), "");
        assert_eq!(attribute.service_name_source(), None);
    }

    #[test]
    fn source_strings() {
        assert_eq!(ServiceNameSource::ClientIamRole.to_string(), "ClientIamRole");
        assert_eq!(ServiceNameSource::K8sWorkload.to_string(), "K8sWorkload");
        assert_eq!(
            serde_json::to_value(ServiceNameSource::UserConfiguration).unwrap(),
            serde_json::json!("UserConfiguration")
        );
    }

    #[test]
    fn end_to_end_priority() {
        let provider = provider(Mode::Ec2);

        let attr = attribute(&provider);
        assert_eq!(attr.service_name(), "unknown_service");
        assert_eq!(attr.service_name_source(), Some(ServiceNameSource::Unknown));
        assert_eq!(attr.environment(), "ec2:default");

        provider.auto_scaling_group.set("my-asg");
        let attr = attribute(&provider);
        assert_eq!(attr.service_name(), "unknown_service");
        assert_eq!(attr.service_name_source(), Some(ServiceNameSource::Unknown));
        assert_eq!(attr.environment(), "ec2:my-asg");

        set_names(&provider, "my-role", "");
        let attr = attribute(&provider);
        assert_eq!(attr.service_name(), "my-role");
        assert_eq!(attr.service_name_source(), Some(ServiceNameSource::ClientIamRole));
        assert_eq!(attr.environment(), "ec2:my-asg");
    }

    #[test]
    fn associations_take_priority() {
        let provider = provider(Mode::Ec2);
        set_names(&provider, "my-role", "tagged-service");

        provider.add_entry_for_log_file(
            "/var/log/app.log".into(),
            ServiceAttribute::named("file-service", ServiceNameSource::UserConfiguration, "file-env"),
        );
        let attr = attribute(&provider);
        assert_eq!(attr.service_name(), "file-service");
        assert_eq!(attr.environment(), "file-env");

        provider.add_entry_for_log_group(
            "app-group".into(),
            ServiceAttribute::named("group-service", ServiceNameSource::Instrumentation, ""),
        );
        let attr = attribute(&provider);
        assert_eq!(attr.service_name(), "group-service");
        assert_eq!(attr.service_name_source(), Some(ServiceNameSource::Instrumentation));
        assert_eq!(attr.environment(), "file-env");
    }

    #[test]
    fn associations_are_last_write_wins() {
        let provider = provider(Mode::Ec2);
        provider.add_entry_for_log_group(
            "app-group".into(),
            ServiceAttribute::named("first", ServiceNameSource::Instrumentation, "first-env"),
        );
        provider.add_entry_for_log_group(
            "app-group".into(),
            ServiceAttribute::named("second", ServiceNameSource::Instrumentation, ""),
        );

        let attr = attribute(&provider);
        assert_eq!(attr.service_name(), "second");
        assert_eq!(attr.environment(), "ec2:default");
    }

    #[test]
    fn empty_identifiers_skip_associations() {
        let provider = provider(Mode::Ec2);
        provider.add_entry_for_log_file(
            "".into(),
            ServiceAttribute::named("empty-glob", ServiceNameSource::UserConfiguration, ""),
        );

        let attr = provider.log_file_service_attribute(&"".into(), &"".into());
        assert_eq!(attr.service_name(), "unknown_service");
    }

    #[test]
    fn fallback_environment_only_on_ec2() {
        for mode in [Mode::Ecs, Mode::Eks, Mode::K8sEc2, Mode::K8sOnPrem, Mode::OnPrem] {
            let attr = attribute(&provider(mode));
            assert_eq!(attr.service_name(), "unknown_service");
            assert_eq!(attr.environment(), "", "mode {}", mode);
        }
    }

    #[test]
    fn service_name_and_source_ignores_environment_sources() {
        let provider = provider(Mode::Ec2);
        assert_eq!(
            provider.service_name_and_source(),
            ("unknown_service".to_string(), ServiceNameSource::Unknown)
        );

        set_names(&provider, "my-role", "");
        assert_eq!(
            provider.service_name_and_source(),
            ("my-role".to_string(), ServiceNameSource::ClientIamRole)
        );

        set_names(&provider, "my-role", "tagged-service");
        assert_eq!(
            provider.service_name_and_source(),
            ("tagged-service".to_string(), ServiceNameSource::ResourceTags)
        );
    }

    #[tokio::test]
    async fn iam_role_from_instance_profile() {
        let provider = provider_with(
            Mode::Ec2,
            MockMetadataProvider::default().with_iam_role("arn:aws:iam::123456789012:instance-profile/my-role"),
        );
        provider.refresh_iam_role().await.unwrap();
        assert_eq!(provider.iam_role(), "my-role");
    }

    #[tokio::test]
    async fn iam_role_requires_instance_profile_prefix() {
        let provider = provider_with(
            Mode::Ec2,
            MockMetadataProvider::default().with_iam_role("arn:aws:iam::123456789012:role/my-role"),
        );
        assert!(provider.refresh_iam_role().await.is_err());
        assert_eq!(provider.iam_role(), "");

        let provider = provider_with(Mode::Ec2, MockMetadataProvider::default().with_iam_role("not-an-arn"));
        assert!(provider.refresh_iam_role().await.is_err());
        assert_eq!(provider.iam_role(), "");
    }

    #[tokio::test]
    async fn tag_keys_match_case_insensitively_and_exactly() {
        let provider = provider_with(Mode::Ec2, MockMetadataProvider::default().with_tag("ServicE", "x"));
        provider.refresh_instance_tags().await.unwrap();
        assert_eq!(provider.imds_service_name(), "x");

        let provider = provider_with(Mode::Ec2, MockMetadataProvider::default().with_tag("sservicee", "x"));
        provider.refresh_instance_tags().await.unwrap();
        assert_eq!(provider.imds_service_name(), "");
    }

    #[tokio::test]
    async fn tag_key_priority() {
        let provider = provider_with(
            Mode::Ec2,
            MockMetadataProvider::default()
                .with_tag("app", "from-app")
                .with_tag("Application", "from-application"),
        );
        provider.refresh_instance_tags().await.unwrap();
        assert_eq!(provider.imds_service_name(), "from-application");
    }

    #[tokio::test]
    async fn removed_tag_clears_service_name() {
        let metadata = MockMetadataProvider::default().with_tag("service", "svc");
        let provider = provider_with(Mode::Ec2, metadata.clone());
        provider.refresh_instance_tags().await.unwrap();
        assert_eq!(provider.imds_service_name(), "svc");

        metadata.remove_tag("service");
        provider.refresh_instance_tags().await.unwrap();
        assert_eq!(provider.imds_service_name(), "");
    }

    #[tokio::test]
    async fn auto_scaling_group_tag_is_case_sensitive() {
        let provider = provider_with(
            Mode::Ec2,
            MockMetadataProvider::default().with_tag("aws:autoscaling:groupname", "wrong-case"),
        );
        provider.refresh_instance_tags().await.unwrap();
        assert_eq!(provider.auto_scaling_group(), "");

        let provider = provider_with(
            Mode::Ec2,
            MockMetadataProvider::default().with_tag(AUTO_SCALING_GROUP_TAG_KEY, "my-asg"),
        );
        provider.refresh_instance_tags().await.unwrap();
        assert_eq!(provider.auto_scaling_group(), "my-asg");
    }

    #[tokio::test(start_paused = true)]
    async fn refreshers_run_until_shutdown() {
        let metadata = MockMetadataProvider::default()
            .with_iam_role("arn:aws:iam::123456789012:instance-profile/my-role")
            .with_tag("service", "svc");
        let shutdown = CancellationToken::new();
        let provider = Arc::new(ServiceProvider::new(
            Mode::Ec2,
            Arc::new(metadata.clone()),
            AutoScalingGroup::new(),
            shutdown.clone(),
        ));

        let tasks = provider.start();
        assert_eq!(tasks.len(), 2);
        wait_for(|| provider.iam_role() == "my-role" && provider.imds_service_name() == "svc").await;

        metadata.set_tag("service", "renamed");
        tokio::time::sleep(DEFAULT_SUCCESS_JITTER_MAX + Duration::from_secs(1)).await;
        assert_eq!(provider.imds_service_name(), "renamed");

        shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refreshers_run_on_kubernetes() {
        for mode in [Mode::Eks, Mode::K8sEc2, Mode::K8sOnPrem] {
            let shutdown = CancellationToken::new();
            let metadata = MockMetadataProvider::default()
                .with_iam_role("arn:aws:iam::123456789012:instance-profile/node-role")
                .with_tag("app", "node-app");
            let provider = Arc::new(ServiceProvider::new(
                mode,
                Arc::new(metadata),
                AutoScalingGroup::new(),
                shutdown.clone(),
            ));

            let tasks = provider.start();
            assert_eq!(tasks.len(), 2);
            wait_for(|| provider.iam_role() == "node-role" && provider.imds_service_name() == "node-app").await;

            shutdown.cancel();
            for task in tasks {
                task.await.unwrap();
            }
        }
    }

    fn source_strategy() -> impl Strategy<Value = Option<&'static str>> {
        prop_oneof![Just(None), Just(Some("")), Just(Some("value"))]
    }

    fn labelled(prefix: &str, value: Option<&str>) -> String {
        match value {
            Some("value") => format!("{}-value", prefix),
            _ => String::new(),
        }
    }

    proptest! {
        #[test]
        fn property_test_priority(
            group_name in source_strategy(),
            group_env in source_strategy(),
            file_name in source_strategy(),
            file_env in source_strategy(),
            imds in any::<bool>(),
            iam in any::<bool>(),
            asg in any::<bool>(),
        ) {
            let provider = provider(Mode::Ec2);
            if group_name.is_some() || group_env.is_some() {
                provider.add_entry_for_log_group(
                    "app-group".into(),
                    ServiceAttribute::named(
                        labelled("group", group_name),
                        ServiceNameSource::Instrumentation,
                        labelled("group-env", group_env),
                    ),
                );
            }
            if file_name.is_some() || file_env.is_some() {
                provider.add_entry_for_log_file(
                    "/var/log/app.log".into(),
                    ServiceAttribute::named(
                        labelled("file", file_name),
                        ServiceNameSource::UserConfiguration,
                        labelled("file-env", file_env),
                    ),
                );
            }
            set_names(&provider, if iam { "role" } else { "" }, if imds { "tagged" } else { "" });
            if asg {
                provider.auto_scaling_group.set("asg");
            }

            let attr = attribute(&provider);

            let expected_name = if group_name == Some("value") {
                ("group-value", ServiceNameSource::Instrumentation)
            } else if file_name == Some("value") {
                ("file-value", ServiceNameSource::UserConfiguration)
            } else if imds {
                ("tagged", ServiceNameSource::ResourceTags)
            } else if iam {
                ("role", ServiceNameSource::ClientIamRole)
            } else {
                ("unknown_service", ServiceNameSource::Unknown)
            };
            let expected_env = if group_env == Some("value") {
                "group-env-value"
            } else if file_env == Some("value") {
                "file-env-value"
            } else if asg {
                "ec2:asg"
            } else {
                "ec2:default"
            };

            prop_assert_eq!(attr.service_name(), expected_name.0);
            prop_assert_eq!(attr.service_name_source(), Some(expected_name.1));
            prop_assert_eq!(attr.environment(), expected_env);
        }
    }
}
