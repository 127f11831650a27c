//! Entity store.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use entity_common::{
    cache::ExpiringCache,
    sync::{MutexExt as _, RwLockExt as _},
};
use entity_error::GenericError;
use snafu::{ResultExt as _, Snafu};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    aws::{CallerIdentityProvider, Ec2ClientFactory},
    config::{EntityStoreConfiguration, KubernetesMode, Mode},
    ec2::{AutoScalingGroup, Ec2Info},
    eks::{EksInfo, PodIpServiceEnvironment, ServiceEnvironment},
    entity::{
        Entity, AUTO_SCALING_GROUP_KEY, AWS_ACCOUNT_ID_KEY, EC2_PLATFORM, ENVIRONMENT_KEY, INSTANCE_ID_KEY, NAME_KEY,
        PLATFORM_TYPE_KEY, SERVICE_NAME_SOURCE_KEY,
    },
    metadata::MetadataProvider,
    service::{LogFileGlob, LogGroupName, ServiceAttribute, ServiceNameSource, ServiceProvider},
};

/// Time until the next cross-account check after a successful one.
pub const CROSS_ACCOUNT_CHECK_SUCCESS_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Time until the next cross-account check after a failed one.
pub const CROSS_ACCOUNT_CHECK_FAILURE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Lifecycle state of an [`EntityStore`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StoreState {
    /// Not running. Initial state, and the state after shutdown.
    #[default]
    Stopped,

    /// Starting up.
    Starting,

    /// Running.
    Running,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
        }
    }
}

/// Entity store error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum StoreError {
    /// The store was started while not stopped.
    #[snafu(display("Entity store cannot be started while {}.", state))]
    AlreadyStarted {
        /// State the store was in.
        state: StoreState,
    },

    /// The EC2 client could not be built.
    #[snafu(display("Failed to build EC2 client: {}", source))]
    ClientConstruction {
        /// Error source.
        source: GenericError,
    },
}

#[derive(Default)]
struct Lifecycle {
    state: StoreState,
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
struct Components {
    ec2_info: Option<Arc<Ec2Info>>,
    service_provider: Arc<ServiceProvider>,
}

/// Entity attribution for the host.
///
/// `EntityStore` runs the background refreshers that discover the host's identity and service names, and builds the
/// entities attached to outgoing logs and metrics from whatever has been discovered so far.
///
/// Refreshers only start once [`start`][Self::start] is called. Which ones start depends on the deployment mode: EC2
/// identity discovery only runs on EC2, and instance service name discovery does not run on Kubernetes.
///
/// Log entities are only handed out while the instance's account matches the account of the agent's native
/// credentials. This is checked through STS at most once a day, or every five minutes while the check is failing.
pub struct EntityStore {
    config: EntityStoreConfiguration,
    metadata_provider: Arc<dyn MetadataProvider>,
    ec2_client_factory: Option<Arc<dyn Ec2ClientFactory>>,
    caller_identity_provider: RwLock<Option<Arc<dyn CallerIdentityProvider>>>,
    auto_scaling_group: AutoScalingGroup,
    eks_info: EksInfo,
    lifecycle: Mutex<Lifecycle>,
    components: RwLock<Option<Components>>,
    next_cross_account_check: tokio::sync::Mutex<Option<Instant>>,
    ready: AtomicBool,
}

impl EntityStore {
    /// Creates a new `EntityStore`.
    ///
    /// # Errors
    ///
    /// If the pod caches cannot be built, an error is returned.
    pub fn new(
        config: EntityStoreConfiguration, metadata_provider: Arc<dyn MetadataProvider>,
    ) -> Result<Self, GenericError> {
        Ok(Self {
            config,
            metadata_provider,
            ec2_client_factory: None,
            caller_identity_provider: RwLock::new(None),
            auto_scaling_group: AutoScalingGroup::new(),
            eks_info: EksInfo::new()?,
            lifecycle: Mutex::new(Lifecycle::default()),
            components: RwLock::new(None),
            next_cross_account_check: tokio::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    /// Sets the factory used to build EC2 clients.
    ///
    /// Without a factory, the auto-scaling group can only be discovered through instance tags.
    pub fn with_ec2_client_factory(mut self, factory: Arc<dyn Ec2ClientFactory>) -> Self {
        self.ec2_client_factory = Some(factory);
        self
    }

    /// Sets the provider used for the cross-account check.
    pub fn with_caller_identity_provider(self, provider: Arc<dyn CallerIdentityProvider>) -> Self {
        self.set_caller_identity_provider(provider);
        self
    }

    /// Replaces the provider used for the cross-account check.
    ///
    /// The provider must be backed by the agent's native credentials, not by any role assumed for uploads.
    pub fn set_caller_identity_provider(&self, provider: Arc<dyn CallerIdentityProvider>) {
        *self.caller_identity_provider.write_lock() = Some(provider);
    }

    /// Returns `true` if a provider for the cross-account check is set.
    pub fn caller_identity_provider_exists(&self) -> bool {
        self.caller_identity_provider.read_lock().is_some()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> StoreState {
        self.lifecycle.lock_unpoisoned().state
    }

    /// Returns `true` once the store has started.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Relaxed)
    }

    /// Starts the store's background refreshers.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the store is not stopped, or the EC2 client cannot be built, an error is returned.
    pub fn start(&self) -> Result<(), StoreError> {
        {
            let mut lifecycle = self.lifecycle.lock_unpoisoned();
            if lifecycle.state != StoreState::Stopped {
                return AlreadyStarted { state: lifecycle.state }.fail();
            }
            lifecycle.state = StoreState::Starting;
        }

        match self.start_components() {
            Ok((shutdown, tasks)) => {
                let mut lifecycle = self.lifecycle.lock_unpoisoned();
                lifecycle.state = StoreState::Running;
                lifecycle.shutdown = Some(shutdown);
                lifecycle.tasks = tasks;
                drop(lifecycle);

                self.ready.store(true, Relaxed);
                info!(mode = %self.config.mode(), "Entity store started.");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.lock_unpoisoned().state = StoreState::Stopped;
                Err(e)
            }
        }
    }

    fn start_components(&self) -> Result<(CancellationToken, Vec<JoinHandle<()>>), StoreError> {
        let mode = self.config.mode();
        let kubernetes_mode = self.config.kubernetes_mode();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let ec2_info = if mode == Mode::Ec2 {
            let tag_describer = match &self.ec2_client_factory {
                Some(factory) => Some(
                    factory
                        .tag_describer(self.config.region(), self.config.credentials())
                        .context(ClientConstruction)?,
                ),
                None => None,
            };

            let ec2_info = Arc::new(Ec2Info::new(
                Arc::clone(&self.metadata_provider),
                tag_describer,
                kubernetes_mode,
                self.auto_scaling_group.clone(),
                shutdown.clone(),
            ));
            tasks.push(ec2_info.spawn());
            Some(ec2_info)
        } else {
            None
        };

        let service_provider = Arc::new(ServiceProvider::new(
            mode,
            Arc::clone(&self.metadata_provider),
            self.auto_scaling_group.clone(),
            shutdown.clone(),
        ));
        tasks.extend(service_provider.start());
        tasks.extend(self.eks_info.spawn_expiration(&shutdown));

        *self.components.write_lock() = Some(Components {
            ec2_info,
            service_provider,
        });

        Ok((shutdown, tasks))
    }

    /// Stops the background refreshers and waits for them to exit.
    ///
    /// Discovered values and pod mappings are kept. Calling this more than once, or on a store that was never
    /// started, does nothing.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut lifecycle = self.lifecycle.lock_unpoisoned();
            let Some(shutdown) = lifecycle.shutdown.take() else {
                return;
            };
            shutdown.cancel();
            lifecycle.state = StoreState::Stopped;
            std::mem::take(&mut lifecycle.tasks)
        };

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Entity store task failed.");
            }
        }
        info!("Entity store stopped.");
    }

    fn components(&self) -> Option<Components> {
        self.components.read_lock().clone()
    }

    /// Returns the deployment mode.
    pub fn mode(&self) -> Mode {
        self.config.mode()
    }

    /// Returns the Kubernetes flavor in effect.
    pub fn kubernetes_mode(&self) -> Option<KubernetesMode> {
        self.config.kubernetes_mode()
    }

    /// Returns the EC2 instance information, if running on EC2 and started.
    pub fn ec2_info(&self) -> Option<Arc<Ec2Info>> {
        self.components().and_then(|components| components.ec2_info)
    }

    /// Returns the service provider, if started.
    pub fn service_provider(&self) -> Option<Arc<ServiceProvider>> {
        self.components().map(|components| components.service_provider)
    }

    /// Returns the auto-scaling group name, or an empty string if it is not known.
    pub fn auto_scaling_group(&self) -> String {
        self.auto_scaling_group.get().to_string()
    }

    /// Returns the entity for logs from the given file and log group.
    ///
    /// Returns `None` before the store is started, and whenever the cross-account check does not currently allow
    /// entities to be attached.
    pub async fn create_log_file_entity(&self, glob: &LogFileGlob, group: &LogGroupName) -> Option<Entity> {
        let components = self.components()?;
        if !self.should_return_entity().await {
            return None;
        }

        let attribute = components.service_provider.log_file_service_attribute(glob, group);
        let ec2_info = components.ec2_info.as_deref();

        let mut entity = Entity::service();
        entity.add_key_attribute(NAME_KEY, attribute.service_name());
        entity.add_key_attribute(ENVIRONMENT_KEY, attribute.environment());
        entity.add_key_attribute(AWS_ACCOUNT_ID_KEY, ec2_info.map(Ec2Info::account_id).unwrap_or_default());

        if self.config.mode() == Mode::Ec2 {
            if let Some(ec2_info) = ec2_info {
                entity.add_attribute(INSTANCE_ID_KEY, ec2_info.instance_id());
                entity.add_attribute(AUTO_SCALING_GROUP_KEY, ec2_info.auto_scaling_group());
            }
            entity.add_attribute(PLATFORM_TYPE_KEY, EC2_PLATFORM);
        }
        if let Some(source) = attribute.service_name_source() {
            entity.add_attribute(SERVICE_NAME_SOURCE_KEY, source.as_str());
        }

        Some(entity)
    }

    /// Returns `true` if the cross-account check currently allows entities, re-running it when due.
    async fn should_return_entity(&self) -> bool {
        let mut next_check = self.next_cross_account_check.lock().await;
        let now = Instant::now();
        if next_check.is_some_and(|next_check| now <= next_check) {
            return false;
        }

        let same_account = self.check_cross_account().await;
        let interval = if same_account {
            CROSS_ACCOUNT_CHECK_SUCCESS_INTERVAL
        } else {
            CROSS_ACCOUNT_CHECK_FAILURE_INTERVAL
        };
        *next_check = Some(now + interval);

        same_account
    }

    async fn check_cross_account(&self) -> bool {
        let Some(provider) = self.caller_identity_provider.read_lock().clone() else {
            debug!("No native credentials available for the cross-account check.");
            return false;
        };

        let document = match self.metadata_provider.get().await {
            Ok(document) => document,
            Err(e) => {
                debug!(error = %e, "Failed to retrieve instance identity for the cross-account check.");
                return false;
            }
        };

        let identity = match provider.caller_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                debug!(error = %e, "Failed to retrieve caller identity for the cross-account check.");
                return false;
            }
        };

        let same_account = document.account_id == identity.account;
        if !same_account {
            debug!("Instance and native credentials belong to different accounts.");
        }
        same_account
    }

    /// Associates a log file glob from the agent configuration with a service name and environment.
    ///
    /// Ignored before the store is started.
    pub fn add_service_attr_entry_for_log_file(&self, glob: LogFileGlob, service_name: String, environment: String) {
        self.add_service_attr_entry(|provider| {
            provider.add_entry_for_log_file(
                glob,
                ServiceAttribute::named(service_name, ServiceNameSource::UserConfiguration, environment),
            )
        });
    }

    /// Associates a log group seen in instrumented telemetry with a service name and environment.
    ///
    /// Ignored before the store is started.
    pub fn add_service_attr_entry_for_log_group(
        &self, group: LogGroupName, service_name: String, environment: String,
    ) {
        self.add_service_attr_entry(|provider| {
            provider.add_entry_for_log_group(
                group,
                ServiceAttribute::named(service_name, ServiceNameSource::Instrumentation, environment),
            )
        });
    }

    fn add_service_attr_entry<F: FnOnce(&ServiceProvider)>(&self, add: F) {
        match self.service_provider() {
            Some(provider) => add(&provider),
            None => debug!("Entity store not started. Ignoring service association."),
        }
    }

    /// Returns the service name and its source for metrics, or empty strings before the store is started.
    pub fn metric_service_name_and_source(&self) -> (String, String) {
        match self.service_provider() {
            Some(provider) => {
                let (service_name, source) = provider.service_name_and_source();
                (service_name, source.to_string())
            }
            None => (String::new(), String::new()),
        }
    }

    /// Maps a pod to a service and environment.
    pub fn add_pod_service_environment_mapping(
        &self, pod_name: String, service_name: String, environment: String, service_name_source: String,
    ) {
        self.eks_info
            .add_pod_service_environment_mapping(pod_name, service_name, environment, service_name_source);
    }

    /// Maps a pod IP to a service and environment.
    pub fn add_pod_ip_service_environment_mapping(&self, pod_ip: String, mapping: PodIpServiceEnvironment) {
        self.eks_info.add_pod_ip_service_environment_mapping(pod_ip, mapping);
    }

    /// Returns the live pod name cache.
    pub fn pod_service_environment_mapping(&self) -> ExpiringCache<String, ServiceEnvironment> {
        self.eks_info.pod_service_environment_mapping()
    }

    /// Returns the live pod IP cache.
    pub fn pod_ip_service_environment_mapping(
        &self,
    ) -> ExpiringCache<String, PodIpServiceEnvironment> {
        self.eks_info.pod_ip_service_environment_mapping()
    }
}
