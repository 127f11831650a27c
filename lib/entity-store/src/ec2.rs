//! EC2 instance identity and auto-scaling group discovery.

use std::{
    fmt,
    sync::{Arc, OnceLock, RwLock},
    time::Duration,
};

use entity_common::{sync::RwLockExt as _, task::spawn_traced_named};
use entity_error::{ErrorContext as _, GenericError};
use tokio::{select, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    aws::{DescribeTagsRequest, TagDescriber, TagFilter},
    config::KubernetesMode,
    metadata::MetadataProvider,
    retry::{Retryer, LONG_BACKOFF_SCHEDULE},
};

/// Maximum length of an EC2 instance ID.
pub const MAX_INSTANCE_ID_LENGTH: usize = 19;

/// Maximum length of an auto-scaling group name.
pub const MAX_AUTO_SCALING_GROUP_LENGTH: usize = 255;

/// Instance tag holding the name of the instance's auto-scaling group.
pub const AUTO_SCALING_GROUP_TAG_KEY: &str = "aws:autoscaling:groupName";

const IDENTITY_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Returns `value` if it is at most `max_length` bytes long, or an empty string otherwise.
///
/// Downstream consumers reject over-length values outright, so a value that is too long is dropped rather than
/// truncated.
pub fn validate_length(field: &'static str, value: String, max_length: usize) -> String {
    if value.len() > max_length {
        warn!(
            field,
            length = value.len(),
            max_length,
            "Value exceeds maximum length and will be ignored."
        );
        return String::new();
    }
    value
}

/// The name of the auto-scaling group the instance belongs to.
///
/// Write-once: the first valid name set wins, and later writes are ignored, regardless of which discovery path they
/// come from. Clones share the same underlying value.
#[derive(Clone, Default)]
pub struct AutoScalingGroup(Arc<OnceLock<String>>);

impl AutoScalingGroup {
    /// Creates a new, unset `AutoScalingGroup`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the group name, or an empty string if none has been set.
    pub fn get(&self) -> &str {
        self.0.get().map_or("", String::as_str)
    }

    /// Sets the group name, returning `true` if this call set it.
    ///
    /// Empty and over-length names are ignored and leave the value unset.
    pub fn set<S: Into<String>>(&self, name: S) -> bool {
        let name = validate_length("auto_scaling_group", name.into(), MAX_AUTO_SCALING_GROUP_LENGTH);
        if name.is_empty() {
            return false;
        }
        self.0.set(name).is_ok()
    }
}

impl fmt::Debug for AutoScalingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoScalingGroup")
            .field("set", &self.0.get().is_some())
            .finish()
    }
}

/// Progress of [`Ec2Info`] discovery.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Ec2InfoState {
    /// Discovery has not started.
    #[default]
    Uninitialized,

    /// Waiting for the instance identity document.
    FetchingIdentity,

    /// Identity is known and the auto-scaling group has not been looked up yet.
    IdentityFetched,

    /// Looking up the auto-scaling group.
    FetchingAutoScalingGroup,

    /// Discovery is complete.
    Ready,
}

#[derive(Default)]
struct Identity {
    instance_id: String,
    account_id: String,
    region: String,
    state: Ec2InfoState,
}

/// Identity of the EC2 instance the agent runs on.
///
/// Populated in the background by [`spawn`][Self::spawn]. Every accessor returns an empty value until the
/// corresponding field has been discovered.
pub struct Ec2Info {
    identity: RwLock<Identity>,
    auto_scaling_group: AutoScalingGroup,
    metadata_provider: Arc<dyn MetadataProvider>,
    tag_describer: Option<Arc<dyn TagDescriber>>,
    kubernetes_mode: Option<KubernetesMode>,
    shutdown: CancellationToken,
}

impl Ec2Info {
    /// Creates a new `Ec2Info`.
    ///
    /// `auto_scaling_group` may be shared with other discovery paths. When `tag_describer` is present, it is used to
    /// look up the auto-scaling group whenever instance tags are not available through the metadata service.
    pub fn new(
        metadata_provider: Arc<dyn MetadataProvider>, tag_describer: Option<Arc<dyn TagDescriber>>,
        kubernetes_mode: Option<KubernetesMode>, auto_scaling_group: AutoScalingGroup, shutdown: CancellationToken,
    ) -> Self {
        Self {
            identity: RwLock::new(Identity::default()),
            auto_scaling_group,
            metadata_provider,
            tag_describer,
            kubernetes_mode,
            shutdown,
        }
    }

    /// Returns the instance ID.
    pub fn instance_id(&self) -> String {
        self.identity.read_lock().instance_id.clone()
    }

    /// Returns the ID of the account that owns the instance.
    pub fn account_id(&self) -> String {
        self.identity.read_lock().account_id.clone()
    }

    /// Returns the region the instance runs in.
    pub fn region(&self) -> String {
        self.identity.read_lock().region.clone()
    }

    /// Returns the name of the instance's auto-scaling group.
    pub fn auto_scaling_group(&self) -> String {
        self.auto_scaling_group.get().to_string()
    }

    /// Returns the discovery state.
    pub fn state(&self) -> Ec2InfoState {
        self.identity.read_lock().state
    }

    /// Spawns the background discovery task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let ec2_info = Arc::clone(self);
        spawn_traced_named("ec2-info", async move { ec2_info.run().await })
    }

    /// Runs discovery to completion, or until shutdown.
    pub async fn run(&self) {
        info!("Initializing EC2 info.");

        if !self.fetch_identity().await {
            return;
        }

        if self.kubernetes_mode == Some(KubernetesMode::Eks) {
            debug!("Running on EKS. Skipping auto-scaling group discovery.");
        } else {
            self.set_state(Ec2InfoState::FetchingAutoScalingGroup);
            Retryer::new("auto_scaling_group", self.shutdown.clone())
                .one_time(true)
                .retry_any_error(true)
                .backoff_schedule(LONG_BACKOFF_SCHEDULE)
                .run(|| self.retrieve_auto_scaling_group())
                .await;

            if self.shutdown.is_cancelled() {
                return;
            }
        }

        self.set_state(Ec2InfoState::Ready);
        info!("Finished initializing EC2 info.");
    }

    fn set_state(&self, state: Ec2InfoState) {
        self.identity.write_lock().state = state;
    }

    /// Polls the identity document until it is fetched, returning `false` if shutdown was observed first.
    async fn fetch_identity(&self) -> bool {
        self.set_state(Ec2InfoState::FetchingIdentity);

        loop {
            let result = select! {
                biased;

                _ = self.shutdown.cancelled() => return false,
                result = self.metadata_provider.get() => result,
            };

            match result {
                Ok(document) => {
                    let instance_id = validate_length("instance_id", document.instance_id, MAX_INSTANCE_ID_LENGTH);

                    let mut identity = self.identity.write_lock();
                    identity.instance_id = instance_id;
                    identity.account_id = document.account_id;
                    identity.region = document.region;
                    identity.state = Ec2InfoState::IdentityFetched;
                    drop(identity);

                    debug!("Retrieved instance identity.");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to retrieve instance identity through the metadata service. Retrying in 1 minute.");
                }
            }

            select! {
                _ = self.shutdown.cancelled() => return false,
                _ = sleep(IDENTITY_POLL_INTERVAL) => {},
            }
        }
    }

    async fn retrieve_auto_scaling_group(&self) -> Result<(), GenericError> {
        let tags = match self.metadata_provider.instance_tags().await {
            Ok(tags) => tags,
            Err(e) => {
                debug!(error = %e, "Failed to retrieve instance tags through the metadata service.");
                return match &self.tag_describer {
                    Some(describer) => self.describe_auto_scaling_group(describer.as_ref()).await,
                    None => Err(e),
                };
            }
        };

        if tags.iter().any(|key| key == AUTO_SCALING_GROUP_TAG_KEY) {
            let name = self
                .metadata_provider
                .instance_tag_value(AUTO_SCALING_GROUP_TAG_KEY)
                .await
                .error_context("Failed to retrieve auto-scaling group tag value.")?;
            if self.auto_scaling_group.set(name) {
                debug!("Retrieved auto-scaling group through the metadata service.");
            }
        }

        Ok(())
    }

    async fn describe_auto_scaling_group(&self, describer: &dyn TagDescriber) -> Result<(), GenericError> {
        let mut request = DescribeTagsRequest {
            filters: vec![
                TagFilter::new("resource-type", "instance"),
                TagFilter::new("resource-id", self.instance_id()),
                TagFilter::new("key", AUTO_SCALING_GROUP_TAG_KEY),
            ],
            next_token: None,
        };

        loop {
            let page = describer
                .describe_tags(request.clone())
                .await
                .error_context("Failed to describe instance tags.")?;

            if let Some(tag) = page.tags.into_iter().find(|tag| tag.key == AUTO_SCALING_GROUP_TAG_KEY) {
                if self.auto_scaling_group.set(tag.value) {
                    debug!("Retrieved auto-scaling group through DescribeTags.");
                }
                return Ok(());
            }

            match page.next_token {
                Some(next_token) => request.next_token = Some(next_token),
                None => return Ok(()),
            }
        }
    }
}
