use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use entity_common::sync::MutexExt as _;
use entity_error::{generic_error, GenericError};
use indexmap::IndexMap;

use crate::{
    aws::{
        CallerIdentity, CallerIdentityProvider, DescribeTagsPage, DescribeTagsRequest, Ec2ClientFactory,
        TagDescriber,
    },
    config::CredentialConfiguration,
    metadata::{InstanceIdentityDocument, MetadataProvider, ProviderError},
};

/// Polls `condition` until it holds, failing the test after an hour of (usually virtual) time.
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(60 * 60), wait)
        .await
        .expect("condition not met in time");
}

struct MetadataState {
    document: InstanceIdentityDocument,
    identity_failures: usize,
    identity_calls: usize,
    tags: IndexMap<String, String>,
    tag_access: bool,
    tag_calls: usize,
    iam_role: Option<String>,
}

/// In-memory [`MetadataProvider`]. Clones share state.
#[derive(Clone)]
pub struct MockMetadataProvider {
    state: Arc<Mutex<MetadataState>>,
}

impl Default for MockMetadataProvider {
    fn default() -> Self {
        let document = InstanceIdentityDocument {
            instance_id: "i-0123456789abcdef0".to_string(),
            account_id: "123456789012".to_string(),
            region: "us-west-2".to_string(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(MetadataState {
                document,
                identity_failures: 0,
                identity_calls: 0,
                tags: IndexMap::new(),
                tag_access: true,
                tag_calls: 0,
                iam_role: None,
            })),
        }
    }
}

impl MockMetadataProvider {
    pub fn with_instance_id(self, instance_id: &str) -> Self {
        self.state.lock_unpoisoned().document.instance_id = instance_id.to_string();
        self
    }

    pub fn with_tag(self, key: &str, value: impl Into<String>) -> Self {
        self.set_tag(key, value);
        self
    }

    pub fn with_iam_role(self, instance_profile_arn: &str) -> Self {
        self.state.lock_unpoisoned().iam_role = Some(instance_profile_arn.to_string());
        self
    }

    /// Fails the next `failures` identity document requests.
    pub fn failing_identity(self, failures: usize) -> Self {
        self.state.lock_unpoisoned().identity_failures = failures;
        self
    }

    /// Fails instance tag requests, as when tag access is disabled in the instance metadata options.
    pub fn without_tag_access(self) -> Self {
        self.state.lock_unpoisoned().tag_access = false;
        self
    }

    pub fn set_tag(&self, key: &str, value: impl Into<String>) {
        self.state.lock_unpoisoned().tags.insert(key.to_string(), value.into());
    }

    pub fn remove_tag(&self, key: &str) {
        self.state.lock_unpoisoned().tags.shift_remove(key);
    }

    pub fn identity_calls(&self) -> usize {
        self.state.lock_unpoisoned().identity_calls
    }

    pub fn tag_calls(&self) -> usize {
        self.state.lock_unpoisoned().tag_calls
    }
}

#[async_trait]
impl MetadataProvider for MockMetadataProvider {
    async fn get(&self) -> Result<InstanceIdentityDocument, GenericError> {
        let mut state = self.state.lock_unpoisoned();
        state.identity_calls += 1;
        if state.identity_failures > 0 {
            state.identity_failures -= 1;
            return Err(generic_error!("identity document unavailable"));
        }
        Ok(state.document.clone())
    }

    async fn instance_tags(&self) -> Result<Vec<String>, GenericError> {
        let mut state = self.state.lock_unpoisoned();
        state.tag_calls += 1;
        if !state.tag_access {
            return Err(ProviderError::Status {
                operation: "instance tags",
                status: 404,
            }
            .into());
        }
        Ok(state.tags.keys().cloned().collect())
    }

    async fn instance_tag_value(&self, key: &str) -> Result<String, GenericError> {
        let state = self.state.lock_unpoisoned();
        state.tags.get(key).cloned().ok_or_else(|| {
            ProviderError::Status {
                operation: "instance tag value",
                status: 404,
            }
            .into()
        })
    }

    async fn client_iam_role(&self) -> Result<String, GenericError> {
        let state = self.state.lock_unpoisoned();
        state
            .iam_role
            .clone()
            .ok_or_else(|| generic_error!("no instance profile attached"))
    }
}

#[derive(Default)]
struct TagDescriberState {
    pages: VecDeque<DescribeTagsPage>,
    requests: Vec<DescribeTagsRequest>,
}

/// [`TagDescriber`] returning canned pages in order. Clones share state.
#[derive(Clone, Default)]
pub struct MockTagDescriber {
    state: Arc<Mutex<TagDescriberState>>,
}

impl MockTagDescriber {
    pub fn with_pages(pages: Vec<DescribeTagsPage>) -> Self {
        let describer = Self::default();
        describer.state.lock_unpoisoned().pages = pages.into();
        describer
    }

    pub fn requests(&self) -> Vec<DescribeTagsRequest> {
        self.state.lock_unpoisoned().requests.clone()
    }
}

#[async_trait]
impl TagDescriber for MockTagDescriber {
    async fn describe_tags(&self, request: DescribeTagsRequest) -> Result<DescribeTagsPage, GenericError> {
        let mut state = self.state.lock_unpoisoned();
        state.requests.push(request);
        Ok(state.pages.pop_front().unwrap_or_default())
    }
}

struct CallerIdentityState {
    account: Option<String>,
    calls: usize,
}

/// [`CallerIdentityProvider`] with a fixed account. Clones share state.
#[derive(Clone)]
pub struct MockCallerIdentityProvider {
    state: Arc<Mutex<CallerIdentityState>>,
}

impl MockCallerIdentityProvider {
    pub fn new(account: &str) -> Self {
        Self::with_account(Some(account.to_string()))
    }

    pub fn failing() -> Self {
        Self::with_account(None)
    }

    fn with_account(account: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CallerIdentityState { account, calls: 0 })),
        }
    }

    pub fn calls(&self) -> usize {
        self.state.lock_unpoisoned().calls
    }
}

#[async_trait]
impl CallerIdentityProvider for MockCallerIdentityProvider {
    async fn caller_identity(&self) -> Result<CallerIdentity, GenericError> {
        let mut state = self.state.lock_unpoisoned();
        state.calls += 1;
        match &state.account {
            Some(account) => Ok(CallerIdentity {
                account: account.clone(),
            }),
            None => Err(ProviderError::Service {
                operation: "GetCallerIdentity",
                code: "AccessDenied".to_string(),
                message: "not authorized".to_string(),
            }
            .into()),
        }
    }
}

/// [`Ec2ClientFactory`] that hands out a fixed describer, or fails.
pub struct MockEc2ClientFactory {
    describer: Option<MockTagDescriber>,
}

impl MockEc2ClientFactory {
    pub fn new(describer: MockTagDescriber) -> Self {
        Self {
            describer: Some(describer),
        }
    }

    pub fn failing() -> Self {
        Self { describer: None }
    }
}

impl Ec2ClientFactory for MockEc2ClientFactory {
    fn tag_describer(
        &self, _region: &str, _credentials: &CredentialConfiguration,
    ) -> Result<Arc<dyn TagDescriber>, GenericError> {
        match &self.describer {
            Some(describer) => Ok(Arc::new(describer.clone())),
            None => Err(generic_error!("no credential chain available")),
        }
    }
}
