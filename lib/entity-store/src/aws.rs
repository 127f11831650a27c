//! AWS API seams.
//!
//! Signed AWS API clients are supplied by the embedding process. The store only needs one EC2 call and one STS call,
//! described by the traits here.

use std::sync::Arc;

use async_trait::async_trait;
use entity_error::GenericError;

use crate::config::CredentialConfiguration;

/// A filter for [`TagDescriber::describe_tags`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TagFilter {
    /// Filter name, such as `resource-id`.
    pub name: String,

    /// Accepted values.
    pub values: Vec<String>,
}

impl TagFilter {
    /// Creates a filter matching a single value.
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }
}

/// A request for one page of EC2 tags.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeTagsRequest {
    /// Filters that every returned tag matches.
    pub filters: Vec<TagFilter>,

    /// Pagination token from the previous page, if any.
    pub next_token: Option<String>,
}

/// A single EC2 tag.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TagDescription {
    /// Tag key.
    pub key: String,

    /// Tag value.
    pub value: String,
}

/// One page of EC2 tags.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeTagsPage {
    /// Tags on this page.
    pub tags: Vec<TagDescription>,

    /// Token for the next page, or `None` if this is the last page.
    pub next_token: Option<String>,
}

/// The EC2 `DescribeTags` API.
#[async_trait]
pub trait TagDescriber: Send + Sync {
    /// Fetches one page of tags.
    async fn describe_tags(&self, request: DescribeTagsRequest) -> Result<DescribeTagsPage, GenericError>;
}

/// Identity of the caller, as reported by STS.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallerIdentity {
    /// Account ID the credentials belong to.
    pub account: String,
}

/// The STS `GetCallerIdentity` API, called with the agent's native credentials.
#[async_trait]
pub trait CallerIdentityProvider: Send + Sync {
    /// Gets the identity of the caller.
    async fn caller_identity(&self) -> Result<CallerIdentity, GenericError>;
}

/// Builds EC2 API clients.
pub trait Ec2ClientFactory: Send + Sync {
    /// Builds a `DescribeTags` client for the given region.
    ///
    /// # Errors
    ///
    /// If no credential chain can be built from `credentials`, an error is returned.
    fn tag_describer(
        &self, region: &str, credentials: &CredentialConfiguration,
    ) -> Result<Arc<dyn TagDescriber>, GenericError>;
}
