//! Instance metadata.
//!
//! [`MetadataProvider`] is the seam between the refreshers and the instance metadata service. The refreshers only ever
//! see the four operations below, which keeps them testable against in-memory fakes. [`ImdsMetadataProvider`] is the
//! real implementation, talking to IMDS over HTTP.

use async_trait::async_trait;
use entity_error::GenericError;
use serde::Deserialize;
use snafu::Snafu;

mod arn;
pub use self::arn::{Arn, ArnError};

mod imds;
pub use self::imds::{ImdsConfiguration, ImdsMetadataProvider};

/// Error codes that mark a failure as transient.
///
/// These are the throttling and server-side codes returned by AWS services. Any other code points at a problem that
/// retrying will not fix, such as missing permissions.
pub const RETRYABLE_ERROR_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
];

/// A metadata or AWS API failure.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ProviderError {
    /// The request could not be sent, or no response was received.
    #[snafu(display("Failed to send request for {}.", operation))]
    Transport {
        /// Operation being performed.
        operation: &'static str,

        /// Error source.
        source: reqwest::Error,
    },

    /// The endpoint answered with a non-success HTTP status.
    #[snafu(display("Request for {} failed with HTTP status {}.", operation, status))]
    Status {
        /// Operation being performed.
        operation: &'static str,

        /// HTTP status code.
        status: u16,
    },

    /// The response body could not be decoded.
    #[snafu(display("Failed to decode response for {}.", operation))]
    Decode {
        /// Operation being performed.
        operation: &'static str,

        /// Error source.
        source: GenericError,
    },

    /// The service rejected the request with an error code.
    #[snafu(display("{} failed with error code '{}': {}", operation, code, message))]
    Service {
        /// Operation being performed.
        operation: &'static str,

        /// Error code returned by the service.
        code: String,

        /// Error message returned by the service.
        message: String,
    },
}

impl ProviderError {
    /// Returns the service error code, if the service returned one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns `true` if retrying the request may succeed.
    ///
    /// Failures without a service error code, such as transport failures, are always considered retryable.
    pub fn is_retryable(&self) -> bool {
        self.code().map_or(true, |code| RETRYABLE_ERROR_CODES.contains(&code))
    }
}

/// The instance identity document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentityDocument {
    /// Instance ID.
    pub instance_id: String,

    /// ID of the account that owns the instance.
    pub account_id: String,

    /// Region the instance runs in.
    pub region: String,

    /// Availability zone the instance runs in.
    #[serde(default)]
    pub availability_zone: String,

    /// Instance type.
    #[serde(default)]
    pub instance_type: String,

    /// ID of the image the instance was launched from.
    #[serde(default)]
    pub image_id: String,
}

/// Source of instance metadata.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Gets the instance identity document.
    async fn get(&self) -> Result<InstanceIdentityDocument, GenericError>;

    /// Gets the keys of all tags attached to the instance.
    ///
    /// Only available when tag access is enabled in the instance's metadata options.
    async fn instance_tags(&self) -> Result<Vec<String>, GenericError>;

    /// Gets the value of the instance tag with the given key.
    async fn instance_tag_value(&self, key: &str) -> Result<String, GenericError>;

    /// Gets the ARN of the instance profile attached to the instance.
    async fn client_iam_role(&self) -> Result<String, GenericError>;
}
