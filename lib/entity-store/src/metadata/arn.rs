use std::str::FromStr;

use snafu::Snafu;

const ARN_PREFIX: &str = "arn:";
const ARN_SECTIONS: usize = 6;

/// An ARN parsing error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ArnError {
    /// The value does not start with `arn:`.
    #[snafu(display("ARN must start with '{}'.", ARN_PREFIX))]
    InvalidPrefix,

    /// The value has fewer than six colon-separated sections.
    #[snafu(display("ARN must have {} colon-separated sections, found {}.", ARN_SECTIONS, found))]
    NotEnoughSections {
        /// Number of sections found.
        found: usize,
    },
}

/// A parsed Amazon Resource Name.
///
/// ARNs have the form `arn:partition:service:region:account-id:resource`. The resource section may itself contain
/// colons, so everything after the fifth colon belongs to it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Arn {
    /// Partition, such as `aws` or `aws-cn`.
    pub partition: String,

    /// Service namespace, such as `iam`.
    pub service: String,

    /// Region. Empty for global services.
    pub region: String,

    /// Owning account ID.
    pub account_id: String,

    /// Resource, such as `instance-profile/my-role`.
    pub resource: String,
}

impl Arn {
    /// Parses an ARN.
    ///
    /// # Errors
    ///
    /// If `value` is not prefixed with `arn:`, or has too few sections, an error is returned.
    pub fn parse(value: &str) -> Result<Self, ArnError> {
        if !value.starts_with(ARN_PREFIX) {
            return Err(ArnError::InvalidPrefix);
        }

        let sections = value.splitn(ARN_SECTIONS, ':').collect::<Vec<_>>();
        if sections.len() != ARN_SECTIONS {
            return Err(ArnError::NotEnoughSections { found: sections.len() });
        }

        Ok(Self {
            partition: sections[1].to_string(),
            service: sections[2].to_string(),
            region: sections[3].to_string(),
            account_id: sections[4].to_string(),
            resource: sections[5].to_string(),
        })
    }
}

impl FromStr for Arn {
    type Err = ArnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
