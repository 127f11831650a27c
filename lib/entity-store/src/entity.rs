//! Entity descriptors attached to outgoing telemetry.

use std::collections::BTreeMap;

use serde::Serialize;

/// Key attribute holding the entity type.
pub const TYPE_KEY: &str = "Type";

/// Key attribute holding the service name.
pub const NAME_KEY: &str = "Name";

/// Key attribute holding the deployment environment.
pub const ENVIRONMENT_KEY: &str = "Environment";

/// Key attribute holding the AWS account ID.
pub const AWS_ACCOUNT_ID_KEY: &str = "AwsAccountId";

/// Attribute holding the EC2 instance ID.
pub const INSTANCE_ID_KEY: &str = "EC2.InstanceId";

/// Attribute holding the auto-scaling group name.
pub const AUTO_SCALING_GROUP_KEY: &str = "EC2.AutoScalingGroup";

/// Attribute holding the origin of the service name.
pub const SERVICE_NAME_SOURCE_KEY: &str = "AWS.ServiceNameSource";

/// Attribute holding the platform type.
pub const PLATFORM_TYPE_KEY: &str = "PlatformType";

/// Entity type of service entities.
pub const SERVICE_ENTITY_TYPE: &str = "Service";

/// Platform type of EC2 instances.
pub const EC2_PLATFORM: &str = "AWS::EC2";

/// An entity: identifying key attributes plus descriptive attributes.
///
/// Both maps only ever hold non-empty values.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    key_attributes: BTreeMap<String, String>,
    attributes: BTreeMap<String, String>,
}

impl Entity {
    /// Creates a new service entity with only its type set.
    pub fn service() -> Self {
        let mut entity = Self::default();
        entity.add_key_attribute(TYPE_KEY, SERVICE_ENTITY_TYPE);
        entity
    }

    /// Adds a key attribute, unless `value` is empty.
    pub fn add_key_attribute<V: Into<String>>(&mut self, key: &str, value: V) {
        insert_non_empty(&mut self.key_attributes, key, value.into());
    }

    /// Adds an attribute, unless `value` is empty.
    pub fn add_attribute<V: Into<String>>(&mut self, key: &str, value: V) {
        insert_non_empty(&mut self.attributes, key, value.into());
    }

    /// Returns the key attributes.
    pub fn key_attributes(&self) -> &BTreeMap<String, String> {
        &self.key_attributes
    }

    /// Returns the attributes.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Returns the key attribute with the given key.
    pub fn key_attribute(&self, key: &str) -> Option<&str> {
        self.key_attributes.get(key).map(String::as_str)
    }

    /// Returns the attribute with the given key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

fn insert_non_empty(map: &mut BTreeMap<String, String>, key: &str, value: String) {
    if !value.is_empty() {
        map.insert(key.to_string(), value);
    }
}
