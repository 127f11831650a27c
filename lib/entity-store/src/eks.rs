//! Kubernetes pod to service mappings.

use std::{num::NonZeroUsize, time::Duration};

use entity_common::cache::{CacheBuilder, ExpiringCache};
use entity_error::GenericError;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Maximum number of entries in each cache.
pub const POD_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(capacity) => capacity,
    None => unreachable!(),
};

/// Time after its last write that an entry expires.
pub const POD_CACHE_TIME_TO_LIVE: Duration = Duration::from_secs(5 * 60);

/// Service and environment of a pod.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEnvironment {
    /// Service name.
    pub service_name: String,

    /// Environment.
    pub environment: String,

    /// Origin of the service name.
    pub service_name_source: String,
}

/// Service, environment, and placement of the pod behind a source IP.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIpServiceEnvironment {
    /// Service name.
    pub service_name: String,

    /// Environment.
    pub environment: String,

    /// Origin of the service name.
    pub service_name_source: String,

    /// Cluster name.
    pub cluster: String,

    /// Namespace of the pod.
    pub namespace: String,

    /// Workload that owns the pod.
    pub workload: String,

    /// Node the pod runs on.
    pub node: String,

    /// Instance ID of the node.
    pub instance_id: String,
}

/// Service mappings for pods, keyed by pod name and by pod IP.
///
/// Both caches hold at most [`POD_CACHE_CAPACITY`] entries, and an entry expires [`POD_CACHE_TIME_TO_LIVE`] after it
/// was last written. Pods that keep being written to never expire.
#[derive(Clone)]
pub struct EksInfo {
    pod_to_service_environment: ExpiringCache<String, ServiceEnvironment>,
    pod_ip_to_service_environment: ExpiringCache<String, PodIpServiceEnvironment>,
}

impl EksInfo {
    /// Creates a new `EksInfo` with empty caches.
    ///
    /// # Errors
    ///
    /// If the caches cannot be built, an error is returned.
    pub fn new() -> Result<Self, GenericError> {
        Ok(Self {
            pod_to_service_environment: CacheBuilder::from_identifier("pod-service-environment")?
                .with_capacity(POD_CACHE_CAPACITY)
                .with_time_to_live(Some(POD_CACHE_TIME_TO_LIVE))
                .build(),
            pod_ip_to_service_environment: CacheBuilder::from_identifier("pod-ip-service-environment")?
                .with_capacity(POD_CACHE_CAPACITY)
                .with_time_to_live(Some(POD_CACHE_TIME_TO_LIVE))
                .build(),
        })
    }

    /// Maps a pod to a service and environment, replacing any existing mapping and resetting its expiration.
    pub fn add_pod_service_environment_mapping(
        &self, pod_name: String, service_name: String, environment: String, service_name_source: String,
    ) {
        self.pod_to_service_environment.insert(
            pod_name,
            ServiceEnvironment {
                service_name,
                environment,
                service_name_source,
            },
        );
    }

    /// Maps a pod IP to a service and environment, replacing any existing mapping and resetting its expiration.
    pub fn add_pod_ip_service_environment_mapping(&self, pod_ip: String, mapping: PodIpServiceEnvironment) {
        self.pod_ip_to_service_environment.insert(pod_ip, mapping);
    }

    /// Returns the live pod name cache.
    pub fn pod_service_environment_mapping(&self) -> ExpiringCache<String, ServiceEnvironment> {
        self.pod_to_service_environment.clone()
    }

    /// Returns the live pod IP cache.
    pub fn pod_ip_service_environment_mapping(&self) -> ExpiringCache<String, PodIpServiceEnvironment> {
        self.pod_ip_to_service_environment.clone()
    }

    /// Spawns the expiration tasks for both caches.
    pub fn spawn_expiration(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.pod_to_service_environment.spawn_expiration(shutdown.clone()),
            self.pod_ip_to_service_environment.spawn_expiration(shutdown.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{advance, Instant};

    use super::*;

    fn add(info: &EksInfo, pod: &str, service: &str) {
        info.add_pod_service_environment_mapping(
            pod.to_string(),
            service.to_string(),
            "eks:cluster/default".to_string(),
            "K8sWorkload".to_string(),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_refreshes_expiration() {
        let info = EksInfo::new().unwrap();
        let cache = info.pod_service_environment_mapping();

        add(&info, "pod-1", "service-a");
        advance(Duration::from_secs(4 * 60)).await;
        add(&info, "pod-1", "service-b");

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.expires_at(&"pod-1".to_string()),
            Some(Instant::now() + POD_CACHE_TIME_TO_LIVE)
        );

        advance(Duration::from_secs(4 * 60)).await;
        let mapping = cache.get(&"pod-1".to_string()).unwrap();
        assert_eq!(mapping.service_name, "service-b");

        advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&"pod-1".to_string()), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_most_recently_written() {
        let info = EksInfo::new().unwrap();
        for i in 0..300 {
            add(&info, &format!("pod-{}", i), "service");
        }

        let cache = info.pod_service_environment_mapping();
        assert_eq!(cache.len(), 256);
        assert_eq!(cache.get(&"pod-43".to_string()), None);
        assert!(cache.get(&"pod-44".to_string()).is_some());
        assert!(cache.get(&"pod-299".to_string()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_sees_later_writes() {
        let info = EksInfo::new().unwrap();
        let cache = info.pod_service_environment_mapping();

        add(&info, "pod-1", "service-a");
        add(&info, "pod-2", "service-b");

        let pods = cache.snapshot().into_iter().map(|(pod, _)| pod).collect::<Vec<_>>();
        assert_eq!(pods, vec!["pod-1", "pod-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn serializes_to_json() {
        let info = EksInfo::new().unwrap();
        add(&info, "pod-1", "service-a");
        info.add_pod_ip_service_environment_mapping(
            "10.0.0.1".to_string(),
            PodIpServiceEnvironment {
                service_name: "service-a".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
        );

        let pods = serde_json::to_value(info.pod_service_environment_mapping()).unwrap();
        assert_eq!(
            pods,
            serde_json::json!({
                "pod-1": {
                    "serviceName": "service-a",
                    "environment": "eks:cluster/default",
                    "serviceNameSource": "K8sWorkload",
                }
            })
        );

        let ips = serde_json::to_value(info.pod_ip_service_environment_mapping()).unwrap();
        assert_eq!(ips["10.0.0.1"]["namespace"], "default");
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_tasks_stop_on_shutdown() {
        let info = EksInfo::new().unwrap();
        let shutdown = CancellationToken::new();
        let tasks = info.spawn_expiration(&shutdown);

        add(&info, "pod-1", "service-a");
        advance(POD_CACHE_TIME_TO_LIVE + Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(info.pod_service_environment_mapping().is_empty());
    }
}
