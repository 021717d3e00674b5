//! Durable resource store contract.
//!
//! Storage is the single source of truth across process restarts:
//! in-memory `Pod`/`Container` objects are caches rebuilt from it on
//! load, never assumed fresh. Resources are keyed by
//! (pod ID, container ID, resource kind) and each key must be stored
//! atomically.
//!
//! Fetches return `Option`: a missing resource is data (the container
//! was never created, or was deleted), not a failure. Absence of the
//! state resource is the terminal marker after deletion.

use async_trait::async_trait;

use crate::config::{ContainerConfig, Mount, PodConfig};
use crate::device::Device;
use crate::error::Result;
use crate::state::{Process, State};

/// Kinds of persisted resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Pod or container configuration.
    Config,
    /// Lifecycle state.
    State,
    /// Shim-fronted process record.
    Process,
    /// Mount list.
    Mounts,
    /// Device set.
    Devices,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::State => write!(f, "state"),
            Self::Process => write!(f, "process"),
            Self::Mounts => write!(f, "mounts"),
            Self::Devices => write!(f, "devices"),
        }
    }
}

/// Durable key/resource store for pod and container lifecycle data.
#[async_trait]
pub trait Storage: Send + Sync {
    // =========================================================================
    // Pod Resources
    // =========================================================================

    /// Persists a pod configuration.
    async fn store_pod_config(&self, pod_id: &str, config: &PodConfig) -> Result<()>;

    /// Fetches a pod configuration.
    async fn fetch_pod_config(&self, pod_id: &str) -> Result<Option<PodConfig>>;

    /// Persists pod-level state.
    async fn store_pod_state(&self, pod_id: &str, state: &State) -> Result<()>;

    /// Fetches pod-level state.
    async fn fetch_pod_state(&self, pod_id: &str) -> Result<Option<State>>;

    /// Deletes every persisted resource of a pod, including its
    /// containers' resources.
    async fn delete_pod_resources(&self, pod_id: &str) -> Result<()>;

    // =========================================================================
    // Container Resources
    // =========================================================================

    /// Persists a container configuration.
    async fn store_container_config(
        &self,
        pod_id: &str,
        container_id: &str,
        config: &ContainerConfig,
    ) -> Result<()>;

    /// Fetches a container configuration.
    async fn fetch_container_config(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<ContainerConfig>>;

    /// Persists container state.
    async fn store_container_state(
        &self,
        pod_id: &str,
        container_id: &str,
        state: &State,
    ) -> Result<()>;

    /// Fetches container state.
    async fn fetch_container_state(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<State>>;

    /// Persists a container's shim process record.
    async fn store_container_process(
        &self,
        pod_id: &str,
        container_id: &str,
        process: &Process,
    ) -> Result<()>;

    /// Fetches a container's shim process record.
    async fn fetch_container_process(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<Process>>;

    /// Persists a container's mount list.
    async fn store_container_mounts(
        &self,
        pod_id: &str,
        container_id: &str,
        mounts: &[Mount],
    ) -> Result<()>;

    /// Fetches a container's mount list.
    async fn fetch_container_mounts(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<Vec<Mount>>>;

    /// Persists a container's device set.
    async fn store_container_devices(
        &self,
        pod_id: &str,
        container_id: &str,
        devices: &[Device],
    ) -> Result<()>;

    /// Fetches a container's device set.
    async fn fetch_container_devices(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<Vec<Device>>>;

    /// Deletes a container's persisted resources, keeping any kinds in
    /// `exclude`.
    async fn delete_container_resources(
        &self,
        pod_id: &str,
        container_id: &str,
        exclude: &[Resource],
    ) -> Result<()>;
}
