//! Pod lifecycle orchestration.
//!
//! A `Pod` is the sandbox unit: one VM, one proxy control connection,
//! and a set of member containers. It is the outer lifecycle gate —
//! member operations require the pod to be `Running` (kill also
//! accepts `Ready`, as a cleanup path) — and the fan-out point for
//! member creation and deletion.
//!
//! The pod and its members share pod-level context behind an `Arc`:
//! the pod owns the canonical member list, members hold a non-owning
//! handle to pod-held collaborators and read pod state through storage
//! like any other persisted resource.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Cmd, PodConfig};
use crate::constants::{self, DEFAULT_BASE_DIR};
use crate::container::Container;
use crate::device::DeviceResolver;
use crate::drivers::{Agent, Hypervisor, ProcessListOptions, Proxy, Shim, Signal};
use crate::error::{Error, Result};
use crate::state::{Process, State, StatePhase};
use crate::storage::Storage;

// =============================================================================
// Collaborators
// =============================================================================

/// The external services a pod is configured with.
///
/// All are trait objects: the lifecycle core drives them but implements
/// none of them.
#[derive(Clone)]
pub struct Collaborators {
    /// Boots/stops the VM and hotplugs devices.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// In-guest control channel.
    pub agent: Arc<dyn Agent>,
    /// Control-connection multiplexer.
    pub proxy: Arc<dyn Proxy>,
    /// Per-process console bridge.
    pub shim: Arc<dyn Shim>,
    /// Durable resource store.
    pub storage: Arc<dyn Storage>,
    /// Host block-device resolution.
    pub resolver: Arc<dyn DeviceResolver>,
}

/// Pod-level context shared between a pod and its member containers.
pub(crate) struct PodContext {
    pub(crate) id: String,
    pub(crate) base_dir: PathBuf,
    pub(crate) hypervisor: Arc<dyn Hypervisor>,
    pub(crate) agent: Arc<dyn Agent>,
    pub(crate) proxy: Arc<dyn Proxy>,
    pub(crate) shim: Arc<dyn Shim>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) resolver: Arc<dyn DeviceResolver>,
}

impl PodContext {
    fn new(id: String, base_dir: PathBuf, drivers: Collaborators) -> Self {
        Self {
            id,
            base_dir,
            hypervisor: drivers.hypervisor,
            agent: drivers.agent,
            proxy: drivers.proxy,
            shim: drivers.shim,
            storage: drivers.storage,
            resolver: drivers.resolver,
        }
    }

    /// Fetches the pod's persisted state.
    pub(crate) async fn pod_state(&self) -> Result<Option<State>> {
        self.storage.fetch_pod_state(&self.id).await
    }
}

// =============================================================================
// Pod
// =============================================================================

/// The sandbox: one VM plus its member containers.
pub struct Pod {
    ctx: Arc<PodContext>,
    config: PodConfig,
    /// Mirror of the persisted pod state.
    state: State,
    /// Member list: append-only during creation, cleared only on full
    /// teardown.
    containers: Vec<Container>,
}

impl std::fmt::Debug for Pod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pod")
            .field("id", &self.ctx.id)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("containers", &self.containers.len())
            .finish()
    }
}

impl Pod {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Creates a pod: boots the VM, records the proxy URL, persists pod
    /// config and state `Ready`, then creates every member container.
    ///
    /// A failure while creating a member tears down everything already
    /// created (members, VM, persisted resources) and surfaces the
    /// original error.
    pub async fn create(config: PodConfig, drivers: Collaborators) -> Result<Self> {
        config.validate()?;

        // Already exists on disk: reattach instead of booting a second
        // VM or overwriting persisted state. The persisted config is
        // the truth at that point, not the one passed in.
        if drivers.storage.fetch_pod_state(&config.id).await?.is_some() {
            return Self::fetch(&config.id, drivers).await;
        }

        let base_dir = config
            .base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
        let ctx = Arc::new(PodContext::new(config.id.clone(), base_dir, drivers));

        fs::create_dir_all(constants::run_path(&ctx.base_dir, &ctx.id, None))?;
        fs::create_dir_all(constants::config_path(&ctx.base_dir, &ctx.id, None))?;

        ctx.hypervisor.start_vm(&ctx.id).await?;

        let mut pod = Self {
            ctx: ctx.clone(),
            config,
            state: State::new(StatePhase::Ready, String::new()),
            containers: Vec::new(),
        };

        if let Err(e) = pod.commit_create().await {
            pod.cleanup_failed_create().await;
            return Err(e);
        }

        info!(
            pod = %pod.ctx.id,
            containers = pod.containers.len(),
            "pod created"
        );
        Ok(pod)
    }

    async fn commit_create(&mut self) -> Result<()> {
        // The proxy URL recorded here is what every later session is
        // checked against before a shim is spawned.
        let session = self.ctx.proxy.connect(&self.ctx.id, false).await?;
        if let Err(e) = self.ctx.proxy.disconnect().await {
            warn!(pod = %self.ctx.id, error = %e, "proxy disconnect failed");
        }

        self.state = State::new(StatePhase::Ready, session.url);
        self.ctx
            .storage
            .store_pod_config(&self.ctx.id, &self.config)
            .await?;
        self.ctx
            .storage
            .store_pod_state(&self.ctx.id, &self.state)
            .await?;

        for cfg in self.config.containers.clone() {
            let container = Container::create(self.ctx.clone(), cfg).await?;
            self.containers.push(container);
        }
        Ok(())
    }

    /// Best-effort teardown after a failed create; every error here is
    /// logged and swallowed so the original failure stays the one the
    /// caller sees.
    async fn cleanup_failed_create(&mut self) {
        for container in &mut self.containers {
            if let Err(e) = container.kill(Signal::Kill, true).await {
                warn!(
                    pod = %self.ctx.id,
                    container = %container.id(),
                    error = %e,
                    "failed to kill container during pod cleanup"
                );
            }
            if let Err(e) = container.delete().await {
                warn!(
                    pod = %self.ctx.id,
                    container = %container.id(),
                    error = %e,
                    "failed to delete container during pod cleanup"
                );
            }
        }
        self.containers.clear();

        if let Err(e) = self.ctx.hypervisor.stop_vm(&self.ctx.id).await {
            warn!(pod = %self.ctx.id, error = %e, "failed to stop VM during pod cleanup");
        }
        if let Err(e) = self.ctx.storage.delete_pod_resources(&self.ctx.id).await {
            warn!(pod = %self.ctx.id, error = %e, "failed to delete pod resources during pod cleanup");
        }
    }

    /// Rebuilds a pod and its members from storage after a process
    /// restart.
    ///
    /// In-memory objects are caches: this is the only way they come
    /// into existence after a restart, and members whose resources were
    /// deleted are not resurrected. No shim is spawned here.
    pub async fn fetch(pod_id: &str, drivers: Collaborators) -> Result<Self> {
        let config = drivers
            .storage
            .fetch_pod_config(pod_id)
            .await?
            .ok_or_else(|| Error::PodNotFound(pod_id.to_string()))?;
        let state = drivers
            .storage
            .fetch_pod_state(pod_id)
            .await?
            .ok_or_else(|| Error::PodNotFound(pod_id.to_string()))?;

        let base_dir = config
            .base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
        let ctx = Arc::new(PodContext::new(pod_id.to_string(), base_dir, drivers));

        let mut containers = Vec::new();
        for cfg in config.containers.clone() {
            if let Some(container) = Container::fetch(ctx.clone(), cfg).await? {
                containers.push(container);
            }
        }

        info!(
            pod = %pod_id,
            containers = containers.len(),
            "pod reattached from storage"
        );
        Ok(Self {
            ctx,
            config,
            state,
            containers,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Pod ID.
    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    /// Pod configuration.
    pub fn config(&self) -> &PodConfig {
        &self.config
    }

    /// Last known pod state mirror.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Member containers.
    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    /// Looks up a member container.
    pub fn container(&self, container_id: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.id() == container_id)
    }

    fn container_mut(&mut self, container_id: &str) -> Result<&mut Container> {
        self.containers
            .iter_mut()
            .find(|c| c.id() == container_id)
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the pod: guest-side pod setup, then phase `Running`.
    ///
    /// Member containers are started individually afterwards; none of
    /// them can start before this succeeds.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.refresh_state().await?;
        state.valid_transition(StatePhase::Running, &self.ctx.id)?;

        self.ctx.proxy.connect(&self.ctx.id, false).await?;
        let res = self.ctx.agent.start_pod(&self.ctx.id).await;
        self.disconnect_proxy().await;
        res?;

        let mut state = state;
        state.phase = StatePhase::Running;
        self.ctx
            .storage
            .store_pod_state(&self.ctx.id, &state)
            .await?;
        self.state = state;

        info!(pod = %self.ctx.id, "pod started");
        Ok(())
    }

    /// Stops the pod and all its members, then shuts the VM down.
    ///
    /// Idempotent on `Stopped`. A pod still `Ready` skips guest
    /// teardown entirely: members only have dangling shims, which are
    /// reaped through the kill cleanup path.
    pub async fn stop(&mut self) -> Result<()> {
        let mut state = self.refresh_state().await?;
        if state.phase == StatePhase::Stopped {
            return Ok(());
        }
        state.valid_transition(StatePhase::Stopped, &self.ctx.id)?;

        match state.phase {
            StatePhase::Ready => {
                for container in &mut self.containers {
                    if let Err(e) = container.kill(Signal::Kill, true).await {
                        warn!(
                            pod = %self.ctx.id,
                            container = %container.id(),
                            error = %e,
                            "failed to reap container during pod stop"
                        );
                    }
                }
            }
            StatePhase::Running => {
                for container in &mut self.containers {
                    match container.stop().await {
                        Ok(()) => {}
                        // Deleted while the pod ran; nothing to stop.
                        Err(Error::ContainerNotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.ctx.proxy.connect(&self.ctx.id, false).await?;
                let res = self.ctx.agent.stop_pod(&self.ctx.id).await;
                self.disconnect_proxy().await;
                res?;
            }
            StatePhase::Stopped => {}
        }

        self.ctx.hypervisor.stop_vm(&self.ctx.id).await?;

        state.phase = StatePhase::Stopped;
        self.ctx
            .storage
            .store_pod_state(&self.ctx.id, &state)
            .await?;
        self.state = state;

        info!(pod = %self.ctx.id, "pod stopped");
        Ok(())
    }

    /// Deletes the pod and every persisted resource it owns.
    ///
    /// Rejected while `Running`. Member containers are deleted first;
    /// a pod that never started also gets its VM shut down.
    pub async fn delete(&mut self) -> Result<()> {
        let state = self.refresh_state().await?;
        if state.phase == StatePhase::Running {
            return Err(Error::InvalidState {
                id: self.ctx.id.clone(),
                current: state.phase,
                expected: "'ready' or 'stopped'".to_string(),
            });
        }

        for container in &mut self.containers {
            match container.delete().await {
                Ok(()) => {}
                // Already deleted individually.
                Err(Error::ContainerNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if state.phase == StatePhase::Ready {
            if let Err(e) = self.ctx.hypervisor.stop_vm(&self.ctx.id).await {
                warn!(pod = %self.ctx.id, error = %e, "failed to stop VM during pod delete");
            }
        }

        self.ctx.storage.delete_pod_resources(&self.ctx.id).await?;
        self.containers.clear();

        info!(pod = %self.ctx.id, "pod deleted");
        Ok(())
    }

    // =========================================================================
    // Member Operations
    // =========================================================================

    /// Starts a member container.
    pub async fn start_container(&mut self, container_id: &str) -> Result<()> {
        self.container_mut(container_id)?.start().await
    }

    /// Stops a member container.
    pub async fn stop_container(&mut self, container_id: &str) -> Result<()> {
        self.container_mut(container_id)?.stop().await
    }

    /// Runs an additional command inside a member container.
    pub async fn enter_container(&mut self, container_id: &str, cmd: Cmd) -> Result<Process> {
        self.container_mut(container_id)?.enter(cmd).await
    }

    /// Sends a signal to a member container.
    pub async fn kill_container(
        &mut self,
        container_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<()> {
        self.container_mut(container_id)?.kill(signal, all).await
    }

    /// Deletes a member container's persisted resources.
    ///
    /// The member object stays in the pod's list until full teardown;
    /// with its resources gone it simply has no persisted state left.
    pub async fn delete_container(&mut self, container_id: &str) -> Result<()> {
        self.container_mut(container_id)?.delete().await
    }

    /// Lists the processes of a member container.
    pub async fn process_list_container(
        &mut self,
        container_id: &str,
        options: &ProcessListOptions,
    ) -> Result<Vec<u8>> {
        self.container_mut(container_id)?.process_list(options).await
    }

    // =========================================================================
    // State Helpers
    // =========================================================================

    /// Refreshes the in-memory pod state mirror from storage.
    async fn refresh_state(&mut self) -> Result<State> {
        let state = self
            .ctx
            .pod_state()
            .await?
            .ok_or_else(|| Error::PodNotFound(self.ctx.id.clone()))?;
        self.state = state.clone();
        Ok(state)
    }

    async fn disconnect_proxy(&self) {
        if let Err(e) = self.ctx.proxy.disconnect().await {
            warn!(pod = %self.ctx.id, error = %e, "proxy disconnect failed");
        }
    }
}
