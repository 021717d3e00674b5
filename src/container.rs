//! Container lifecycle orchestration.
//!
//! A `Container` coordinates four collaborators around every
//! transition: the proxy (session bracketing), the agent (guest-side
//! commands), the shim (host-side console bridge), and the hypervisor
//! (device hotplug). Each state-dependent operation runs a two-level
//! gate first — fetch pod state, then fetch container state and
//! validate the transition — so illegal requests are rejected before
//! any collaborator is touched.
//!
//! ```text
//!   create ──► shim spawned, phase Ready persisted
//!   start  ──► proxy connect ─ hotplug? ─ attach ─ agent start ─ Running
//!                   │                                   │
//!                   └── disconnect on every path        └─ on failure:
//!                                                          best-effort stop,
//!                                                          original error kept
//!   stop   ──► agent kill ─ shim wait (bounded) ─ agent stop ─ detach ─
//!              unplug (flag-gated) ─ Stopped; orphan shim reaped regardless
//! ```
//!
//! On-disk state is the source of truth: the in-memory `State` mirror
//! is refreshed from storage before every operation, which is what
//! makes create idempotent across process restarts (reattachment).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{Cmd, ContainerConfig, Mount};
use crate::constants::{self, SHIM_WAIT_TIMEOUT};
use crate::device::{BlockDrive, Device};
use crate::drivers::{ProcessListOptions, ProxySession, ShimParams, Signal};
use crate::error::{Error, Result};
use crate::pod::PodContext;
use crate::state::{Process, State, StatePhase};

/// A single workload process group inside the pod's VM, lifecycle-
/// managed independently of its siblings.
///
/// Holds a non-owning handle to pod-level context (`Arc<PodContext>`);
/// the pod owns the canonical member list, while the container only
/// reads pod state through storage and invokes pod-held collaborators.
pub struct Container {
    ctx: Arc<PodContext>,
    id: String,
    config: ContainerConfig,
    /// Mirror of the persisted state; `None` until first persisted.
    state: Option<State>,
    /// Shim process record; empty until a shim is started.
    process: Option<Process>,
    mounts: Vec<Mount>,
    devices: Vec<Device>,
    run_path: PathBuf,
    config_path: PathBuf,
}

impl Container {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Creates a container in the pod, or reattaches to one that
    /// already exists on disk.
    ///
    /// The reattachment path supports process restart without losing
    /// guest-side resources: when a persisted phase exists the
    /// container is returned as-is, with no shim restart. Only a
    /// genuinely new container spawns a shim and persists phase
    /// `Ready`. A failure during first creation leaves nothing behind,
    /// so the caller never registers a half-created member.
    pub(crate) async fn create(ctx: Arc<PodContext>, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        let mut container = Self::rehydrate(ctx, config).await?;
        container.create_dirs().await?;

        if container.state.is_some() {
            debug!(
                pod = %container.ctx.id,
                container = %container.id,
                "reattached container from persisted state"
            );
            return Ok(container);
        }

        container.first_create().await?;
        Ok(container)
    }

    /// Rebuilds a container from persisted resources during pod load.
    ///
    /// Returns `None` when no persisted phase exists (the container was
    /// deleted); unlike [`Container::create`] this never spawns a shim.
    pub(crate) async fn fetch(
        ctx: Arc<PodContext>,
        config: ContainerConfig,
    ) -> Result<Option<Self>> {
        config.validate()?;
        let mut container = Self::rehydrate(ctx, config).await?;
        if container.state.is_none() {
            return Ok(None);
        }
        container.create_dirs().await?;
        Ok(Some(container))
    }

    /// Builds the in-memory container, pulling any previously persisted
    /// state, process, mounts, and devices.
    ///
    /// The persisted device set takes precedence over re-instantiation
    /// from `DeviceInfo`s: handles for resources that already exist in
    /// the guest must not be rebuilt from scratch.
    async fn rehydrate(ctx: Arc<PodContext>, config: ContainerConfig) -> Result<Self> {
        let id = config.id.clone();
        let state = ctx.storage.fetch_container_state(&ctx.id, &id).await?;
        let process = ctx.storage.fetch_container_process(&ctx.id, &id).await?;
        let mounts = match ctx.storage.fetch_container_mounts(&ctx.id, &id).await? {
            Some(mounts) => mounts,
            None => config.mounts.clone(),
        };
        let devices = match ctx.storage.fetch_container_devices(&ctx.id, &id).await? {
            Some(devices) => devices,
            None => config
                .devices
                .iter()
                .cloned()
                .map(Device::from_info)
                .collect(),
        };

        let run_path = constants::run_path(&ctx.base_dir, &ctx.id, Some(&id));
        let config_path = constants::config_path(&ctx.base_dir, &ctx.id, Some(&id));

        Ok(Self {
            ctx,
            id,
            config,
            state,
            process,
            mounts,
            devices,
            run_path,
            config_path,
        })
    }

    /// Creates the run and config directories.
    ///
    /// A failure on the config directory rolls back any resources
    /// already persisted for this container before surfacing the error.
    async fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.run_path)?;
        if let Err(e) = fs::create_dir_all(&self.config_path) {
            if let Err(del_err) = self
                .ctx
                .storage
                .delete_container_resources(&self.ctx.id, &self.id, &[])
                .await
            {
                warn!(
                    pod = %self.ctx.id,
                    container = %self.id,
                    error = %del_err,
                    "rollback of persisted resources failed"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// First-creation path: persist the config, spawn the shim, persist
    /// the process and phase `Ready`.
    async fn first_create(&mut self) -> Result<()> {
        let res = self.first_create_inner().await;
        if res.is_err() {
            // Creation failed after resources may have been persisted;
            // remove them so a retry starts from a clean slate.
            if let Err(del_err) = self
                .ctx
                .storage
                .delete_container_resources(&self.ctx.id, &self.id, &[])
                .await
            {
                warn!(
                    pod = %self.ctx.id,
                    container = %self.id,
                    error = %del_err,
                    "cleanup of partially created container failed"
                );
            }
        }
        res
    }

    async fn first_create_inner(&mut self) -> Result<()> {
        self.ctx
            .storage
            .store_container_config(&self.ctx.id, &self.id, &self.config)
            .await?;

        let session = self.ctx.proxy.connect(&self.ctx.id, false).await?;
        let spawned = self.spawn_shim(&session, &self.config.cmd).await;
        self.disconnect_proxy().await;
        let process = spawned?;

        self.ctx
            .storage
            .store_container_process(&self.ctx.id, &self.id, &process)
            .await?;
        self.process = Some(process);

        let state = State::new(StatePhase::Ready, session.url);
        self.ctx
            .storage
            .store_container_state(&self.ctx.id, &self.id, &state)
            .await?;
        self.state = Some(state);

        info!(pod = %self.ctx.id, container = %self.id, "container created");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Container ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning pod ID.
    pub fn pod_id(&self) -> &str {
        &self.ctx.id
    }

    /// Container configuration.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Last known state mirror, if any phase has been persisted.
    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// Shim process record, if a shim has been started.
    pub fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    /// Mount list.
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Device set.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Runtime resource directory.
    pub fn run_path(&self) -> &Path {
        &self.run_path
    }

    /// Persistent config directory.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the container's workload in the guest.
    ///
    /// Requires the pod `Running` and the container `Ready` or
    /// `Stopped`. When both the agent and the hypervisor support block
    /// hotplug, the rootfs is hotplugged as a drive first. If the agent
    /// start fails, a best-effort stop releases anything partially
    /// started and the original error is surfaced.
    pub async fn start(&mut self) -> Result<()> {
        self.require_pod_running().await?;
        let state = self.refresh_state().await?;
        state.valid_transition(StatePhase::Running, &self.id)?;

        self.ctx.proxy.connect(&self.ctx.id, false).await?;
        let res = self.start_inner(state).await;
        self.disconnect_proxy().await;

        if let Err(err) = res {
            if let Err(stop_err) = self.stop().await {
                warn!(
                    pod = %self.ctx.id,
                    container = %self.id,
                    error = %stop_err,
                    "compensating stop failed"
                );
            }
            return Err(err);
        }

        info!(pod = %self.ctx.id, container = %self.id, "container started");
        Ok(())
    }

    async fn start_inner(&mut self, mut state: State) -> Result<()> {
        let agent_caps = self.ctx.agent.capabilities();
        let hv_caps = self.ctx.hypervisor.capabilities();
        if agent_caps.block_device && hv_caps.block_hotplug {
            self.hotplug_rootfs_drive(&mut state).await?;
        }

        for device in &mut self.devices {
            device.attach(&self.ctx.id, self.ctx.hypervisor.as_ref()).await?;
        }

        let process = self
            .process
            .clone()
            .ok_or_else(|| Error::Shim(format!("container '{}' has no shim process", self.id)))?;
        self.ctx
            .agent
            .start_container(&self.ctx.id, &self.id, &self.config, &process)
            .await?;

        // State is the last thing written: a failure above leaves the
        // persisted phase untouched.
        self.ctx
            .storage
            .store_container_mounts(&self.ctx.id, &self.id, &self.mounts)
            .await?;
        self.ctx
            .storage
            .store_container_devices(&self.ctx.id, &self.id, &self.devices)
            .await?;
        state.phase = StatePhase::Running;
        self.ctx
            .storage
            .store_container_state(&self.ctx.id, &self.id, &state)
            .await?;
        self.state = Some(state);
        Ok(())
    }

    /// Hotplugs the container rootfs as a block drive.
    ///
    /// Skips silently when no mount backs the rootfs or the backing
    /// volume is not device-mapper; otherwise persists the hotplug
    /// flag, assigned block index, and filesystem type so stop can undo
    /// exactly what was plugged.
    async fn hotplug_rootfs_drive(&self, state: &mut State) -> Result<()> {
        let mount = match self.ctx.resolver.device_for_path(&self.config.rootfs).await {
            Ok(mount) => mount,
            Err(Error::MountNotFound { path }) => {
                debug!(
                    pod = %self.ctx.id,
                    container = %self.id,
                    rootfs = %path.display(),
                    "no mount backs rootfs, skipping drive hotplug"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self
            .ctx
            .resolver
            .is_device_mapper(mount.major, mount.minor)
            .await?
        {
            debug!(
                pod = %self.ctx.id,
                container = %self.id,
                "rootfs not device-mapper backed, skipping drive hotplug"
            );
            return Ok(());
        }

        let (device_path, fstype) = self
            .ctx
            .resolver
            .device_path_and_fstype(&mount.mount_point)
            .await?;
        let drive = BlockDrive {
            device_path,
            index: 0,
        };
        let index = self.ctx.hypervisor.hotplug_add_drive(&self.ctx.id, &drive).await?;

        state.hotplugged_drive = true;
        state.block_index = Some(index);
        state.fstype = fstype;
        self.ctx
            .storage
            .store_container_state(&self.ctx.id, &self.id, state)
            .await?;

        info!(pod = %self.ctx.id, container = %self.id, index, "rootfs drive hotplugged");
        Ok(())
    }

    /// Stops the container's workload.
    ///
    /// Idempotent: a container already `Stopped` succeeds with no agent
    /// call, which absorbs double-stop races such as an implicit stop
    /// after the guest process exited on its own. A `Ready` container
    /// that never started transitions directly to `Stopped` without
    /// agent interaction. Whatever happens, a still-live shim is reaped
    /// before returning so no orphan stays bound to a dead container.
    pub async fn stop(&mut self) -> Result<()> {
        let mut state = self.refresh_state().await?;
        if state.phase == StatePhase::Stopped {
            return Ok(());
        }

        self.require_pod_running().await?;
        state.valid_transition(StatePhase::Stopped, &self.id)?;

        let res = if state.phase == StatePhase::Ready {
            // Never started: only release what a failed start may have
            // plugged in; nothing runs in the guest.
            self.release_guest_resources(&mut state).await
        } else {
            match self.ctx.proxy.connect(&self.ctx.id, false).await {
                Ok(_) => {
                    let res = self.stop_running(&mut state).await;
                    self.disconnect_proxy().await;
                    res
                }
                Err(e) => Err(e),
            }
        };

        self.reap_shim().await;
        res?;

        state.phase = StatePhase::Stopped;
        self.ctx
            .storage
            .store_container_state(&self.ctx.id, &self.id, &state)
            .await?;
        self.state = Some(state);

        info!(pod = %self.ctx.id, container = %self.id, "container stopped");
        Ok(())
    }

    async fn stop_running(&mut self, state: &mut State) -> Result<()> {
        // Force-kill the workload first so the shim can drain and exit.
        self.ctx
            .agent
            .kill_container(&self.ctx.id, &self.id, Signal::Kill, true)
            .await?;

        if let Some(process) = &self.process {
            match timeout(SHIM_WAIT_TIMEOUT, self.ctx.shim.wait(process.pid)).await {
                Ok(waited) => waited?,
                Err(_) => {
                    // The reap below will terminate it.
                    warn!(
                        pod = %self.ctx.id,
                        container = %self.id,
                        pid = process.pid,
                        timeout = ?SHIM_WAIT_TIMEOUT,
                        "shim did not exit in time"
                    );
                }
            }
        }

        self.ctx.agent.stop_container(&self.ctx.id, &self.id).await?;
        self.release_guest_resources(state).await
    }

    /// Detaches attached devices and unplugs the rootfs drive when one
    /// was actually hotplugged; a skipped hotplug never becomes a
    /// spurious unplug.
    async fn release_guest_resources(&mut self, state: &mut State) -> Result<()> {
        for device in &mut self.devices {
            device.detach(&self.ctx.id, self.ctx.hypervisor.as_ref()).await?;
        }
        self.ctx
            .storage
            .store_container_devices(&self.ctx.id, &self.id, &self.devices)
            .await?;

        if state.hotplugged_drive {
            // Unplug is keyed by the guest index assigned at hotplug.
            let drive = BlockDrive {
                device_path: PathBuf::new(),
                index: state.block_index.unwrap_or(0),
            };
            self.ctx
                .hypervisor
                .hotplug_remove_drive(&self.ctx.id, &drive)
                .await?;
            state.hotplugged_drive = false;
            state.block_index = None;
            state.fstype.clear();
        }
        Ok(())
    }

    /// Runs an additional command inside the running container.
    ///
    /// Connects an interactive proxy session, spawns a fresh shim bound
    /// to the new command, and issues the agent exec. The returned
    /// [`Process`] correlates the new session, shim, and guest process.
    pub async fn enter(&mut self, cmd: Cmd) -> Result<Process> {
        self.require_pod_running().await?;
        let state = self.refresh_state().await?;
        if state.phase != StatePhase::Running {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                current: state.phase,
                expected: "'running'".to_string(),
            });
        }

        let session = self.ctx.proxy.connect(&self.ctx.id, true).await?;
        let res = self.enter_inner(&session, &cmd).await;
        self.disconnect_proxy().await;
        let process = res?;

        info!(
            pod = %self.ctx.id,
            container = %self.id,
            pid = process.pid,
            "entered container"
        );
        Ok(process)
    }

    async fn enter_inner(&self, session: &ProxySession, cmd: &Cmd) -> Result<Process> {
        let process = self.spawn_shim(session, cmd).await?;
        self.ctx
            .agent
            .exec(&self.ctx.id, &self.id, &process, cmd)
            .await?;
        Ok(process)
    }

    /// Sends a signal to the container's workload.
    ///
    /// Works as a cleanup path too: the pod may be `Ready` or
    /// `Running`. On a never-started container a fatal signal
    /// degenerates into reaping the dangling shim and marking the
    /// container `Stopped` — nothing runs in the guest yet, so no agent
    /// call is made — while any other signal is a no-op.
    pub async fn kill(&mut self, signal: Signal, all: bool) -> Result<()> {
        let pod_phase = self.pod_phase().await?;
        if !matches!(pod_phase, StatePhase::Ready | StatePhase::Running) {
            return Err(Error::InvalidState {
                id: self.ctx.id.clone(),
                current: pod_phase,
                expected: "'ready' or 'running'".to_string(),
            });
        }

        let mut state = self.refresh_state().await?;
        match state.phase {
            StatePhase::Ready => {
                if !signal.is_fatal() {
                    return Ok(());
                }
                state.valid_transition(StatePhase::Stopped, &self.id)?;
                self.reap_shim().await;
                state.phase = StatePhase::Stopped;
                self.ctx
                    .storage
                    .store_container_state(&self.ctx.id, &self.id, &state)
                    .await?;
                self.state = Some(state);
                info!(
                    pod = %self.ctx.id,
                    container = %self.id,
                    %signal,
                    "killed never-started container"
                );
                Ok(())
            }
            StatePhase::Running => {
                self.ctx.proxy.connect(&self.ctx.id, false).await?;
                let res = self
                    .ctx
                    .agent
                    .kill_container(&self.ctx.id, &self.id, signal, all)
                    .await;
                self.disconnect_proxy().await;
                res
            }
            StatePhase::Stopped => Err(Error::InvalidState {
                id: self.id.clone(),
                current: state.phase,
                expected: "'ready' or 'running'".to_string(),
            }),
        }
    }

    /// Deletes the container's persisted resources.
    ///
    /// Permitted only from `Ready` or `Stopped`. There is no `Deleted`
    /// phase: absence of the resources is the terminal marker.
    pub async fn delete(&mut self) -> Result<()> {
        let state = self.refresh_state().await?;
        if state.phase == StatePhase::Running {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                current: state.phase,
                expected: "'ready' or 'stopped'".to_string(),
            });
        }

        self.reap_shim().await;
        self.ctx
            .storage
            .delete_container_resources(&self.ctx.id, &self.id, &[])
            .await?;
        self.state = None;
        self.process = None;

        info!(pod = %self.ctx.id, container = %self.id, "container deleted");
        Ok(())
    }

    /// Lists the processes of the running container.
    pub async fn process_list(&mut self, options: &ProcessListOptions) -> Result<Vec<u8>> {
        self.require_pod_running().await?;
        let state = self.refresh_state().await?;
        if state.phase != StatePhase::Running {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                current: state.phase,
                expected: "'running'".to_string(),
            });
        }

        self.ctx.proxy.connect(&self.ctx.id, false).await?;
        let res = self
            .ctx
            .agent
            .process_list(&self.ctx.id, &self.id, options)
            .await;
        self.disconnect_proxy().await;
        res
    }

    // =========================================================================
    // Shim
    // =========================================================================

    /// Spawns a shim for a proxy session, shared by create and enter.
    ///
    /// The session URL must match the pod's recorded URL; a mismatch
    /// means a stale or foreign proxy session and is fatal.
    async fn spawn_shim(&self, session: &ProxySession, cmd: &Cmd) -> Result<Process> {
        let pod_state = self
            .ctx
            .pod_state()
            .await?
            .ok_or_else(|| Error::PodNotFound(self.ctx.id.clone()))?;
        if session.url != pod_state.url {
            return Err(Error::UrlMismatch {
                expected: pod_state.url,
                actual: session.url.clone(),
            });
        }

        let params = ShimParams {
            container_id: self.id.clone(),
            token: session.token.clone(),
            url: session.url.clone(),
            console: cmd.console.clone(),
            detach: cmd.detach,
        };
        let pid = self.ctx.shim.start(&self.ctx.id, &params).await?;

        debug!(pod = %self.ctx.id, container = %self.id, pid, "shim started");
        Ok(Process::new(&session.token, pid))
    }

    /// Best-effort termination of a still-live shim.
    async fn reap_shim(&self) {
        let Some(process) = &self.process else {
            return;
        };
        match self.ctx.shim.is_running(process.pid).await {
            Ok(true) => {
                if let Err(e) = self.ctx.shim.stop(process.pid).await {
                    warn!(
                        pod = %self.ctx.id,
                        container = %self.id,
                        pid = process.pid,
                        error = %e,
                        "failed to terminate shim"
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    pod = %self.ctx.id,
                    container = %self.id,
                    pid = process.pid,
                    error = %e,
                    "could not query shim"
                );
            }
        }
    }

    // =========================================================================
    // State Helpers
    // =========================================================================

    /// Refreshes the in-memory state mirror from storage.
    async fn refresh_state(&mut self) -> Result<State> {
        let state = self
            .ctx
            .storage
            .fetch_container_state(&self.ctx.id, &self.id)
            .await?
            .ok_or_else(|| Error::ContainerNotFound(self.id.clone()))?;
        self.state = Some(state.clone());
        Ok(state)
    }

    /// Fetches the owning pod's phase from storage.
    async fn pod_phase(&self) -> Result<StatePhase> {
        let state = self
            .ctx
            .pod_state()
            .await?
            .ok_or_else(|| Error::PodNotFound(self.ctx.id.clone()))?;
        Ok(state.phase)
    }

    /// Two-level gate, pod half: the sandbox must be `Running` before a
    /// member container can be operated on.
    async fn require_pod_running(&self) -> Result<()> {
        let phase = self.pod_phase().await?;
        if phase != StatePhase::Running {
            return Err(Error::InvalidState {
                id: self.ctx.id.clone(),
                current: phase,
                expected: "'running'".to_string(),
            });
        }
        Ok(())
    }

    /// Disconnects the proxy session; failures are logged, not raised,
    /// so they never mask the bracketed operation's result.
    async fn disconnect_proxy(&self) {
        if let Err(e) = self.ctx.proxy.disconnect().await {
            warn!(
                pod = %self.ctx.id,
                container = %self.id,
                error = %e,
                "proxy disconnect failed"
            );
        }
    }
}
