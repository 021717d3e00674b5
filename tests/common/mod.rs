//! Shared mock collaborators for lifecycle tests.
//!
//! Every driver records the calls it receives so tests can assert not
//! just outcomes but the protocol sequence (e.g. "no agent call was
//! made", "unplug happened exactly once"). Failure injection flags
//! let tests exercise the compensation paths.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use vmpod::{
    Agent, AgentCapabilities, BlockDrive, BlockMount, Cmd, Collaborators, ContainerConfig, Device,
    DeviceInfo, DeviceResolver, Error, Hypervisor, HypervisorCapabilities, Mount, PodConfig,
    Process, ProcessListOptions, Proxy, ProxySession, Resource, Result, Shim, ShimParams, Signal,
    State, Storage,
};

// =============================================================================
// In-Memory Storage
// =============================================================================

/// In-memory resource store keyed by (pod, container, kind).
///
/// Pod-level resources use an empty container key.
#[derive(Default)]
pub struct MemStorage {
    items: Mutex<HashMap<(String, String, Resource), serde_json::Value>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn put<T: serde::Serialize>(
        &self,
        pod: &str,
        container: &str,
        kind: Resource,
        value: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.items
            .lock()
            .unwrap()
            .insert((pod.to_string(), container.to_string(), kind), value);
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        pod: &str,
        container: &str,
        kind: Resource,
    ) -> Result<Option<T>> {
        let items = self.items.lock().unwrap();
        match items.get(&(pod.to_string(), container.to_string(), kind)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Number of resources currently stored.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn store_pod_config(&self, pod_id: &str, config: &PodConfig) -> Result<()> {
        self.put(pod_id, "", Resource::Config, config)
    }

    async fn fetch_pod_config(&self, pod_id: &str) -> Result<Option<PodConfig>> {
        self.get(pod_id, "", Resource::Config)
    }

    async fn store_pod_state(&self, pod_id: &str, state: &State) -> Result<()> {
        self.put(pod_id, "", Resource::State, state)
    }

    async fn fetch_pod_state(&self, pod_id: &str) -> Result<Option<State>> {
        self.get(pod_id, "", Resource::State)
    }

    async fn delete_pod_resources(&self, pod_id: &str) -> Result<()> {
        self.items
            .lock()
            .unwrap()
            .retain(|(pod, _, _), _| pod != pod_id);
        Ok(())
    }

    async fn store_container_config(
        &self,
        pod_id: &str,
        container_id: &str,
        config: &ContainerConfig,
    ) -> Result<()> {
        self.put(pod_id, container_id, Resource::Config, config)
    }

    async fn fetch_container_config(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<ContainerConfig>> {
        self.get(pod_id, container_id, Resource::Config)
    }

    async fn store_container_state(
        &self,
        pod_id: &str,
        container_id: &str,
        state: &State,
    ) -> Result<()> {
        self.put(pod_id, container_id, Resource::State, state)
    }

    async fn fetch_container_state(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<State>> {
        self.get(pod_id, container_id, Resource::State)
    }

    async fn store_container_process(
        &self,
        pod_id: &str,
        container_id: &str,
        process: &Process,
    ) -> Result<()> {
        self.put(pod_id, container_id, Resource::Process, process)
    }

    async fn fetch_container_process(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<Process>> {
        self.get(pod_id, container_id, Resource::Process)
    }

    async fn store_container_mounts(
        &self,
        pod_id: &str,
        container_id: &str,
        mounts: &[Mount],
    ) -> Result<()> {
        self.put(pod_id, container_id, Resource::Mounts, &mounts)
    }

    async fn fetch_container_mounts(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<Vec<Mount>>> {
        self.get(pod_id, container_id, Resource::Mounts)
    }

    async fn store_container_devices(
        &self,
        pod_id: &str,
        container_id: &str,
        devices: &[Device],
    ) -> Result<()> {
        self.put(pod_id, container_id, Resource::Devices, &devices)
    }

    async fn fetch_container_devices(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<Option<Vec<Device>>> {
        self.get(pod_id, container_id, Resource::Devices)
    }

    async fn delete_container_resources(
        &self,
        pod_id: &str,
        container_id: &str,
        exclude: &[Resource],
    ) -> Result<()> {
        self.items.lock().unwrap().retain(|(pod, container, kind), _| {
            pod != pod_id || container != container_id || exclude.contains(kind)
        });
        Ok(())
    }
}

// =============================================================================
// Mock Hypervisor
// =============================================================================

pub struct MockHypervisor {
    block_hotplug: bool,
    pub vm_running: AtomicBool,
    pub drive_adds: Mutex<Vec<BlockDrive>>,
    pub drive_removes: Mutex<Vec<BlockDrive>>,
    pub device_adds: Mutex<Vec<DeviceInfo>>,
    pub device_removes: Mutex<Vec<DeviceInfo>>,
    next_index: AtomicU32,
}

impl MockHypervisor {
    pub fn new(block_hotplug: bool) -> Self {
        Self {
            block_hotplug,
            vm_running: AtomicBool::new(false),
            drive_adds: Mutex::new(Vec::new()),
            drive_removes: Mutex::new(Vec::new()),
            device_adds: Mutex::new(Vec::new()),
            device_removes: Mutex::new(Vec::new()),
            next_index: AtomicU32::new(1),
        }
    }

    pub fn drive_add_count(&self) -> usize {
        self.drive_adds.lock().unwrap().len()
    }

    pub fn drive_remove_count(&self) -> usize {
        self.drive_removes.lock().unwrap().len()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn capabilities(&self) -> HypervisorCapabilities {
        HypervisorCapabilities {
            block_hotplug: self.block_hotplug,
        }
    }

    async fn start_vm(&self, _pod_id: &str) -> Result<()> {
        self.vm_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_vm(&self, _pod_id: &str) -> Result<()> {
        self.vm_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn hotplug_add_drive(&self, _pod_id: &str, drive: &BlockDrive) -> Result<u32> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.drive_adds.lock().unwrap().push(drive.clone());
        Ok(index)
    }

    async fn hotplug_remove_drive(&self, _pod_id: &str, drive: &BlockDrive) -> Result<()> {
        self.drive_removes.lock().unwrap().push(drive.clone());
        Ok(())
    }

    async fn hotplug_add_device(&self, _pod_id: &str, device: &DeviceInfo) -> Result<()> {
        self.device_adds.lock().unwrap().push(device.clone());
        Ok(())
    }

    async fn hotplug_remove_device(&self, _pod_id: &str, device: &DeviceInfo) -> Result<()> {
        self.device_removes.lock().unwrap().push(device.clone());
        Ok(())
    }
}

// =============================================================================
// Mock Agent
// =============================================================================

pub struct MockAgent {
    block_device: bool,
    pub fail_start_container: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn new(block_device: bool) -> Self {
        Self {
            block_device,
            fail_start_container: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls recorded for one container, any operation.
    pub fn calls_for(&self, container_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.ends_with(&format!(":{container_id}")) || c.contains(&format!(":{container_id}:")))
            .collect()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            block_device: self.block_device,
        }
    }

    async fn start_pod(&self, pod_id: &str) -> Result<()> {
        self.record(format!("start_pod:{pod_id}"));
        Ok(())
    }

    async fn stop_pod(&self, pod_id: &str) -> Result<()> {
        self.record(format!("stop_pod:{pod_id}"));
        Ok(())
    }

    async fn start_container(
        &self,
        _pod_id: &str,
        container_id: &str,
        _config: &ContainerConfig,
        _process: &Process,
    ) -> Result<()> {
        self.record(format!("start_container:{container_id}"));
        if self.fail_start_container.load(Ordering::SeqCst) {
            return Err(Error::Agent("guest refused to start container".to_string()));
        }
        Ok(())
    }

    async fn stop_container(&self, _pod_id: &str, container_id: &str) -> Result<()> {
        self.record(format!("stop_container:{container_id}"));
        Ok(())
    }

    async fn kill_container(
        &self,
        _pod_id: &str,
        container_id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<()> {
        self.record(format!("kill_container:{container_id}:{signal}:{all}"));
        Ok(())
    }

    async fn exec(
        &self,
        _pod_id: &str,
        container_id: &str,
        _process: &Process,
        _cmd: &Cmd,
    ) -> Result<()> {
        self.record(format!("exec:{container_id}"));
        Ok(())
    }

    async fn process_list(
        &self,
        _pod_id: &str,
        container_id: &str,
        _options: &ProcessListOptions,
    ) -> Result<Vec<u8>> {
        self.record(format!("process_list:{container_id}"));
        Ok(b"PID  CMD\n1    /bin/sh\n".to_vec())
    }
}

// =============================================================================
// Mock Proxy
// =============================================================================

pub struct MockProxy {
    url: Mutex<String>,
    pub connects: Mutex<Vec<bool>>,
    pub disconnects: AtomicU32,
    next_token: AtomicU32,
}

impl MockProxy {
    pub fn new(url: &str) -> Self {
        Self {
            url: Mutex::new(url.to_string()),
            connects: Mutex::new(Vec::new()),
            disconnects: AtomicU32::new(0),
            next_token: AtomicU32::new(1),
        }
    }

    /// Simulates a proxy restart handing out a different URL.
    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Proxy for MockProxy {
    async fn connect(&self, _pod_id: &str, interactive: bool) -> Result<ProxySession> {
        self.connects.lock().unwrap().push(interactive);
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        Ok(ProxySession {
            token: format!("token-{n}"),
            url: self.url.lock().unwrap().clone(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Mock Shim
// =============================================================================

pub struct MockShim {
    next_pid: AtomicI32,
    pub fail_start: AtomicBool,
    pub running: Mutex<HashSet<i32>>,
    pub starts: Mutex<Vec<ShimParams>>,
    pub stops: Mutex<Vec<i32>>,
}

impl MockShim {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(1000),
            fail_start: AtomicBool::new(false),
            running: Mutex::new(HashSet::new()),
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

#[async_trait]
impl Shim for MockShim {
    async fn start(&self, _pod_id: &str, params: &ShimParams) -> Result<i32> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Shim("shim binary exited immediately".to_string()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().insert(pid);
        self.starts.lock().unwrap().push(params.clone());
        Ok(pid)
    }

    async fn is_running(&self, pid: i32) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(&pid))
    }

    async fn stop(&self, pid: i32) -> Result<()> {
        self.running.lock().unwrap().remove(&pid);
        self.stops.lock().unwrap().push(pid);
        Ok(())
    }

    async fn wait(&self, pid: i32) -> Result<()> {
        // The workload was killed; the shim drains and exits.
        self.running.lock().unwrap().remove(&pid);
        Ok(())
    }
}

// =============================================================================
// Mock Device Resolver
// =============================================================================

pub struct MockResolver {
    pub mount: Option<BlockMount>,
    pub device_mapper: bool,
    pub device_path: PathBuf,
    pub fstype: String,
}

impl MockResolver {
    /// Resolver that finds no backing mount (hotplug skipped).
    pub fn no_mount() -> Self {
        Self {
            mount: None,
            device_mapper: false,
            device_path: PathBuf::new(),
            fstype: String::new(),
        }
    }

    /// Resolver describing a device-mapper backed rootfs.
    pub fn device_mapper(device_path: &str, fstype: &str) -> Self {
        Self {
            mount: Some(BlockMount {
                major: 253,
                minor: 3,
                mount_point: PathBuf::from("/var/lib/mounts/rootfs"),
            }),
            device_mapper: true,
            device_path: PathBuf::from(device_path),
            fstype: fstype.to_string(),
        }
    }
}

#[async_trait]
impl DeviceResolver for MockResolver {
    async fn device_for_path(&self, path: &Path) -> Result<BlockMount> {
        match &self.mount {
            Some(mount) => Ok(mount.clone()),
            None => Err(Error::MountNotFound {
                path: path.to_path_buf(),
            }),
        }
    }

    async fn is_device_mapper(&self, _major: i64, _minor: i64) -> Result<bool> {
        Ok(self.device_mapper)
    }

    async fn device_path_and_fstype(&self, _mount_point: &Path) -> Result<(PathBuf, String)> {
        Ok((self.device_path.clone(), self.fstype.clone()))
    }
}

// =============================================================================
// Test Harness
// =============================================================================

pub const PROXY_URL: &str = "unix:///run/vmpod/proxy.sock";

/// Bundles the mocks plus a per-test base directory.
pub struct TestHarness {
    pub hypervisor: Arc<MockHypervisor>,
    pub agent: Arc<MockAgent>,
    pub proxy: Arc<MockProxy>,
    pub shim: Arc<MockShim>,
    pub storage: Arc<MemStorage>,
    pub resolver: Arc<MockResolver>,
    pub base: TempDir,
}

impl TestHarness {
    /// Harness with block hotplug unsupported and no backing mount.
    pub fn new() -> Self {
        Self::with_drivers(
            MockHypervisor::new(false),
            MockAgent::new(false),
            MockResolver::no_mount(),
        )
    }

    /// Harness where agent and hypervisor support block hotplug and the
    /// rootfs resolves to a device-mapper volume.
    pub fn with_block_hotplug() -> Self {
        Self::with_drivers(
            MockHypervisor::new(true),
            MockAgent::new(true),
            MockResolver::device_mapper("/dev/mapper/rootfs-3", "ext4"),
        )
    }

    pub fn with_drivers(
        hypervisor: MockHypervisor,
        agent: MockAgent,
        resolver: MockResolver,
    ) -> Self {
        Self {
            hypervisor: Arc::new(hypervisor),
            agent: Arc::new(agent),
            proxy: Arc::new(MockProxy::new(PROXY_URL)),
            shim: Arc::new(MockShim::new()),
            storage: Arc::new(MemStorage::new()),
            resolver: Arc::new(resolver),
            base: TempDir::new().expect("create test base dir"),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            hypervisor: self.hypervisor.clone(),
            agent: self.agent.clone(),
            proxy: self.proxy.clone(),
            shim: self.shim.clone(),
            storage: self.storage.clone(),
            resolver: self.resolver.clone(),
        }
    }

    pub fn pod_config(&self, pod_id: &str, containers: Vec<ContainerConfig>) -> PodConfig {
        PodConfig {
            id: pod_id.to_string(),
            containers,
            annotations: HashMap::new(),
            base_dir: Some(self.base.path().to_path_buf()),
        }
    }
}

/// Minimal valid container config.
pub fn container_config(id: &str) -> ContainerConfig {
    ContainerConfig {
        id: id.to_string(),
        rootfs: PathBuf::from("/var/lib/mounts/rootfs"),
        readonly: false,
        cmd: Cmd {
            args: vec!["/bin/sh".to_string()],
            ..Cmd::default()
        },
        annotations: HashMap::new(),
        mounts: vec![Mount {
            source: PathBuf::from("/dev/dm-3"),
            destination: PathBuf::from("/"),
            fs_type: "ext4".to_string(),
            options: vec!["rw".to_string()],
        }],
        devices: Vec::new(),
    }
}
