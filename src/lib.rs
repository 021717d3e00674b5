//! # vmpod
//!
//! **Pod and container lifecycle orchestration for VM-sandboxed
//! workloads.**
//!
//! This crate coordinates a hypervisor, an in-guest agent, a connection
//! proxy, and a per-process shim to create, start, stop, signal, and
//! tear down containers running inside a virtual machine. It owns the
//! state machine and the protocol sequence; the four services it
//! drives — and the durable store it persists through — are trait
//! objects supplied by the embedding runtime.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Host                                                           │
//! │  ┌───────────────┐   fan-out    ┌─────────────────────────┐     │
//! │  │      Pod      │ ───────────► │       Container          │    │
//! │  │  state gate   │              │  create/start/stop/...   │    │
//! │  └──────┬────────┘              └───────┬─────────┬────────┘    │
//! │         │                               │         │             │
//! │         ▼                               ▼         ▼             │
//! │  ┌────────────┐   ┌─────────┐   ┌───────────┐  ┌──────┐         │
//! │  │ Hypervisor │   │ Storage │   │   Proxy   │  │ Shim │ (pid)   │
//! │  │ boot/plug  │   │ on-disk │   │  session  │  └──────┘         │
//! │  └──────┬─────┘   │  truth  │   └─────┬─────┘                   │
//! │         │         └─────────┘         │ token/url               │
//! │  ┌──────▼────────────────────────────▼──────────────────┐       │
//! │  │  VM                        Agent (in-guest commands)  │      │
//! │  └───────────────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! Pods and containers share a small re-enterable state machine:
//!
//! ```text
//!   ┌───────┐   start   ┌─────────┐   stop    ┌─────────┐
//!   │ Ready │ ────────► │ Running │ ────────► │ Stopped │
//!   └───┬───┘           └─────────┘ ◄──────── └─────────┘
//!       │     stop (never started)      start (restart)
//!       └──────────────────────────────────────► Stopped
//! ```
//!
//! There is no `Deleted` phase: deletion removes the persisted
//! resources, and their absence is the terminal marker.
//!
//! # Durable State
//!
//! All cross-restart state lives in [`storage::Storage`], keyed by
//! (pod ID, container ID, resource kind). In-memory `Pod`/`Container`
//! objects are views rebuilt from storage on load ([`pod::Pod::fetch`])
//! and refreshed before every state-dependent operation. Creating a
//! container whose state already exists on disk reattaches to it
//! without restarting the shim.
//!
//! # Failure Compensation
//!
//! - A failed agent start triggers a best-effort stop; the original
//!   error is the one returned.
//! - Proxy sessions are disconnected on every exit path.
//! - A shim still alive after stop or delete is forcibly reaped so no
//!   orphan stays bound to a dead container.
//! - Rootfs drive hotplug is tracked by a dedicated flag plus index and
//!   filesystem type, so stop unplugs exactly what start plugged in.
//!
//! # Concurrency
//!
//! Lifecycle operations take `&mut self` and perform their awaits on
//! the calling task: one operation in flight per handle. Cross-handle
//! serialization for the same container ID is the caller's
//! responsibility.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmpod::{Collaborators, Pod, PodConfig};
//!
//! #[tokio::main]
//! async fn main() -> vmpod::Result<()> {
//!     let drivers = Collaborators { /* hypervisor, agent, proxy, shim, storage, resolver */ };
//!     let mut pod = Pod::create(config, drivers).await?;
//!     pod.start().await?;
//!     pod.start_container("web").await?;
//!     // ...
//!     pod.stop().await?;
//!     pod.delete().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod container;
pub mod device;
pub mod drivers;
pub mod error;
pub mod pod;
pub mod state;
pub mod storage;

// Re-exports
pub use config::{Cmd, ContainerConfig, DeviceInfo, DeviceType, Mount, PodConfig};
pub use container::Container;
pub use device::{BlockDevice, BlockDrive, BlockMount, Device, DeviceResolver, GenericDevice};
pub use drivers::{
    Agent, AgentCapabilities, Hypervisor, HypervisorCapabilities, ProcessListOptions, Proxy,
    ProxySession, Shim, ShimParams, Signal,
};
pub use error::{Error, Result};
pub use pod::{Collaborators, Pod};
pub use state::{Process, State, StatePhase};
pub use storage::{Resource, Storage};
