//! # wapt-core
//!
//! Provisions a wireless interface into access-point mode and tears it down
//! again, coordinating with the host's own network manager.
//!
//! Layers, leaf first:
//!
//! - [`interface`]: the interface state machine (admin up/down, mode,
//!   addressing, soft and hard reset), every transition verified by polling.
//! - [`manager`]: suspends NetworkManager and the supplicant around direct
//!   interface mutation and restores only what it stopped.
//! - [`services`]: DHCP/DNS daemon, time service and captive-portal HTTP
//!   server, each tracked by a typed process handle.
//! - [`session`]: the start/stop pipelines, with reverse cleanup of every
//!   completed stage on failure.
//! - [`status`]: the single session record that doubles as the "AP active"
//!   lock.
//!
//! All external effects go through the traits in [`system`], so the
//! pipelines run unchanged against a simulated host in tests.

#[cfg(not(target_os = "linux"))]
compile_error!("wapt-core drives Linux network interfaces and only builds for Linux targets");

pub mod cli;
pub mod config;
pub mod error;
mod fsutil;
pub mod hostapd;
pub mod inspect;
pub mod interface;
pub mod mac;
pub mod manager;
pub mod operations;
pub mod profile;
pub mod retry;
pub mod rollback;
pub mod services;
pub mod session;
pub mod status;
pub mod system;

#[cfg(test)]
pub(crate) mod fakes;

pub use cli::{Cli, Commands, OutputFormat};
pub use config::{resolve_root, WaptConfig};
pub use error::{Result, WaptError};
pub use interface::{AdminState, InterfaceMachine, InterfaceStatus, OperationalMode};
pub use mac::MacAddr;
pub use manager::{ManagerCoordinator, Purpose, ResourceCoordinator, SuspendedManagers};
pub use operations::{dispatch_command, Context, HandlerResult};
pub use profile::{ProfileSpec, SecurityMode};
pub use retry::{PollTimeout, RetryPolicy};
pub use session::{SessionOrchestrator, SessionRequest, StartOutcome, StopOptions, StopReport};
pub use status::{SessionRecord, StatusTracker};
pub use system::Host;
