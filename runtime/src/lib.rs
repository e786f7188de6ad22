//! Coderoom runtime: rooms of clients sharing sandboxed code runs over WebSockets.

pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use capsules_sandbox_exec::{ContainerEngine, SandboxController, SandboxLimits, SandboxSettings};
use config_loader::SandboxConfig;

use server::rooms::{RoomRegistry, RoomService};

/// Controller settings for a loaded sandbox config. Network isolation is always enforced.
pub fn sandbox_settings(config: &SandboxConfig) -> SandboxSettings {
    SandboxSettings {
        image: config.image.clone(),
        timeout: Duration::from_secs(config.timeout_secs),
        limits: SandboxLimits {
            network_disabled: true,
            memory_bytes: config.memory_bytes,
            pids_limit: config.pids_limit,
        },
    }
}

/// Wires engine → controller → registry → service.
pub fn build_room_service(
    engine: Arc<dyn ContainerEngine>,
    config: &SandboxConfig,
) -> Arc<RoomService> {
    let sandbox = Arc::new(SandboxController::new(engine, sandbox_settings(config)));
    let registry = Arc::new(RoomRegistry::new());
    Arc::new(RoomService::new(registry, sandbox))
}
