use tracing::info;

use crate::utils::config::DevicePreference;

/// Resolve `embedding.device` to the execution path this binary actually
/// runs on, and log the decision once at startup (§4.1 "device selection
/// policy"). This build only links the CPU `ort` backend, so `Gpu`/`Auto`
/// both resolve to `cpu`; a build compiled with a GPU execution provider
/// feature would extend this match instead of re-deriving the policy
/// per call.
pub fn resolve_and_log(preference: DevicePreference, host: &str) {
    let resolved = match preference {
        DevicePreference::Cpu => "cpu",
        DevicePreference::Gpu | DevicePreference::Auto => "cpu",
    };
    info!(
        host,
        requested = ?preference,
        resolved,
        "device selection fixed for process lifetime"
    );
}
