//! Policy file loading.
//!
//! The policy is a TOML file; every field has a default, so an empty file
//! is a valid policy. Reloads swap the whole policy atomically through the
//! shared [`PolicyHandle`].

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use dispatch_registry::{PolicyHandle, ThrottlePolicy};

/// Load a throttle policy from a TOML file.
pub fn load_policy(path: &Path) -> Result<ThrottlePolicy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading policy file {}", path.display()))?;
    let policy: ThrottlePolicy =
        toml::from_str(&raw).with_context(|| format!("parsing policy file {}", path.display()))?;
    Ok(policy)
}

/// Re-read the policy file and swap it into the running handle.
///
/// On any error the previous policy stays in effect.
pub fn reload_policy(path: &Path, handle: &PolicyHandle) -> Result<()> {
    let policy = load_policy(path)?;
    info!(path = %path.display(), strategy = ?policy.strategy, "policy reloaded");
    handle.store(policy);
    Ok(())
}
