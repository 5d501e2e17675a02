//! Call-site hooks on the host page.
//!
//! Where the host exposes its "reconnect audio" and "adjust volume"
//! functions, the bridge wraps them with a pre-hook that observes the call
//! and then lets the original run unchanged. The registry remembers what it
//! wrapped so `stop_sync` can restore every site.

use log::{debug, warn};
use std::sync::{Arc, Mutex};

/// Hookable call sites on the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSite {
    ReconnectAudio,
    AdjustVolume,
}

/// One observed call through a wrapped site.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub site: HookSite,
    /// The new volume for [`HookSite::AdjustVolume`]; absent for reconnect.
    pub argument: Option<f64>,
}

/// Pre-hook run before the original call site.
pub type BeforeHook = Arc<dyn Fn(&HookInvocation) + Send + Sync>;

/// Host-side hook installation.
pub trait Hookable: Send + Sync {
    /// Wraps `site` with `before`. Returns false when the call site cannot
    /// be located; callers then fall back to polling.
    fn install_hook(&self, site: HookSite, before: BeforeHook) -> bool;

    /// Restores the original at `site`. Returns false if nothing was
    /// installed there.
    fn restore_hook(&self, site: HookSite) -> bool;
}

/// Tracks which sites are currently wrapped.
pub struct HookRegistry {
    installed: Mutex<Vec<HookSite>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            installed: Mutex::new(Vec::new()),
        }
    }

    /// Attempts to wrap both known sites; returns how many took.
    pub fn install_all(&self, target: &dyn Hookable, before: BeforeHook) -> usize {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for site in [HookSite::ReconnectAudio, HookSite::AdjustVolume] {
            if installed.contains(&site) {
                continue;
            }
            if target.install_hook(site, before.clone()) {
                debug!("hooked host call site {site:?}");
                installed.push(site);
                count += 1;
            } else {
                warn!("host call site {site:?} not found; relying on polling");
            }
        }
        count
    }

    /// Restores every wrapped site, most recent first.
    pub fn restore_all(&self, target: &dyn Hookable) {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(site) = installed.pop() {
            if !target.restore_hook(site) {
                warn!("host call site {site:?} was already unhooked");
            }
        }
    }

    pub fn installed_count(&self) -> usize {
        self.installed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHostPage;

    #[test]
    fn test_install_and_restore() {
        let page = MockHostPage::new();
        let registry = HookRegistry::new();

        let installed = registry.install_all(&*page, Arc::new(|_| {}));
        assert_eq!(installed, 2);
        assert_eq!(registry.installed_count(), 2);

        // Installing again over wrapped sites is a no-op.
        assert_eq!(registry.install_all(&*page, Arc::new(|_| {})), 0);

        registry.restore_all(&*page);
        assert_eq!(registry.installed_count(), 0);
    }

    #[test]
    fn test_unhookable_host_degrades() {
        let page = MockHostPage::new();
        page.set_hookable(false);
        let registry = HookRegistry::new();
        assert_eq!(registry.install_all(&*page, Arc::new(|_| {})), 0);
    }
}
