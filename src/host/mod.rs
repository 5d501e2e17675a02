//! Bridge to the host page.
//!
//! The host page owns playback volume, session state, and the talking-user
//! set. [`HostBridge`] surfaces those through a polling loop with change
//! detection, plus call-site hooks where the host exposes them.

pub mod bridge;
pub mod hooks;
pub mod mock;

use serde_json::Value;

pub use bridge::{HostBridge, SessionState};
pub use hooks::{BeforeHook, HookInvocation, HookRegistry, HookSite, Hookable};
pub use mock::MockHostPage;

/// Read access to host page state.
///
/// Every getter returns `None` when the underlying state cannot be reached;
/// the bridge counts such failures and keeps polling.
pub trait HostPage: Hookable {
    fn volume(&self) -> Option<f64>;
    fn session_state(&self) -> Option<String>;
    fn talking_users(&self) -> Option<Vec<String>>;
    fn preferences(&self) -> Option<Value>;
}

/// Events emitted by [`HostBridge`].
#[derive(Debug, Clone)]
pub enum HostEvent {
    VolumeChanged { new: f64, old: f64 },
    SessionStateChanged { new: SessionState, old: SessionState },
    TalkingUsersChanged { new: Vec<String>, old: Vec<String> },
    Reconnect { count: u64 },
    PreferencesChanged { new: Value, old: Value },
    SyncError { message: String },
}
