//! Scriptable host page for tests.

use crate::host::hooks::{BeforeHook, HookInvocation, HookSite, Hookable};
use crate::host::HostPage;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Host page whose state and call sites tests drive directly.
pub struct MockHostPage {
    volume: Mutex<Option<f64>>,
    session_state: Mutex<Option<String>>,
    talking: Mutex<Option<Vec<String>>>,
    preferences: Mutex<Option<Value>>,
    hookable: AtomicBool,
    hooks: Mutex<HashMap<&'static str, BeforeHook>>,
    original_calls: AtomicUsize,
}

impl MockHostPage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            volume: Mutex::new(Some(1.0)),
            session_state: Mutex::new(Some("open".to_string())),
            talking: Mutex::new(Some(Vec::new())),
            preferences: Mutex::new(Some(Value::Null)),
            hookable: AtomicBool::new(true),
            hooks: Mutex::new(HashMap::new()),
            original_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_volume(&self, volume: Option<f64>) {
        *self.volume.lock().unwrap_or_else(|e| e.into_inner()) = volume;
    }

    pub fn set_session_state(&self, state: Option<&str>) {
        *self.session_state.lock().unwrap_or_else(|e| e.into_inner()) =
            state.map(str::to_string);
    }

    pub fn set_talking_users(&self, users: &[&str]) {
        *self.talking.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(users.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_preferences(&self, preferences: Value) {
        *self.preferences.lock().unwrap_or_else(|e| e.into_inner()) = Some(preferences);
    }

    pub fn set_hookable(&self, hookable: bool) {
        self.hookable.store(hookable, Ordering::SeqCst);
    }

    /// Simulates the host calling its own "reconnect audio" function.
    pub fn invoke_reconnect(&self) {
        if let Some(before) = self
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(site_key(HookSite::ReconnectAudio))
            .cloned()
        {
            before(&HookInvocation {
                site: HookSite::ReconnectAudio,
                argument: None,
            });
        }
        self.original_calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Simulates the host calling its own "adjust volume" function.
    pub fn invoke_adjust_volume(&self, volume: f64) {
        if let Some(before) = self
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(site_key(HookSite::AdjustVolume))
            .cloned()
        {
            before(&HookInvocation {
                site: HookSite::AdjustVolume,
                argument: Some(volume),
            });
        }
        self.set_volume(Some(volume));
        self.original_calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Times the wrapped originals ran; hooks must never swallow calls.
    pub fn original_calls(&self) -> usize {
        self.original_calls.load(Ordering::SeqCst)
    }
}

fn site_key(site: HookSite) -> &'static str {
    match site {
        HookSite::ReconnectAudio => "reconnect_audio",
        HookSite::AdjustVolume => "adjust_volume",
    }
}

impl HostPage for MockHostPage {
    fn volume(&self) -> Option<f64> {
        *self.volume.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session_state(&self) -> Option<String> {
        self.session_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn talking_users(&self) -> Option<Vec<String>> {
        self.talking.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn preferences(&self) -> Option<Value> {
        self.preferences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Hookable for MockHostPage {
    fn install_hook(&self, site: HookSite, before: BeforeHook) -> bool {
        if !self.hookable.load(Ordering::SeqCst) {
            return false;
        }
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(site_key(site), before);
        true
    }

    fn restore_hook(&self, site: HookSite) -> bool {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(site_key(site))
            .is_some()
    }
}
