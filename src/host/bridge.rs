//! Host state polling and change detection.

use crate::capture::VolumeSource;
use crate::defaults;
use crate::error::{Result, ScribeError};
use crate::events::EventEmitter;
use crate::host::hooks::{HookInvocation, HookRegistry, HookSite};
use crate::host::{HostEvent, HostPage};
use log::{debug, info};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Host session state. Unrecognized strings are carried as-is rather than
/// collapsed to `Unknown`, so downstream observers see exactly what the
/// host reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    Connecting,
    Open,
    Closed,
    Other(String),
}

impl SessionState {
    fn parse(raw: &str) -> Self {
        match raw {
            "unknown" => Self::Unknown,
            "connecting" => Self::Connecting,
            "open" => Self::Open,
            "closed" => Self::Closed,
            other => Self::Other(other.to_string()),
        }
    }
}

struct Observed {
    volume: f64,
    state: SessionState,
    talking: Vec<String>,
    preferences: Value,
}

/// Surfaces host volume, session state, and talking users as events.
pub struct HostBridge {
    page: Arc<dyn HostPage>,
    events: EventEmitter<HostEvent>,
    observed: Arc<Mutex<Observed>>,
    reconnect_count: Arc<AtomicU64>,
    access_failures: Arc<AtomicU64>,
    sync_stop: Mutex<Option<Arc<AtomicBool>>>,
    hooks: HookRegistry,
}

impl HostBridge {
    pub fn new(page: Arc<dyn HostPage>) -> Self {
        Self {
            page,
            events: EventEmitter::new(),
            observed: Arc::new(Mutex::new(Observed {
                volume: 1.0,
                state: SessionState::Unknown,
                talking: Vec::new(),
                preferences: Value::Null,
            })),
            reconnect_count: Arc::new(AtomicU64::new(0)),
            access_failures: Arc::new(AtomicU64::new(0)),
            sync_stop: Mutex::new(None),
            hooks: HookRegistry::new(),
        }
    }

    pub fn events(&self) -> EventEmitter<HostEvent> {
        self.events.clone()
    }

    /// Polls the host until its state locations look valid.
    ///
    /// Valid means the volume reads as a number in [0, 1] and the session
    /// state field is present. Fails with [`ScribeError::HostNotFound`] once
    /// `max_retries` polls have been exhausted.
    pub async fn wait_for_ready(&self, max_retries: u32, interval: Duration) -> Result<()> {
        for attempt in 0..max_retries {
            if self.is_ready() {
                debug!("host ready after {} poll(s)", attempt + 1);
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
        if self.is_ready() {
            return Ok(());
        }
        Err(ScribeError::HostNotFound {
            attempts: max_retries,
        })
    }

    fn is_ready(&self) -> bool {
        let volume_ok = self
            .page
            .volume()
            .is_some_and(|v| v.is_finite() && (0.0..=1.0).contains(&v));
        volume_ok && self.page.session_state().is_some()
    }

    /// Current host volume clamped to [0, 1]; 1.0 when unreadable.
    pub fn get_volume(&self) -> f64 {
        self.page
            .volume()
            .filter(|v| v.is_finite())
            .map_or(1.0, |v| v.clamp(0.0, 1.0))
    }

    pub fn session_state(&self) -> SessionState {
        self.page
            .session_state()
            .map_or(SessionState::Unknown, |s| SessionState::parse(&s))
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Host state reads that failed since the bridge was created.
    pub fn access_failures(&self) -> u64 {
        self.access_failures.load(Ordering::SeqCst)
    }

    /// Installs call-site hooks and starts the periodic re-sampling loop.
    ///
    /// Hook installation is best-effort; a host without reachable call
    /// sites is tracked by polling alone.
    pub fn start_sync(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let mut sync_stop = self.sync_stop.lock().unwrap_or_else(|e| e.into_inner());
        if sync_stop.is_some() {
            return Err(ScribeError::Other("sync already running".to_string()));
        }

        let events = self.events.clone();
        let observed = self.observed.clone();
        let reconnects = self.reconnect_count.clone();
        self.hooks.install_all(
            &*self.page,
            Arc::new(move |invocation: &HookInvocation| match invocation.site {
                HookSite::ReconnectAudio => {
                    let count = reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("host requested audio reconnect #{count}");
                    events.emit(&HostEvent::Reconnect { count });
                }
                HookSite::AdjustVolume => {
                    if let Some(volume) = invocation.argument {
                        apply_volume(&observed, &events, volume);
                    }
                }
            }),
        );

        let stop = Arc::new(AtomicBool::new(false));
        *sync_stop = Some(stop.clone());
        drop(sync_stop);

        let bridge = self.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                bridge.resample();
            }
            debug!("host sync loop stopped");
        });
        Ok(())
    }

    /// Stops the sync loop and restores every wrapped call site.
    pub fn stop_sync(&self) {
        if let Some(stop) = self
            .sync_stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            stop.store(true, Ordering::SeqCst);
        }
        self.hooks.restore_all(&*self.page);
    }

    /// One re-sampling pass over every host state location.
    fn resample(&self) {
        match self.page.volume() {
            Some(volume) if volume.is_finite() => {
                apply_volume(&self.observed, &self.events, volume);
            }
            _ => self.access_failure("volume"),
        }

        match self.page.session_state() {
            Some(raw) => {
                let new = SessionState::parse(&raw);
                let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
                if new != observed.state {
                    let old = std::mem::replace(&mut observed.state, new.clone());
                    drop(observed);
                    self.events
                        .emit(&HostEvent::SessionStateChanged { new, old });
                }
            }
            None => self.access_failure("session state"),
        }

        match self.page.talking_users() {
            Some(mut new) => {
                new.sort();
                let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
                if new != observed.talking {
                    let old = std::mem::replace(&mut observed.talking, new.clone());
                    drop(observed);
                    self.events
                        .emit(&HostEvent::TalkingUsersChanged { new, old });
                }
            }
            None => self.access_failure("talking users"),
        }

        match self.page.preferences() {
            Some(new) => {
                let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
                if new != observed.preferences {
                    let old = std::mem::replace(&mut observed.preferences, new.clone());
                    drop(observed);
                    self.events
                        .emit(&HostEvent::PreferencesChanged { new, old });
                }
            }
            None => self.access_failure("preferences"),
        }
    }

    fn access_failure(&self, what: &str) {
        self.access_failures.fetch_add(1, Ordering::SeqCst);
        self.events.emit(&HostEvent::SyncError {
            message: format!("failed to read host {what}"),
        });
    }
}

/// Volume change with hysteresis; shared by the poll loop and the hook.
fn apply_volume(observed: &Mutex<Observed>, events: &EventEmitter<HostEvent>, volume: f64) {
    let volume = volume.clamp(0.0, 1.0);
    let mut observed = observed.lock().unwrap_or_else(|e| e.into_inner());
    if (volume - observed.volume).abs() > defaults::VOLUME_HYSTERESIS {
        let old = std::mem::replace(&mut observed.volume, volume);
        drop(observed);
        events.emit(&HostEvent::VolumeChanged { new: volume, old });
    }
}

impl VolumeSource for HostBridge {
    fn current_volume(&self) -> f64 {
        self.get_volume()
    }
}
