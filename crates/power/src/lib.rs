//! Power management: idle timer, suspend gate, ordered suspend/resume.
//!
//! The manager arms an idle deadline that every touch and canvas command
//! pushes out. When it fires, a suspend is attempted through a gate: busy
//! flags and a wake debounce can refuse it, and only one suspend runs at a
//! time. A successful cycle is strictly `on_suspend` → system sleep →
//! `on_resume` → idle re-arm. Timer behaviour rides on the tokio clock, so
//! tests drive it with paused virtual time; the system-sleep side effect
//! stays pluggable.

use std::{
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{
        sync::Notify,
        time::{self, Instant},
    },
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SuspendError {
    #[error("power: suspend already in progress")]
    InProgress,

    #[error("power: suspend blocked")]
    Blocked,

    #[error(transparent)]
    Sleep(#[from] io::Error),
}

impl SuspendError {
    /// Gate refusals mean "not suspending right now" and are non-fatal.
    pub fn is_gate_refusal(&self) -> bool {
        matches!(self, Self::InProgress | Self::Blocked)
    }
}

/// The actual sleep-to-RAM side effect. Blocks for the whole sleep.
pub trait Suspender: Send + Sync {
    fn suspend(&self) -> io::Result<()>;
}

/// Production suspender: writes `mem` to the power-state control node.
/// Control returns to the caller after wake.
pub struct SystemSuspender {
    path: PathBuf,
}

impl SystemSuspender {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/sys/power/state"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for SystemSuspender {
    fn default() -> Self {
        Self::new()
    }
}

impl Suspender for SystemSuspender {
    fn suspend(&self) -> io::Result<()> {
        fs::write(&self.path, b"mem")
    }
}

/// Suspend/resume callbacks run around the system sleep, in order, with no
/// interleaving between concurrent suspend attempts.
#[async_trait]
pub trait PowerHooks: Send + Sync {
    async fn on_suspend(&self);
    async fn on_resume(&self);
}

/// Busy flags shared with the rest of the node: reconnecting WiFi and
/// in-flight canvas commands both veto a suspend.
#[derive(Default)]
pub struct PowerFlags {
    wifi_busy: AtomicBool,
    command_busy: AtomicBool,
}

impl PowerFlags {
    pub fn set_wifi_connecting(&self, busy: bool) {
        self.wifi_busy.store(busy, Ordering::SeqCst);
    }

    pub fn set_command_processing(&self, busy: bool) {
        self.command_busy.store(busy, Ordering::SeqCst);
    }

    fn any_busy(&self) -> bool {
        self.wifi_busy.load(Ordering::SeqCst) || self.command_busy.load(Ordering::SeqCst)
    }
}

pub struct Manager {
    idle_timeout: Duration,
    suspend_enabled: bool,
    debounce: Duration,
    suspender: Arc<dyn Suspender>,
    flags: Arc<PowerFlags>,
    hooks: Mutex<Option<Arc<dyn PowerHooks>>>,
    suspending: AtomicBool,
    last_wake: Mutex<Option<Instant>>,
    idle_deadline: Mutex<Option<Instant>>,
    idle_kick: Notify,
}

impl Manager {
    pub fn new(idle_timeout: Duration, suspend_enabled: bool, suspender: Arc<dyn Suspender>) -> Self {
        Self {
            idle_timeout,
            suspend_enabled,
            debounce: DEFAULT_DEBOUNCE,
            suspender,
            flags: Arc::new(PowerFlags::default()),
            hooks: Mutex::new(None),
            suspending: AtomicBool::new(false),
            last_wake: Mutex::new(None),
            idle_deadline: Mutex::new(None),
            idle_kick: Notify::new(),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn set_hooks(&self, hooks: Arc<dyn PowerHooks>) {
        *self.hooks.lock().unwrap_or_else(PoisonError::into_inner) = Some(hooks);
    }

    pub fn flags(&self) -> Arc<PowerFlags> {
        Arc::clone(&self.flags)
    }

    pub fn set_wifi_connecting(&self, busy: bool) {
        self.flags.set_wifi_connecting(busy);
    }

    pub fn set_command_processing(&self, busy: bool) {
        self.flags.set_command_processing(busy);
    }

    /// Push the idle deadline out by the configured timeout. Does nothing
    /// when suspend is disabled or no timeout is set.
    pub fn reset_idle(&self) {
        if !self.suspend_enabled || self.idle_timeout.is_zero() {
            return;
        }
        *self
            .idle_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + self.idle_timeout);
        self.idle_kick.notify_waiters();
    }

    /// Wait for idle-timer fires and attempt a suspend on each. Exits on
    /// cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.suspend_enabled || self.idle_timeout.is_zero() {
            cancel.cancelled().await;
            return;
        }
        self.reset_idle();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.idle_elapsed() => {
                    if let Err(err) = self.suspend().await {
                        debug!(error = %err, "idle suspend skipped");
                    }
                    self.reset_idle();
                },
            }
        }
    }

    async fn idle_elapsed(&self) {
        loop {
            let deadline = *self
                .idle_deadline
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match deadline {
                None => self.idle_kick.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = time::sleep_until(deadline) => {
                            let mut current = self
                                .idle_deadline
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner);
                            // A reset may have moved the deadline while we
                            // slept on the old one.
                            if *current == Some(deadline) {
                                *current = None;
                                return;
                            }
                        },
                        _ = self.idle_kick.notified() => {},
                    }
                },
            }
        }
    }

    /// Attempt one suspend cycle. Serialising: a second caller gets
    /// `InProgress` while a cycle is in flight.
    pub async fn suspend(&self) -> Result<(), SuspendError> {
        if !self.suspend_enabled {
            return Ok(());
        }
        if self.suspending.swap(true, Ordering::SeqCst) {
            return Err(SuspendError::InProgress);
        }
        let result = self.suspend_cycle().await;
        self.suspending.store(false, Ordering::SeqCst);
        result
    }

    async fn suspend_cycle(&self) -> Result<(), SuspendError> {
        if !self.can_suspend() {
            return Err(SuspendError::Blocked);
        }
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hooks) = &hooks {
            hooks.on_suspend().await;
        }
        let suspender = Arc::clone(&self.suspender);
        // The sleep blocks until wake; keep it off the async reactor.
        tokio::task::spawn_blocking(move || suspender.suspend())
            .await
            .map_err(|err| SuspendError::Sleep(io::Error::other(err)))??;
        *self
            .last_wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        if let Some(hooks) = &hooks {
            hooks.on_resume().await;
        }
        self.reset_idle();
        Ok(())
    }

    fn can_suspend(&self) -> bool {
        if self.flags.any_busy() {
            return false;
        }
        match *self
            .last_wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(last_wake) => Instant::now().duration_since(last_wake) >= self.debounce,
            None => true,
        }
    }
}
