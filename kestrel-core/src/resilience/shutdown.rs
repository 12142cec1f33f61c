//! Shutdown switch
//!
//! One switch per process. Ctrl+C (or any caller) flips it; synchronous loops
//! poll [`ShutdownSwitch::should_stop`], async tasks wait on a `watch`
//! receiver from [`ShutdownSwitch::subscribe`].
//!
//! ```no_run
//! use kestrel_core::resilience::ShutdownSwitch;
//!
//! let switch = ShutdownSwitch::new();
//! switch.install_ctrlc().expect("handler");
//! while !switch.should_stop() {
//!     // consume...
//! }
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    /// Drain in-flight work, then exit
    Draining = 1,
    /// Exit without draining
    Abort = 2,
}

impl From<u8> for ShutdownState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::Abort,
            _ => Self::Running,
        }
    }
}

#[derive(Clone)]
pub struct ShutdownSwitch {
    state: Arc<AtomicU8>,
    reason: Arc<Mutex<Option<String>>>,
    notify: Arc<watch::Sender<bool>>,
}

impl ShutdownSwitch {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            state: Arc::new(AtomicU8::new(ShutdownState::Running as u8)),
            reason: Arc::new(Mutex::new(None)),
            notify: Arc::new(notify),
        }
    }

    /// Route Ctrl+C / SIGTERM to a graceful drain
    pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
        let switch = self.clone();
        ctrlc::set_handler(move || {
            if switch.should_stop() {
                switch.abort("second interrupt");
            } else {
                switch.shutdown("interrupt received");
            }
        })?;
        info!("shutdown handler installed");
        Ok(())
    }

    /// Receiver that flips to `true` once shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    pub fn state(&self) -> ShutdownState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Begin a graceful drain; later calls keep the first reason
    pub fn shutdown(&self, reason: &str) {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(reason, "shutdown requested");
            *self.reason.lock() = Some(reason.to_string());
            self.notify.send_replace(true);
        }
    }

    pub fn abort(&self, reason: &str) {
        error!(reason, "aborting without drain");
        self.state.store(ShutdownState::Abort as u8, Ordering::Release);
        self.reason.lock().get_or_insert_with(|| reason.to_string());
        self.notify.send_replace(true);
    }
}

impl Default for ShutdownSwitch {
    fn default() -> Self {
        Self::new()
    }
}
