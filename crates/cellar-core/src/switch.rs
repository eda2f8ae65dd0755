//! ON/OFF gates for producers, consumers and event handlers.
//!
//! A switch backed by the configuration store re-reads its property on every
//! status check, so an external edit of the node PID is observed on the next
//! message without restarting anything. Absent or unparseable values leave the
//! in-memory state unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config_store::ConfigStore;
use crate::configuration::parse_bool;
use crate::error::Result;

/// State of a switch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchStatus {
    /// The component acts.
    On,
    /// The component is paused.
    Off,
}

impl SwitchStatus {
    /// Maps a boolean onto a status.
    pub fn from_bool(on: bool) -> Self {
        if on {
            SwitchStatus::On
        } else {
            SwitchStatus::Off
        }
    }

    /// True when ON.
    pub fn is_on(&self) -> bool {
        matches!(self, SwitchStatus::On)
    }
}

impl fmt::Display for SwitchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchStatus::On => f.write_str("ON"),
            SwitchStatus::Off => f.write_str("OFF"),
        }
    }
}

struct SwitchSource {
    store: Arc<ConfigStore>,
    pid: String,
    key: String,
}

/// A runtime-toggleable gate.
pub struct Switch {
    id: String,
    on: AtomicBool,
    source: Option<SwitchSource>,
}

impl Switch {
    /// Creates a purely in-memory switch.
    pub fn new(id: impl Into<String>, status: SwitchStatus) -> Self {
        Self {
            id: id.into(),
            on: AtomicBool::new(status.is_on()),
            source: None,
        }
    }

    /// Creates a switch mirrored to `key` of `pid` in the configuration store.
    pub fn backed_by(
        id: impl Into<String>,
        store: Arc<ConfigStore>,
        pid: impl Into<String>,
        key: impl Into<String>,
        initial: SwitchStatus,
    ) -> Self {
        let switch = Self {
            id: id.into(),
            on: AtomicBool::new(initial.is_on()),
            source: Some(SwitchSource {
                store,
                pid: pid.into(),
                key: key.into(),
            }),
        };
        switch.refresh();
        switch
    }

    /// Switch identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reloads the backing property, keeping the current state when it is
    /// missing or unreadable.
    pub fn refresh(&self) {
        let Some(source) = &self.source else {
            return;
        };
        let value = source.store.get_property(&source.pid, &source.key);
        match value.as_deref().and_then(parse_bool) {
            Some(on) => self.on.store(on, Ordering::SeqCst),
            None => debug!(switch = %self.id, "switch property unreadable, keeping state"),
        }
    }

    /// Current status, refreshed from configuration first.
    pub fn status(&self) -> SwitchStatus {
        self.refresh();
        SwitchStatus::from_bool(self.on.load(Ordering::SeqCst))
    }

    /// True when the refreshed status is ON.
    pub fn is_on(&self) -> bool {
        self.status().is_on()
    }

    /// Turns the switch on and persists the change.
    pub fn turn_on(&self) -> Result<()> {
        self.set(SwitchStatus::On)
    }

    /// Turns the switch off and persists the change.
    pub fn turn_off(&self) -> Result<()> {
        self.set(SwitchStatus::Off)
    }

    /// Sets the switch and persists the change when backed by configuration.
    pub fn set(&self, status: SwitchStatus) -> Result<()> {
        self.on.store(status.is_on(), Ordering::SeqCst);
        if let Some(source) = &self.source {
            source
                .store
                .set_property(&source.pid, &source.key, &status.is_on().to_string())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("id", &self.id)
            .field("on", &self.on.load(Ordering::SeqCst))
            .finish()
    }
}
