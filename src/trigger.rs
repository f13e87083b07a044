//! Trigger debouncing
//!
//! An external recognizer reports one label per observed frame. A command
//! fires once the same label has been seen for a fixed number of consecutive
//! observations, and only once per hold.

use crate::config::TriggerSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label reported when nothing is recognized
pub const NO_LABEL: &str = "None";

/// Discrete commands the recorder understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerCommand {
    Start,
    Stop,
    Reset,
}

/// Counts consecutive identical observations
#[derive(Debug, Clone)]
pub struct ConfirmationWindow<T> {
    threshold: u32,
    current: Option<T>,
    count: u32,
}

impl<T: PartialEq + Clone> ConfirmationWindow<T> {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            current: None,
            count: 0,
        }
    }

    /// Record one observation. `None` means nothing was observed.
    ///
    /// Returns the value on the observation that reaches the threshold, and
    /// only then: holding the same value longer does not fire again.
    pub fn observe(&mut self, value: Option<T>) -> Option<T> {
        let Some(value) = value else {
            self.reset();
            return None;
        };

        if self.current.as_ref() == Some(&value) {
            self.count = self.count.saturating_add(1);
        } else {
            self.current = Some(value.clone());
            self.count = 1;
        }

        (self.count == self.threshold).then_some(value)
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.count = 0;
    }

    /// Consecutive observations of the current value
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// Maps recognizer labels to commands, debounced
pub struct TriggerMap {
    bindings: HashMap<String, TriggerCommand>,
    window: ConfirmationWindow<String>,
}

impl TriggerMap {
    pub fn new(settings: &TriggerSettings) -> Self {
        Self {
            bindings: settings.bindings.clone(),
            window: ConfirmationWindow::new(settings.confirmation_frames),
        }
    }

    /// Feed one observed label. Returns a command when one is confirmed.
    pub fn observe(&mut self, label: &str) -> Option<TriggerCommand> {
        let observed = (label != NO_LABEL && !label.is_empty()).then(|| label.to_string());
        let confirmed = self.window.observe(observed)?;
        let command = self.bindings.get(&confirmed).copied();
        match command {
            Some(command) => tracing::debug!("Trigger {:?} confirmed from {}", command, confirmed),
            None => tracing::trace!("Label {} confirmed with no binding", confirmed),
        }
        command
    }

    /// Progress of the current hold, 0.0 to 1.0
    pub fn progress(&self) -> f32 {
        (self.window.count() as f32 / self.window.threshold() as f32).min(1.0)
    }
}
