//! Alignment feedback (indicator lights)
//!
//! The control loop reports a tri-state alignment every frame. Implementations
//! are fire-and-forget and must never fail the loop.

use crate::domain::types::Alignment;
use tracing::info;

pub trait Indicator: Send {
    fn show(&mut self, alignment: Alignment);

    /// Turn the indicator off
    fn clear(&mut self);
}

/// Logs alignment transitions
#[derive(Debug, Default)]
pub struct LogIndicator {
    current: Option<Alignment>,
}

impl LogIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Alignment> {
        self.current
    }
}

impl Indicator for LogIndicator {
    fn show(&mut self, alignment: Alignment) {
        if self.current != Some(alignment) {
            info!(alignment = %alignment.as_str(), "indicator_changed");
            self.current = Some(alignment);
        }
    }

    fn clear(&mut self) {
        if self.current.take().is_some() {
            info!("indicator_cleared");
        }
    }
}
