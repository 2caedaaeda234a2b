use std::time::{Duration, Instant};

use protocol::{InteractionSignals, TreePriority};

/// Decides tree priority from the interaction signals sampled at each tick.
///
/// Active interaction raises smoothness priority until `expiration` after the
/// last tick that observed it. A surface that must show new content overrides
/// smoothness.
#[derive(Debug, Clone)]
pub struct TreePriorityArbiter {
    expiration: Duration,
    signals: InteractionSignals,
    smoothness_expires_at: Option<Instant>,
    current: TreePriority,
}

impl TreePriorityArbiter {
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            signals: InteractionSignals::default(),
            smoothness_expires_at: None,
            current: TreePriority::SamePriorityForBothTrees,
        }
    }

    pub fn current(&self) -> TreePriority {
        self.current
    }

    pub fn signals(&self) -> InteractionSignals {
        self.signals
    }

    pub fn set_signals(&mut self, signals: InteractionSignals) {
        self.signals = signals;
    }

    pub fn smoothness_expires_at(&self) -> Option<Instant> {
        self.smoothness_expires_at
    }

    /// Re-evaluate at `now`. Returns the new priority only when it changed.
    pub fn evaluate(&mut self, now: Instant) -> Option<TreePriority> {
        if self.signals.interaction_active() {
            self.smoothness_expires_at = Some(now + self.expiration);
        }
        let smoothness_active = match self.smoothness_expires_at {
            Some(expires_at) if now < expires_at => true,
            Some(_) => {
                self.smoothness_expires_at = None;
                false
            }
            None => false,
        };

        let next = if self.signals.requires_new_content() {
            TreePriority::NewContentTakesPriority
        } else if smoothness_active {
            TreePriority::SmoothnessTakesPriority
        } else {
            TreePriority::SamePriorityForBothTrees
        };

        if next == self.current {
            return None;
        }
        tracing::debug!(from = ?self.current, to = ?next, "tree priority changed");
        self.current = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRATION: Duration = Duration::from_millis(250);

    fn scrolling() -> InteractionSignals {
        InteractionSignals {
            scroll_gesture_active: true,
            ..InteractionSignals::default()
        }
    }

    #[test]
    fn interaction_raises_smoothness_then_expires() {
        let origin = Instant::now();
        let mut arbiter = TreePriorityArbiter::new(EXPIRATION);

        arbiter.set_signals(scrolling());
        assert_eq!(
            arbiter.evaluate(origin),
            Some(TreePriority::SmoothnessTakesPriority)
        );

        arbiter.set_signals(InteractionSignals::default());
        assert_eq!(arbiter.evaluate(origin + Duration::from_millis(100)), None);
        assert_eq!(arbiter.current(), TreePriority::SmoothnessTakesPriority);

        assert_eq!(
            arbiter.evaluate(origin + Duration::from_millis(251)),
            Some(TreePriority::SamePriorityForBothTrees)
        );
        assert_eq!(arbiter.smoothness_expires_at(), None);
    }

    #[test]
    fn continued_interaction_extends_expiration() {
        let origin = Instant::now();
        let mut arbiter = TreePriorityArbiter::new(EXPIRATION);
        arbiter.set_signals(InteractionSignals {
            pinch_active: true,
            ..InteractionSignals::default()
        });
        arbiter.evaluate(origin);
        arbiter.evaluate(origin + Duration::from_millis(200));

        arbiter.set_signals(InteractionSignals::default());
        assert_eq!(arbiter.evaluate(origin + Duration::from_millis(400)), None);
        assert_eq!(arbiter.current(), TreePriority::SmoothnessTakesPriority);
    }

    #[test]
    fn new_content_override_wins_over_interaction() {
        let origin = Instant::now();
        let mut arbiter = TreePriorityArbiter::new(EXPIRATION);
        arbiter.set_signals(InteractionSignals {
            pointer_gesture_active: true,
            critical_resource_evicted: true,
            ..InteractionSignals::default()
        });
        assert_eq!(
            arbiter.evaluate(origin),
            Some(TreePriority::NewContentTakesPriority)
        );

        arbiter.set_signals(scrolling());
        assert_eq!(
            arbiter.evaluate(origin + Duration::from_millis(16)),
            Some(TreePriority::SmoothnessTakesPriority)
        );
    }
}
