use std::time::{Duration, Instant};

use crate::geometry::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoverTimings {
    pub confirm_new: Duration,
    pub refresh: Duration,
    pub clear: Duration,
}

impl Default for HoverTimings {
    fn default() -> Self {
        Self {
            confirm_new: Duration::from_millis(300),
            refresh: Duration::from_millis(100),
            clear: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HoverTarget {
    pub viewport_index: usize,
    pub generation: u64,
    pub client_id: String,
    /// Display-space position the tooltip follows.
    pub anchor: Point,
}

impl HoverTarget {
    pub fn same_shape(&self, other: &HoverTarget) -> bool {
        self.viewport_index == other.viewport_index
            && self.generation == other.generation
            && self.client_id == other.client_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HoverEvent {
    Entered(HoverTarget),
    Moved(HoverTarget),
    Cleared(HoverTarget),
}

#[derive(Debug, Clone, PartialEq)]
enum HoverState {
    Idle,
    PendingNew {
        candidate: HoverTarget,
        due: Instant,
        showing: Option<HoverTarget>,
    },
    Confirmed(HoverTarget),
    PendingRefresh {
        target: HoverTarget,
        due: Instant,
    },
    PendingClear {
        showing: HoverTarget,
        due: Instant,
    },
}

/// Debounced hover confirmation. Every pointer event replaces whatever timer
/// is pending; `tick` fires the timer once its deadline has passed.
#[derive(Debug)]
pub struct HoverTracker {
    timings: HoverTimings,
    state: HoverState,
}

impl Default for HoverTracker {
    fn default() -> Self {
        Self::new(HoverTimings::default())
    }
}

impl HoverTracker {
    pub fn new(timings: HoverTimings) -> Self {
        Self {
            timings,
            state: HoverState::Idle,
        }
    }

    /// The hover currently on screen, if any.
    pub fn current(&self) -> Option<&HoverTarget> {
        match &self.state {
            HoverState::Idle => None,
            HoverState::PendingNew { showing, .. } => showing.as_ref(),
            HoverState::Confirmed(target) => Some(target),
            HoverState::PendingRefresh { target, .. } => Some(target),
            HoverState::PendingClear { showing, .. } => Some(showing),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            HoverState::PendingNew { due, .. }
            | HoverState::PendingRefresh { due, .. }
            | HoverState::PendingClear { due, .. } => Some(*due),
            HoverState::Idle | HoverState::Confirmed(_) => None,
        }
    }

    pub fn pointer(&mut self, now: Instant, candidate: Option<HoverTarget>) {
        let showing = self.current().cloned();
        self.state = match (showing, candidate) {
            (None, None) => HoverState::Idle,
            (showing, Some(candidate))
                if showing
                    .as_ref()
                    .is_some_and(|shown| shown.same_shape(&candidate)) =>
            {
                HoverState::PendingRefresh {
                    target: candidate,
                    due: now + self.timings.refresh,
                }
            }
            (showing, Some(candidate)) => HoverState::PendingNew {
                candidate,
                due: now + self.timings.confirm_new,
                showing,
            },
            (Some(showing), None) => HoverState::PendingClear {
                showing,
                due: now + self.timings.clear,
            },
        };
    }

    pub fn tick(&mut self, now: Instant) -> Option<HoverEvent> {
        let due = self.next_deadline()?;
        if now < due {
            return None;
        }
        let state = std::mem::replace(&mut self.state, HoverState::Idle);
        match state {
            HoverState::PendingNew { candidate, .. } => {
                self.state = HoverState::Confirmed(candidate.clone());
                Some(HoverEvent::Entered(candidate))
            }
            HoverState::PendingRefresh { target, .. } => {
                self.state = HoverState::Confirmed(target.clone());
                Some(HoverEvent::Moved(target))
            }
            HoverState::PendingClear { showing, .. } => Some(HoverEvent::Cleared(showing)),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Re-evaluates a still pointer after the shapes under it changed, as on a
    /// frame change or delete. A hover whose shape is no longer under the
    /// pointer is cleared at once; a new candidate still needs its dwell.
    pub fn retarget(&mut self, now: Instant, candidate: Option<HoverTarget>) -> Option<HoverEvent> {
        match (&mut self.state, candidate.as_ref()) {
            (HoverState::PendingNew { candidate: pending, .. }, Some(next))
                if pending.same_shape(next) =>
            {
                *pending = next.clone();
                return None;
            }
            (HoverState::Confirmed(shown), Some(next)) if shown.same_shape(next) => {
                *shown = next.clone();
                return Some(HoverEvent::Moved(next.clone()));
            }
            _ => {}
        }
        let showing = self.current().cloned();
        let still_under = showing
            .as_ref()
            .zip(candidate.as_ref())
            .is_some_and(|(shown, next)| shown.same_shape(next));
        match showing {
            Some(shown) if !still_under => {
                self.state = HoverState::Idle;
                self.pointer(now, candidate);
                Some(HoverEvent::Cleared(shown))
            }
            _ => {
                self.pointer(now, candidate);
                None
            }
        }
    }

    /// Drops any hover tied to a viewport whose binding changed or was torn down.
    pub fn invalidate_viewport(&mut self, viewport_index: usize) -> Option<HoverEvent> {
        let showing = self.current().cloned();
        let pending_here = matches!(
            &self.state,
            HoverState::PendingNew { candidate, .. } if candidate.viewport_index == viewport_index
        );
        match showing {
            Some(shown) if shown.viewport_index == viewport_index => {
                self.state = HoverState::Idle;
                Some(HoverEvent::Cleared(shown))
            }
            Some(shown) if pending_here => {
                self.state = HoverState::Confirmed(shown);
                None
            }
            None if pending_here => {
                self.state = HoverState::Idle;
                None
            }
            _ => None,
        }
    }

    pub fn reset(&mut self) -> Option<HoverEvent> {
        let showing = self.current().cloned();
        self.state = HoverState::Idle;
        showing.map(HoverEvent::Cleared)
    }
}
