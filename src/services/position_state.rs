//! Debounce policy deciding when an observation is worth publishing
//!
//! A new position is published iff the focus-band centroid changed, or the
//! midline crossing changed while `report_midline` is enabled. Any change
//! counts, including appearing or disappearing. Sequence ids are stamped by
//! the publish step (`PositionServer::write_position`), which owns the slot.

use crate::domain::types::PositionUpdate;
use crate::services::analyzer::{FocusObservation, FrameGeometry};
use tracing::debug;

/// The observation fields the debounce rule compares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub focus_img_x: Option<i32>,
    pub mid_line_cross: i32,
}

impl From<&FocusObservation> for Observed {
    fn from(observation: &FocusObservation) -> Self {
        Self {
            focus_img_x: observation.focus_img_x,
            mid_line_cross: observation.mid_line_cross,
        }
    }
}

/// Whether `next` differs enough from the last published values
///
/// With nothing published yet (`previous == None`) every observation qualifies.
pub fn should_publish(previous: Option<&Observed>, next: &Observed, report_midline: bool) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    previous.focus_img_x != next.focus_img_x
        || (report_midline && previous.mid_line_cross != next.mid_line_cross)
}

/// Remembers the last published observation
pub struct PositionStateMachine {
    report_midline: bool,
    last_published: Option<Observed>,
}

impl PositionStateMachine {
    pub fn new(report_midline: bool) -> Self {
        Self { report_midline, last_published: None }
    }

    pub fn report_midline(&self) -> bool {
        self.report_midline
    }

    pub fn last_published(&self) -> Option<&Observed> {
        self.last_published.as_ref()
    }

    /// Returns the update to publish, or `None` when debounced
    ///
    /// On publication the remembered values are replaced by the new ones.
    pub fn observe(
        &mut self,
        observation: &FocusObservation,
        geometry: &FrameGeometry,
    ) -> Option<PositionUpdate> {
        let next = Observed::from(observation);
        if !should_publish(self.last_published.as_ref(), &next, self.report_midline) {
            return None;
        }

        debug!(
            focus_img_x = ?next.focus_img_x,
            mid_line_cross = %next.mid_line_cross,
            previous = ?self.last_published,
            "position_changed"
        );
        self.last_published = Some(next);
        Some(observation.position_update(geometry))
    }

    /// Forget the last published values so the next frame republishes
    pub fn reset(&mut self) {
        self.last_published = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geometry::{LineGeometry, Slope};

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(400, 400, 10, 15)
    }

    fn observation(focus_img_x: Option<i32>, mid_line_cross: i32, degrees: i32) -> FocusObservation {
        FocusObservation {
            focus_img_x,
            line: Some(LineGeometry { slope: Slope::Vertical, degrees, y_intercept: None }),
            focus_line_inter: None,
            mid_line_inter: None,
            mid_line_cross,
        }
    }

    #[test]
    fn test_should_publish_predicate() {
        let a = Observed { focus_img_x: Some(10), mid_line_cross: 5 };
        let same = a;
        let moved = Observed { focus_img_x: Some(11), ..a };
        let lost = Observed { focus_img_x: None, ..a };
        let cross = Observed { mid_line_cross: 6, ..a };

        assert!(should_publish(None, &a, false));
        assert!(!should_publish(Some(&a), &same, true));
        assert!(should_publish(Some(&a), &moved, false));
        assert!(should_publish(Some(&a), &lost, false));
        assert!(should_publish(Some(&lost), &a, false));
        assert!(!should_publish(Some(&a), &cross, false));
        assert!(should_publish(Some(&a), &cross, true));
    }

    #[test]
    fn test_identical_observations_publish_once() {
        let mut state = PositionStateMachine::new(true);
        let obs = observation(Some(220), 100, 80);
        assert!(state.observe(&obs, &geometry()).is_some());
        assert!(state.observe(&obs, &geometry()).is_none());
        assert!(state.observe(&obs, &geometry()).is_none());
    }

    #[test]
    fn test_absent_after_absent_is_debounced() {
        let mut state = PositionStateMachine::new(false);
        assert!(state.observe(&FocusObservation::ABSENT, &geometry()).is_some());
        assert!(state.observe(&FocusObservation::ABSENT, &geometry()).is_none());
    }

    #[test]
    fn test_midline_only_reported_when_enabled() {
        let mut quiet = PositionStateMachine::new(false);
        quiet.observe(&observation(Some(220), 100, 80), &geometry());
        assert!(quiet.observe(&observation(Some(220), 120, 80), &geometry()).is_none());

        let mut chatty = PositionStateMachine::new(true);
        chatty.observe(&observation(Some(220), 100, 80), &geometry());
        assert!(chatty.observe(&observation(Some(220), 120, 80), &geometry()).is_some());
    }

    #[test]
    fn test_publication_takes_all_fields_from_new_observation() {
        let mut state = PositionStateMachine::new(false);
        state.observe(&observation(Some(220), 100, 80), &geometry());

        // degrees change alone does not publish
        assert!(state.observe(&observation(Some(220), 100, 70), &geometry()).is_none());

        let update = state.observe(&observation(Some(230), 140, 60), &geometry()).unwrap();
        assert_eq!(update.degrees, Some(60));
        assert_eq!(update.mid_line_cross, 140);
        assert_eq!(update.mid_offset, 30);
        assert_eq!(
            state.last_published(),
            Some(&Observed { focus_img_x: Some(230), mid_line_cross: 140 })
        );
    }

    #[test]
    fn test_reset_forces_republish() {
        let mut state = PositionStateMachine::new(false);
        let obs = observation(None, -1, 90);
        state.observe(&obs, &geometry());
        assert!(state.observe(&obs, &geometry()).is_none());
        state.reset();
        assert!(state.observe(&obs, &geometry()).is_some());
    }
}
