//! Where to restart after a crash, and until when replayed changes must be applied idempotently.
//!
//! Queues persist their buckets independently, so after a crash some buckets can be ahead of
//! others. Reading restarts from the smallest bucket so that no queue loses a change, and every
//! change up to the largest bucket may already have been applied by some queue, so it is replayed
//! in safe mode.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::info;

use crate::error::SyncerResult;
use crate::location::Location;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    start: Location,
    safe_mode_exit: Option<Location>,
    resumed: bool,
}

impl ResumePlan {
    /// Builds the plan from the persisted buckets, starting at `initial` when nothing was
    /// persisted yet.
    pub fn from_checkpoints(
        checkpoints: &BTreeMap<String, Location>,
        initial: Location,
    ) -> SyncerResult<Self> {
        let mut buckets = checkpoints.values();
        let Some(first) = buckets.next() else {
            info!(start = %initial, "no checkpoint persisted, starting from the initial location");

            return Ok(Self {
                start: initial,
                safe_mode_exit: None,
                resumed: false,
            });
        };

        let mut min = first;
        let mut max = first;
        for location in buckets {
            if location.compare(min)? == Ordering::Less {
                min = location;
            }
            if location.compare(max)? == Ordering::Greater {
                max = location;
            }
        }

        let plan = Self {
            start: min.clone(),
            safe_mode_exit: (min != max).then(|| max.clone()),
            resumed: true,
        };
        info!(
            start = %plan.start,
            safe_mode_exit = ?plan.safe_mode_exit,
            "resuming from checkpoints"
        );

        Ok(plan)
    }

    /// Location reading restarts from.
    pub fn start(&self) -> &Location {
        &self.start
    }

    /// Location after which changes no longer need safe mode, `None` when all buckets agree.
    pub fn safe_mode_exit(&self) -> Option<&Location> {
        self.safe_mode_exit.as_ref()
    }

    /// Returns whether the plan restarts from persisted checkpoints.
    ///
    /// Changes read after a restart may have been written before the crash even past the largest
    /// bucket, up to the first transaction commit.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Returns whether a change ending at `location` may have been applied already.
    pub fn requires_safe_mode(&self, location: &Location) -> SyncerResult<bool> {
        match &self.safe_mode_exit {
            Some(exit) => Ok(location.compare(exit)? != Ordering::Greater),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::location::Position;

    fn location(name: &str, pos: u32) -> Location {
        Location::with_position(Position::new(name, pos), None)
    }

    #[test]
    fn starts_from_initial_without_checkpoints() {
        let plan =
            ResumePlan::from_checkpoints(&BTreeMap::new(), location("mysql-bin.000001", 4))
                .unwrap();

        assert_eq!(plan.start(), &location("mysql-bin.000001", 4));
        assert_eq!(plan.safe_mode_exit(), None);
        assert!(!plan.is_resumed());
        assert!(!plan.requires_safe_mode(&location("mysql-bin.000001", 100)).unwrap());
    }

    #[test]
    fn starts_from_minimum_and_exits_safe_mode_after_maximum() {
        let checkpoints = BTreeMap::from([
            ("q_0".to_owned(), location("mysql-bin.000002", 120)),
            ("q_1".to_owned(), location("mysql-bin.000001", 900)),
            ("q_2".to_owned(), location("mysql-bin.000002", 40)),
        ]);

        let plan = ResumePlan::from_checkpoints(&checkpoints, Location::zero()).unwrap();

        assert_eq!(plan.start(), &location("mysql-bin.000001", 900));
        assert_eq!(plan.safe_mode_exit(), Some(&location("mysql-bin.000002", 120)));
        assert!(plan.requires_safe_mode(&location("mysql-bin.000002", 120)).unwrap());
        assert!(!plan.requires_safe_mode(&location("mysql-bin.000002", 121)).unwrap());
    }

    #[test]
    fn equal_buckets_need_no_safe_mode() {
        let checkpoints = BTreeMap::from([
            ("q_0".to_owned(), location("mysql-bin.000003", 10)),
            ("q_1".to_owned(), location("mysql-bin.000003", 10)),
        ]);

        let plan = ResumePlan::from_checkpoints(&checkpoints, Location::zero()).unwrap();

        assert_eq!(plan.start(), &location("mysql-bin.000003", 10));
        assert_eq!(plan.safe_mode_exit(), None);
        assert!(plan.is_resumed());
    }

    #[test]
    fn buckets_of_different_sources_are_rejected() {
        let checkpoints = BTreeMap::from([
            ("q_0".to_owned(), location("mysql-bin.000003", 10)),
            ("q_1".to_owned(), location("relay-bin.000001", 10)),
        ]);

        let err = ResumePlan::from_checkpoints(&checkpoints, Location::zero()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleLocations);
    }
}
