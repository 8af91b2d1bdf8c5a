//! Positions in the source change stream.
//!
//! A [`Location`] pairs a physical [`Position`] (log file name and offset) with an optional
//! [`GtidSet`]. Every job carries three locations (see [`EventContext`]) so that the checkpoint
//! can be advanced safely after a crash.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bail;
use crate::error::{ErrorKind, SyncerError, SyncerResult};

/// Offset of the first event in a log file, right after the file header.
pub const MIN_LOG_POSITION: u32 = 4;

/// Physical position in the change log: file name plus offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub name: String,
    pub pos: u32,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// Splits a `<base>.<index>` file name.
    fn split_name(&self) -> Option<(&str, u64)> {
        let (base, index) = self.name.rsplit_once('.')?;
        let index = index.parse().ok()?;

        Some((base, index))
    }

    /// Orders two positions of the same source.
    ///
    /// An empty file name is an unset position and sorts before any named file. Named files with
    /// different base names belong to different sources and cannot be ordered.
    pub fn compare(&self, other: &Position) -> SyncerResult<Ordering> {
        let name_ordering = match (self.name.is_empty(), other.name.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => match (self.split_name(), other.split_name()) {
                (Some((base, index)), Some((other_base, other_index))) if base == other_base => {
                    index.cmp(&other_index)
                }
                _ if self.name == other.name => Ordering::Equal,
                _ => bail!(
                    ErrorKind::IncompatibleLocations,
                    "Positions belong to different source streams",
                    format!("cannot compare `{}` with `{}`", self.name, other.name)
                ),
            },
        };

        Ok(name_ordering.then(self.pos.cmp(&other.pos)))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

/// Set of global transaction identifiers, as `uuid:1-5:7,uuid2:1-3`.
///
/// Intervals are inclusive and kept merged and sorted per source id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GtidSet {
    intervals: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Adds the transactions `start..=end` of `source_id`.
    pub fn add(&mut self, source_id: &str, start: u64, end: u64) {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let intervals = self
            .intervals
            .entry(source_id.to_ascii_lowercase())
            .or_default();
        intervals.push((start, end));
        merge_intervals(intervals);
    }

    /// Returns `true` if every transaction of `other` is part of this set.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.intervals.iter().all(|(source_id, intervals)| {
            let Some(own) = self.intervals.get(source_id) else {
                return false;
            };

            intervals.iter().all(|&(start, end)| {
                own.iter()
                    .any(|&(own_start, own_end)| own_start <= start && end <= own_end)
            })
        })
    }
}

fn merge_intervals(intervals: &mut Vec<(u64, u64)>) {
    intervals.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for &(start, end) in intervals.iter() {
        match merged.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    *intervals = merged;
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (source_id, intervals)) in self.intervals.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(source_id)?;
            for &(start, end) in intervals {
                if start == end {
                    write!(f, ":{start}")?;
                } else {
                    write!(f, ":{start}-{end}")?;
                }
            }
        }

        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = SyncerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();

        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(':');
            let source_id = parts.next().unwrap_or_default();
            if source_id.is_empty() {
                bail!(
                    ErrorKind::InvalidData,
                    "Invalid GTID set",
                    format!("missing source id in `{entry}`")
                );
            }

            let mut has_interval = false;
            for interval in parts {
                let (start, end) = interval.split_once('-').unwrap_or((interval, interval));
                let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                    bail!(
                        ErrorKind::InvalidData,
                        "Invalid GTID set",
                        format!("invalid interval `{interval}` in `{entry}`")
                    );
                };
                set.add(source_id, start, end);
                has_interval = true;
            }

            if !has_interval {
                bail!(
                    ErrorKind::InvalidData,
                    "Invalid GTID set",
                    format!("no transaction interval in `{entry}`")
                );
            }
        }

        Ok(set)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// A resumable position in the change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_set: Option<GtidSet>,
}

impl Location {
    /// Location of the first event of the log file `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            position: Position::new(name, MIN_LOG_POSITION),
            gtid_set: None,
        }
    }

    pub fn with_position(position: Position, gtid_set: Option<GtidSet>) -> Self {
        Self { position, gtid_set }
    }

    /// Zero value of the stream, used by jobs that do not come from an event.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// Orders two locations by position, falling back to GTID set containment on ties.
    ///
    /// Fails when the locations come from different sources, or when the positions tie but the
    /// GTID sets are unrelated, since no safe ordering exists in either case.
    pub fn compare(&self, other: &Location) -> SyncerResult<Ordering> {
        let ordering = self.position.compare(&other.position)?;
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }

        let empty = GtidSet::new();
        let own = self.gtid_set.as_ref().unwrap_or(&empty);
        let theirs = other.gtid_set.as_ref().unwrap_or(&empty);

        match (own.contains(theirs), theirs.contains(own)) {
            (true, true) => Ok(Ordering::Equal),
            (true, false) => Ok(Ordering::Greater),
            (false, true) => Ok(Ordering::Less),
            (false, false) => bail!(
                ErrorKind::OrderingViolation,
                "Locations with the same position have unrelated GTID sets",
                format!("cannot order `{self}` and `{other}`")
            ),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "position: {}, gtid-set: ", self.position)?;
        if let Some(gtid_set) = &self.gtid_set {
            write!(f, "{gtid_set}")?;
        }

        Ok(())
    }
}

/// The three locations attached to every event.
///
/// `start_location` is where the event begins, `current_location` where it ends and
/// `last_location` the last location known to be safe to checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    pub start_location: Location,
    pub current_location: Location,
    pub last_location: Location,
}

impl EventContext {
    /// Context where all three locations are `location`.
    pub fn at(location: Location) -> Self {
        Self {
            start_location: location.clone(),
            current_location: location.clone(),
            last_location: location,
        }
    }
}

/// Tracks the location of the stream as events are read.
#[derive(Debug, Clone)]
pub struct LocationTracker {
    current: Location,
    last: Location,
}

impl LocationTracker {
    /// Starts tracking from `location`, which is considered safe.
    pub fn new(location: Location) -> Self {
        Self {
            current: location.clone(),
            last: location,
        }
    }

    pub fn current(&self) -> &Location {
        &self.current
    }

    /// Last location known to be safe to checkpoint.
    pub fn last(&self) -> &Location {
        &self.last
    }

    /// Moves to the end location of the next event and returns its context.
    ///
    /// Locations never go backwards within one stream, a smaller location is an ordering
    /// violation.
    pub fn advance(&mut self, next: Location) -> SyncerResult<EventContext> {
        if self.current.compare(&next)? == Ordering::Greater {
            bail!(
                ErrorKind::OrderingViolation,
                "Change stream location moved backwards",
                format!("current `{}`, next `{next}`", self.current)
            );
        }

        let context = EventContext {
            start_location: self.current.clone(),
            current_location: next.clone(),
            last_location: self.last.clone(),
        };
        self.current = next;

        Ok(context)
    }

    /// Switches to a new log file, keeping the GTID set.
    pub fn rotate(&mut self, name: impl Into<String>, pos: u32) -> SyncerResult<EventContext> {
        let next = Location::with_position(Position::new(name, pos), self.current.gtid_set.clone());
        self.advance(next)
    }

    /// Marks everything up to the current location as processed.
    pub fn mark_processed(&mut self) {
        self.last = self.current.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(name: &str, pos: u32) -> Location {
        Location::with_position(Position::new(name, pos), None)
    }

    fn gtid(value: &str) -> GtidSet {
        value.parse().unwrap()
    }

    #[test]
    fn renders_location() {
        assert_eq!(Location::new("").to_string(), "position: (, 4), gtid-set: ");
        assert_eq!(Location::zero().to_string(), "position: (, 0), gtid-set: ");

        let with_gtid = Location::with_position(
            Position::new("mysql-bin.000002", 1200),
            Some(gtid("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5")),
        );
        assert_eq!(
            with_gtid.to_string(),
            "position: (mysql-bin.000002, 1200), gtid-set: 3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5"
        );
    }

    #[test]
    fn compares_by_position() {
        let a = location("mysql-bin.000001", 400);
        let b = location("mysql-bin.000001", 900);
        let c = location("mysql-bin.000002", 4);

        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(b.compare(&a).unwrap(), Ordering::Greater);
        assert_eq!(a.compare(&a).unwrap(), Ordering::Equal);
        assert_eq!(b.compare(&c).unwrap(), Ordering::Less);
        assert_eq!(Location::zero().compare(&a).unwrap(), Ordering::Less);
    }

    #[test]
    fn file_index_is_compared_numerically() {
        let a = location("mysql-bin.9", 100);
        let b = location("mysql-bin.10", 4);

        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
    }

    #[test]
    fn different_sources_cannot_be_compared() {
        let a = location("mysql-bin.000001", 4);
        let b = location("relay-bin.000001", 4);

        let err = a.compare(&b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleLocations);
    }

    #[test]
    fn gtid_superset_breaks_position_ties() {
        let position = Position::new("mysql-bin.000001", 100);
        let small = Location::with_position(position.clone(), Some(gtid("aaa:1-5")));
        let large = Location::with_position(position.clone(), Some(gtid("aaa:1-7")));
        let other = Location::with_position(position.clone(), Some(gtid("bbb:1")));

        assert_eq!(small.compare(&large).unwrap(), Ordering::Less);
        assert_eq!(large.compare(&small).unwrap(), Ordering::Greater);
        assert_eq!(large.compare(&large.clone()).unwrap(), Ordering::Equal);
        assert_eq!(
            small.compare(&other).unwrap_err().kind(),
            ErrorKind::OrderingViolation
        );
    }

    #[test]
    fn gtid_set_parses_and_merges_intervals() {
        let set = gtid("AAA:1-3:4-6:9, bbb:2");

        assert_eq!(set.to_string(), "aaa:1-6:9,bbb:2");
        assert!(set.contains(&gtid("aaa:2-5")));
        assert!(!set.contains(&gtid("aaa:7")));
        assert!(set.contains(&GtidSet::new()));
        assert!("aaa".parse::<GtidSet>().is_err());
        assert!("aaa:x-2".parse::<GtidSet>().is_err());
    }

    #[test]
    fn location_serializes_gtid_set_as_text() {
        let location = Location::with_position(
            Position::new("mysql-bin.000003", 77),
            Some(gtid("aaa:1-2")),
        );

        let json = serde_json::to_string(&location).unwrap();
        assert_eq!(
            json,
            r#"{"position":{"name":"mysql-bin.000003","pos":77},"gtid_set":"aaa:1-2"}"#
        );
        assert_eq!(serde_json::from_str::<Location>(&json).unwrap(), location);
    }

    #[test]
    fn tracker_builds_event_contexts() {
        let mut tracker = LocationTracker::new(location("mysql-bin.000001", 4));

        let first = tracker.advance(location("mysql-bin.000001", 120)).unwrap();
        assert_eq!(first.start_location, location("mysql-bin.000001", 4));
        assert_eq!(first.current_location, location("mysql-bin.000001", 120));
        assert_eq!(first.last_location, location("mysql-bin.000001", 4));

        tracker.mark_processed();
        let second = tracker.advance(location("mysql-bin.000001", 300)).unwrap();
        assert_eq!(second.start_location, location("mysql-bin.000001", 120));
        assert_eq!(second.last_location, location("mysql-bin.000001", 120));

        let rotated = tracker.rotate("mysql-bin.000002", MIN_LOG_POSITION).unwrap();
        assert_eq!(rotated.current_location, location("mysql-bin.000002", 4));
    }

    #[test]
    fn tracker_rejects_backwards_locations() {
        let mut tracker = LocationTracker::new(location("mysql-bin.000002", 500));

        let err = tracker
            .advance(location("mysql-bin.000002", 100))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderingViolation);
        assert_eq!(tracker.current(), &location("mysql-bin.000002", 500));
    }
}
