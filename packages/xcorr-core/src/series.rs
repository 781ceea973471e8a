// Ordered per-channel sample maps and the updates that carry them

use crate::mode::{SeriesKind, SessionMode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Total-ordered x coordinate
#[derive(Debug, Clone, Copy)]
struct XKey(f64);

impl PartialEq for XKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for XKey {}

impl PartialOrd for XKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for XKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Mapping from x coordinate (time, delay, lag or frequency) to a y value.
///
/// Keys are unique; inserting an existing x replaces its value.
/// Serializes as an array of `[x, y]` pairs in ascending x.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<[f64; 2]>", into = "Vec<[f64; 2]>")]
pub struct ChannelSeries {
    points: BTreeMap<XKey, f64>,
}

impl ChannelSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, x: f64, y: f64) {
        self.points.insert(XKey(x), y);
    }

    pub fn get(&self, x: f64) -> Option<f64> {
        self.points.get(&XKey(x)).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Points in ascending x
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points.iter().map(|(x, y)| (x.0, *y))
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.values().copied()
    }

    /// Arithmetic mean of all y values
    pub fn mean(&self) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        Some(self.points.values().sum::<f64>() / self.points.len() as f64)
    }

    /// Smallest and largest x
    pub fn x_range(&self) -> Option<(f64, f64)> {
        let first = self.points.keys().next()?;
        let last = self.points.keys().next_back()?;
        Some((first.0, last.0))
    }
}

impl FromIterator<(f64, f64)> for ChannelSeries {
    fn from_iter<I: IntoIterator<Item = (f64, f64)>>(iter: I) -> Self {
        let mut series = ChannelSeries::new();
        for (x, y) in iter {
            series.insert(x, y);
        }
        series
    }
}

impl From<Vec<[f64; 2]>> for ChannelSeries {
    fn from(points: Vec<[f64; 2]>) -> Self {
        points.into_iter().map(|[x, y]| (x, y)).collect()
    }
}

impl From<ChannelSeries> for Vec<[f64; 2]> {
    fn from(series: ChannelSeries) -> Self {
        series.iter().map(|(x, y)| [x, y]).collect()
    }
}

/// One extracted sample before accumulation; `y` is `None` when the device
/// returned a short or malformed value for this bin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    pub x: f64,
    pub y: Option<f64>,
}

impl Bin {
    pub fn new(x: f64, y: Option<f64>) -> Self {
        Self { x, y }
    }
}

/// Identifies one published curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub channel: usize,
    pub kind: SeriesKind,
}

impl SeriesKey {
    pub fn new(channel: usize, kind: SeriesKind) -> Self {
        Self { channel, kind }
    }
}

/// Snapshot of one channel's curve handed to the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepUpdate {
    pub channel: usize,
    pub mode: SessionMode,
    pub kind: SeriesKind,
    pub series: Arc<ChannelSeries>,
    /// Number of capture-loop writes to this slot so far
    pub revision: u64,
    /// Unix timestamp in seconds at publish time
    pub timestamp: f64,
}
