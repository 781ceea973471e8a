// Latest-value slots and the rate-limited publisher
//
// The capture loop overwrites one slot per (channel, kind); it never waits for
// consumers. The publisher reads the slots on its own cadence and hands a
// snapshot of each to the sink. A slot whose previous delivery is still
// running is skipped for that tick, so a slow sink holds at most one update
// per slot.

use crate::mode::SessionMode;
use crate::series::{ChannelSeries, SeriesKey, SweepUpdate};
use crate::sink::Sink;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct Slot {
    series: RwLock<Arc<ChannelSeries>>,
    revision: AtomicU64,
    in_flight: Arc<AtomicBool>,
}

impl Slot {
    fn new() -> Self {
        Self {
            series: RwLock::new(Arc::new(ChannelSeries::new())),
            revision: AtomicU64::new(0),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Holds a busy flag for the lifetime of one delivery
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    /// Claim the flag; None if a delivery already holds it
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Latest finished series per channel and kind
#[derive(Default)]
pub struct SeriesStore {
    slots: RwLock<BTreeMap<SeriesKey, Arc<Slot>>>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: SeriesKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(&key) {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.slots
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    /// Replace a slot's series; returns the new revision
    pub fn publish(&self, key: SeriesKey, series: ChannelSeries) -> u64 {
        let slot = self.slot(key);
        *slot.series.write() = Arc::new(series);
        slot.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn snapshot(&self, key: SeriesKey) -> Option<Arc<ChannelSeries>> {
        let slots = self.slots.read();
        slots.get(&key).map(|slot| Arc::clone(&slot.series.read()))
    }

    /// Writes to the slot so far, 0 when it does not exist
    pub fn revision(&self, key: SeriesKey) -> u64 {
        self.slots
            .read()
            .get(&key)
            .map_or(0, |slot| slot.revision.load(Ordering::Acquire))
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        self.slots.read().keys().copied().collect()
    }

    /// Drop every slot
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    fn entries(&self) -> Vec<(SeriesKey, Arc<Slot>)> {
        self.slots
            .read()
            .iter()
            .map(|(key, slot)| (*key, Arc::clone(slot)))
            .collect()
    }
}

/// Outcome of one publish tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Publisher {
    store: Arc<SeriesStore>,
    sink: Arc<dyn Sink>,
    progress_in_flight: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(store: Arc<SeriesStore>, sink: Arc<dyn Sink>) -> Self {
        Self {
            store,
            sink,
            progress_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hand every slot's current series to the sink.
    ///
    /// Deliveries run on the blocking pool; must be called inside a tokio runtime.
    pub fn tick(&self, mode: SessionMode) -> PublishReport {
        let mut report = PublishReport::default();
        let now = chrono::Utc::now();
        let timestamp = now.timestamp() as f64 + now.timestamp_subsec_millis() as f64 / 1000.0;

        for (key, slot) in self.store.entries() {
            let Some(guard) = InFlightGuard::acquire(&slot.in_flight) else {
                log::debug!(
                    "Sink still busy with channel {} ({}), dropping update",
                    key.channel,
                    key.kind
                );
                report.dropped += 1;
                continue;
            };

            let update = SweepUpdate {
                channel: key.channel,
                mode,
                kind: key.kind,
                series: Arc::clone(&slot.series.read()),
                revision: slot.revision.load(Ordering::Acquire),
                timestamp,
            };
            let sink = Arc::clone(&self.sink);
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                sink.on_sweep_update(&update);
            });
            report.delivered += 1;
        }

        report
    }

    /// Forward scan progress; skipped while the previous report is still being consumed
    pub fn progress(&self, percent: f64) -> bool {
        let Some(guard) = InFlightGuard::acquire(&self.progress_in_flight) else {
            return false;
        };
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            sink.on_progress(percent);
        });
        true
    }

    /// Deliveries started but not yet returned from the sink
    pub fn in_flight(&self) -> usize {
        self.store
            .entries()
            .iter()
            .filter(|(_, slot)| slot.in_flight.load(Ordering::Acquire))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::SeriesKind;
    use crate::sink::{OverflowStrategy, QueueSink};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct GateSink {
        gate: Mutex<()>,
        delivered: AtomicU64,
    }

    impl Sink for GateSink {
        fn on_connection_changed(&self, _connected: bool) {}

        fn on_sweep_update(&self, _update: &SweepUpdate) {
            let _open = self.gate.lock();
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }

        fn on_progress(&self, _percent: f64) {}
    }

    fn plain_key(channel: usize) -> SeriesKey {
        SeriesKey::new(channel, SeriesKind::Plain)
    }

    fn series(values: &[f64]) -> ChannelSeries {
        values.iter().enumerate().map(|(i, v)| (i as f64, *v)).collect()
    }

    async fn wait_idle(publisher: &Publisher) {
        for _ in 0..200 {
            if publisher.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("deliveries did not finish");
    }

    #[test]
    fn test_revisions_count_writes() {
        let store = SeriesStore::new();
        let key = plain_key(1);
        assert_eq!(store.revision(key), 0);
        assert_eq!(store.publish(key, series(&[1.0])), 1);
        assert_eq!(store.publish(key, series(&[2.0])), 2);
        assert_eq!(store.snapshot(key).unwrap().get(0.0), Some(2.0));
        store.clear();
        assert!(store.is_empty());
        assert!(store.snapshot(key).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tick_delivers_snapshot_per_slot() {
        let store = Arc::new(SeriesStore::new());
        let sink = Arc::new(QueueSink::new(16, OverflowStrategy::DropNewest));
        let publisher = Publisher::new(Arc::clone(&store), sink.clone());
        store.publish(plain_key(0), series(&[0.5]));
        store.publish(SeriesKey::new(0, SeriesKind::Log), series(&[0.7]));
        store.publish(plain_key(1), series(&[0.25]));

        let report = publisher.tick(SessionMode::counter());
        assert_eq!(report, PublishReport { delivered: 3, dropped: 0 });
        wait_idle(&publisher).await;
        assert_eq!(sink.drain().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_slot_is_dropped_not_queued() {
        let store = Arc::new(SeriesStore::new());
        let sink = Arc::new(GateSink {
            gate: Mutex::new(()),
            delivered: AtomicU64::new(0),
        });
        let publisher = Publisher::new(Arc::clone(&store), sink.clone());
        store.publish(plain_key(0), series(&[1.0]));

        let held = sink.gate.lock();
        assert_eq!(publisher.tick(SessionMode::counter()).delivered, 1);
        for _ in 0..5 {
            let report = publisher.tick(SessionMode::counter());
            assert_eq!(report, PublishReport { delivered: 0, dropped: 1 });
        }
        assert_eq!(publisher.in_flight(), 1);
        drop(held);

        wait_idle(&publisher).await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.tick(SessionMode::counter()).delivered, 1);
        wait_idle(&publisher).await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);
    }
}
