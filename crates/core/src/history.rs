//! Time series of one tracked class, fed from the per-class aggregate
//! arrays every time the agent reports them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memcct_protocol::SharedStr;

/// Notified after every appended sample and after every (re)setup. Called
/// without the manager lock held, so it may read the manager back.
pub trait HistoryListener: Send + Sync {
    fn history_changed(&self, class_id: Option<usize>, n_items: usize);
}

#[derive(Debug, Default)]
struct Series {
    tracked_class: Option<(usize, SharedStr)>,
    n_items: usize,
    timestamps: Vec<u64>,
    alloc_counts: Vec<i64>,
    alloc_bytes: Vec<i64>,
    live_counts: Vec<i64>,
    live_bytes: Vec<i64>,
}

impl Series {
    fn reset(&mut self, buffer_size: usize) {
        self.n_items = 0;
        for v in [
            &mut self.alloc_counts,
            &mut self.alloc_bytes,
            &mut self.live_counts,
            &mut self.live_bytes,
        ] {
            v.clear();
            v.resize(buffer_size, 0);
        }
        self.timestamps.clear();
        self.timestamps.resize(buffer_size, 0);
    }

    /// Slot for the next sample, growing every array by one buffer step when
    /// full.
    fn next_slot(&mut self, buffer_size: usize) -> usize {
        if self.n_items == self.timestamps.len() {
            let new_len = self.timestamps.len() + buffer_size;
            self.timestamps.resize(new_len, 0);
            for v in [
                &mut self.alloc_counts,
                &mut self.alloc_bytes,
                &mut self.live_counts,
                &mut self.live_bytes,
            ] {
                v.resize(new_len, 0);
            }
        }
        let slot = self.n_items;
        self.n_items += 1;
        slot
    }
}

/// Internally synchronized recorder. The producer (event thread) and the
/// readers (charts) may call it concurrently; every method takes the same
/// lock.
pub struct ClassHistoryDataManager {
    buffer_size: usize,
    series: Mutex<Series>,
    listeners: Mutex<Vec<Arc<dyn HistoryListener>>>,
}

impl ClassHistoryDataManager {
    /// `buffer_size` is both the initial capacity and the growth step.
    /// Zero is treated as one.
    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let mut series = Series::default();
        series.reset(buffer_size);
        Self {
            buffer_size,
            series: Mutex::new(series),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HistoryListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn HistoryListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Start tracking `class_id`, discarding every earlier sample.
    pub fn setup_class(&self, class_id: usize, class_name: impl Into<SharedStr>) {
        {
            let mut series = lock(&self.series);
            series.reset(self.buffer_size);
            series.tracked_class = Some((class_id, class_name.into()));
        }
        tracing::debug!(class_id, "class history tracking started");
        self.notify(Some(class_id), 0);
    }

    /// Stop tracking and drop every sample.
    pub fn reset_class(&self) {
        {
            let mut series = lock(&self.series);
            series.reset(self.buffer_size);
            series.tracked_class = None;
        }
        self.notify(None, 0);
    }

    /// Append an allocation-mode sample stamped with the current time.
    /// Returns false when no class is tracked.
    pub fn process_data(&self, n_total_alloc_objects: &[i64], total_alloc_size: &[i64]) -> bool {
        self.process_data_at(now_millis(), n_total_alloc_objects, total_alloc_size)
    }

    pub fn process_data_at(
        &self,
        timestamp: u64,
        n_total_alloc_objects: &[i64],
        total_alloc_size: &[i64],
    ) -> bool {
        self.append(timestamp, |series, class_id, slot| {
            series.alloc_counts[slot] = value_at(n_total_alloc_objects, class_id);
            series.alloc_bytes[slot] = value_at(total_alloc_size, class_id);
        })
    }

    /// Append a liveness-mode sample stamped with the current time.
    pub fn process_liveness_data(&self, n_live_objects: &[i64], live_size: &[i64]) -> bool {
        self.process_liveness_data_at(now_millis(), n_live_objects, live_size)
    }

    pub fn process_liveness_data_at(
        &self,
        timestamp: u64,
        n_live_objects: &[i64],
        live_size: &[i64],
    ) -> bool {
        self.append(timestamp, |series, class_id, slot| {
            series.live_counts[slot] = value_at(n_live_objects, class_id);
            series.live_bytes[slot] = value_at(live_size, class_id);
        })
    }

    pub fn tracked_class_id(&self) -> Option<usize> {
        lock(&self.series).tracked_class.as_ref().map(|(id, _)| *id)
    }

    pub fn tracked_class_name(&self) -> Option<SharedStr> {
        lock(&self.series).tracked_class.as_ref().map(|(_, name)| name.clone())
    }

    pub fn is_tracking_class(&self) -> bool {
        lock(&self.series).tracked_class.is_some()
    }

    pub fn n_items(&self) -> usize {
        lock(&self.series).n_items
    }

    /// Allocated slots, including the unused tail.
    pub fn capacity(&self) -> usize {
        lock(&self.series).timestamps.len()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        let series = lock(&self.series);
        series.timestamps[..series.n_items].to_vec()
    }

    pub fn alloc_counts(&self) -> Vec<i64> {
        let series = lock(&self.series);
        series.alloc_counts[..series.n_items].to_vec()
    }

    pub fn alloc_bytes(&self) -> Vec<i64> {
        let series = lock(&self.series);
        series.alloc_bytes[..series.n_items].to_vec()
    }

    pub fn live_counts(&self) -> Vec<i64> {
        let series = lock(&self.series);
        series.live_counts[..series.n_items].to_vec()
    }

    pub fn live_bytes(&self) -> Vec<i64> {
        let series = lock(&self.series);
        series.live_bytes[..series.n_items].to_vec()
    }

    fn append(&self, timestamp: u64, fill: impl FnOnce(&mut Series, usize, usize)) -> bool {
        let (class_id, n_items) = {
            let mut series = lock(&self.series);
            let Some(class_id) = series.tracked_class.as_ref().map(|(id, _)| *id) else {
                return false;
            };
            let slot = series.next_slot(self.buffer_size);
            series.timestamps[slot] = timestamp;
            fill(&mut *series, class_id, slot);
            (class_id, series.n_items)
        };
        self.notify(Some(class_id), n_items);
        true
    }

    fn notify(&self, class_id: Option<usize>, n_items: usize) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.history_changed(class_id, n_items);
        }
    }
}

impl std::fmt::Debug for ClassHistoryDataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassHistoryDataManager")
            .field("buffer_size", &self.buffer_size)
            .field("series", &*lock(&self.series))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn value_at(values: &[i64], class_id: usize) -> i64 {
    values.get(class_id).copied().unwrap_or(0)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn grows_by_buffer_size_without_losing_samples() {
        let history = ClassHistoryDataManager::new(2);
        history.setup_class(1, "byte[]");
        for i in 0..5 {
            let i = i as i64;
            assert!(history.process_data_at(100 + i as u64, &[0, i], &[0, i * 10]));
        }
        assert_eq!(history.n_items(), 5);
        assert_eq!(history.capacity(), 6);
        assert_eq!(history.timestamps(), vec![100, 101, 102, 103, 104]);
        assert_eq!(history.alloc_counts(), vec![0, 1, 2, 3, 4]);
        assert_eq!(history.alloc_bytes(), vec![0, 10, 20, 30, 40]);
        assert_eq!(history.live_counts(), vec![0; 5]);
    }

    #[test]
    fn untracked_samples_are_ignored() {
        let history = ClassHistoryDataManager::new(4);
        assert!(!history.process_data(&[1], &[1]));
        history.setup_class(0, "A");
        assert!(history.process_liveness_data_at(7, &[3], &[96]));
        assert_eq!(history.live_bytes(), vec![96]);
        history.reset_class();
        assert!(!history.is_tracking_class());
        assert_eq!(history.n_items(), 0);
        assert!(history.timestamps().is_empty());
    }

    #[test]
    fn setup_discards_previous_class() {
        let history = ClassHistoryDataManager::new(2);
        history.setup_class(0, "A");
        history.process_data_at(1, &[5], &[50]);
        history.setup_class(2, "C");
        assert_eq!(history.n_items(), 0);
        assert_eq!(history.tracked_class_name().unwrap(), "C");
        history.process_data_at(2, &[5], &[50]);
        assert_eq!(history.alloc_counts(), vec![0]);
    }

    #[test]
    fn listeners_can_read_back() {
        struct Reader {
            history: std::sync::Weak<ClassHistoryDataManager>,
            seen: AtomicUsize,
        }
        impl HistoryListener for Reader {
            fn history_changed(&self, _: Option<usize>, n_items: usize) {
                if let Some(h) = self.history.upgrade() {
                    assert_eq!(h.n_items(), n_items);
                }
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }

        let history = Arc::new(ClassHistoryDataManager::new(2));
        let reader = Arc::new(Reader {
            history: Arc::downgrade(&history),
            seen: AtomicUsize::new(0),
        });
        history.add_listener(reader.clone());
        history.setup_class(0, "A");
        history.process_data_at(1, &[1], &[1]);
        history.process_data_at(2, &[1], &[1]);
        assert_eq!(reader.seen.load(Ordering::SeqCst), 3);

        let as_dyn: Arc<dyn HistoryListener> = reader.clone();
        history.remove_listener(&as_dyn);
        history.process_data_at(3, &[1], &[1]);
        assert_eq!(reader.seen.load(Ordering::SeqCst), 3);
    }
}
