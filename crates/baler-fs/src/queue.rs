use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

type Completion<V> = Box<dyn FnOnce(&V) + Send>;

/// Coalescing, bounded-parallelism work queue keyed by path.
///
/// At most one computation per key is in flight at a time; every completion
/// attached while the job is queued or running observes the same value. The
/// processor runs on on-demand worker threads bounded by the current
/// parallelism; workers exit when the queue drains. If no worker thread can
/// be spawned at all, jobs run on the enqueuing thread instead of stalling.
///
/// Ordering among queued keys is FIFO but not contractual; callers must be
/// commutative.
pub struct JobQueue<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for JobQueue<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    name: &'static str,
    processor: Box<dyn Fn(&K) -> V + Send + Sync>,
    state: Mutex<State<K, V>>,
}

struct State<K, V> {
    queued: VecDeque<K>,
    waiters: HashMap<K, Vec<Completion<V>>>,
    parallelism: usize,
    running: usize,
}

impl<K, V> JobQueue<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        parallelism: usize,
        processor: impl Fn(&K) -> V + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                processor: Box::new(processor),
                state: Mutex::new(State {
                    queued: VecDeque::new(),
                    waiters: HashMap::new(),
                    parallelism: parallelism.max(1),
                    running: 0,
                }),
            }),
        }
    }

    /// Enqueue a request for `key`. If a job for the key is already pending,
    /// the completion is attached to it instead of scheduling a new one.
    pub fn add(&self, key: K, completion: impl FnOnce(&V) + Send + 'static) {
        let drain_here = {
            let mut state = self.inner.state.lock();
            match state.waiters.get_mut(&key) {
                Some(list) => list.push(Box::new(completion)),
                None => {
                    state.waiters.insert(key.clone(), vec![Box::new(completion)]);
                    state.queued.push_back(key);
                }
            }
            Self::spawn_workers(&self.inner, &mut state)
        };
        if drain_here {
            Self::drain_inline(&self.inner);
        }
    }

    /// Blocking adapter over [`JobQueue::add`].
    pub fn compute(&self, key: K) -> V {
        let slot = Arc::new((Mutex::new(None::<V>), Condvar::new()));
        let waiter = Arc::clone(&slot);
        self.add(key, move |value| {
            *waiter.0.lock() = Some(value.clone());
            waiter.1.notify_all();
        });
        let mut guard = slot.0.lock();
        while guard.is_none() {
            slot.1.wait(&mut guard);
        }
        guard.take().expect("job completed without a value")
    }

    /// Raise the concurrency budget by one. Used around recursive jobs that
    /// would otherwise saturate the budget waiting on themselves.
    pub fn increase_parallelism(&self) {
        let drain_here = {
            let mut state = self.inner.state.lock();
            state.parallelism += 1;
            Self::spawn_workers(&self.inner, &mut state)
        };
        if drain_here {
            Self::drain_inline(&self.inner);
        }
    }

    /// Lower the concurrency budget by one; in-flight jobs are unaffected.
    pub fn decrease_parallelism(&self) {
        let mut state = self.inner.state.lock();
        state.parallelism = state.parallelism.saturating_sub(1).max(1);
    }

    /// Returns true when no worker could be spawned and none is running, in
    /// which case the caller must drain the queue on its own thread.
    fn spawn_workers(inner: &Arc<Inner<K, V>>, state: &mut State<K, V>) -> bool {
        while state.running < state.parallelism && !state.queued.is_empty() {
            state.running += 1;
            let worker = Arc::clone(inner);
            let spawned = std::thread::Builder::new()
                .name(format!("baler-{}", inner.name))
                .spawn(move || Self::worker(worker));
            if let Err(err) = spawned {
                // Thread creation can fail in constrained environments (e.g.
                // low RLIMIT_NPROC). Degrade to fewer workers, or to running
                // jobs on the caller's thread when none could start.
                state.running -= 1;
                tracing::warn!(
                    target = "baler.fs",
                    queue = inner.name,
                    error = %err,
                    "failed to spawn queue worker; continuing degraded"
                );
                return state.running == 0;
            }
        }
        false
    }

    /// Process queued jobs on the current thread. Only used when worker
    /// spawning failed with nothing running, so the queue cannot stall.
    fn drain_inline(inner: &Arc<Inner<K, V>>) {
        loop {
            let key = {
                let mut state = inner.state.lock();
                match state.queued.pop_front() {
                    Some(key) => key,
                    None => return,
                }
            };
            Self::run_job(inner, key);
        }
    }

    fn worker(inner: Arc<Inner<K, V>>) {
        loop {
            let key = {
                let mut state = inner.state.lock();
                if state.running > state.parallelism {
                    state.running -= 1;
                    return;
                }
                match state.queued.pop_front() {
                    Some(key) => key,
                    None => {
                        state.running -= 1;
                        return;
                    }
                }
            };
            Self::run_job(&inner, key);
        }
    }

    fn run_job(inner: &Arc<Inner<K, V>>, key: K) {
        let value = (inner.processor)(&key);
        let completions = {
            let mut state = inner.state.lock();
            state.waiters.remove(&key).unwrap_or_default()
        };
        for completion in completions {
            completion(&value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn concurrent_requests_for_one_key_run_the_processor_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let queue = JobQueue::new("test", 4, move |key: &String| {
            counter.fetch_add(1, Ordering::SeqCst);
            // Hold the job long enough for every caller to attach.
            std::thread::sleep(Duration::from_millis(100));
            format!("value:{key}")
        });

        let barrier = Arc::new(std::sync::Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                queue.compute("k".to_string())
            }));
        }
        let results: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == "value:k"));
    }

    #[test]
    fn distinct_keys_each_run_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let queue = JobQueue::new("test", 2, move |key: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            key * 2
        });

        let mut handles = Vec::new();
        for key in 0..8u32 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || queue.compute(key)));
        }
        let mut results: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();

        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(runs.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn parallelism_bounds_concurrent_jobs() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let live2 = Arc::clone(&live);
        let peak2 = Arc::clone(&peak);
        let queue = JobQueue::new("test", 2, move |key: &u32| {
            let now = live2.fetch_add(1, Ordering::SeqCst) + 1;
            peak2.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            live2.fetch_sub(1, Ordering::SeqCst);
            *key
        });

        let mut handles = Vec::new();
        for key in 0..8u32 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || queue.compute(key)));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn increase_parallelism_unblocks_recursive_jobs() {
        // A processor that recursively computes through its own queue would
        // deadlock at parallelism 1 without the increase/decrease dance.
        let slot: Arc<Mutex<Option<JobQueue<u32, u32>>>> = Arc::new(Mutex::new(None));
        let recurse = Arc::clone(&slot);
        let queue = JobQueue::new("test", 1, move |key: &u32| {
            if *key == 0 {
                return 1;
            }
            let queue = recurse.lock().clone().unwrap();
            queue.increase_parallelism();
            let child = queue.compute(key - 1);
            queue.decrease_parallelism();
            child + 1
        });
        *slot.lock() = Some(queue.clone());

        assert_eq!(queue.compute(3), 4);
    }
}
