//! Desired state of this host, as set by the scheduler.
//!
//! The [`DesiredStateTable`] maps each [`JobId`] to the [`Task`] the scheduler
//! wants for it. Every mutation is fanned out synchronously to the registered
//! [`StateListener`]s before the mutating call returns.

use std::collections::HashMap;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error};

use berth_core::{JobId, Task};

/// Error a listener may return from a notification. It is logged, never
/// propagated.
pub type ListenerError = Box<dyn Error + Send + Sync>;

/// Observer of table changes.
///
/// Called on the mutating thread with no table lock held, so implementations
/// may read the table. They must not mutate it.
pub trait StateListener: Send + Sync {
    fn tasks_changed(&self, table: &DesiredStateTable) -> Result<(), ListenerError>;
}

impl<F> StateListener for F
where
    F: Fn(&DesiredStateTable) -> Result<(), ListenerError> + Send + Sync,
{
    fn tasks_changed(&self, table: &DesiredStateTable) -> Result<(), ListenerError> {
        self(table)
    }
}

type Listeners = Arc<Vec<Arc<dyn StateListener>>>;

/// Concurrent job table with synchronous change notification.
#[derive(Default)]
pub struct DesiredStateTable {
    tasks: RwLock<HashMap<JobId, Task>>,
    listeners: RwLock<Listeners>,
}

impl DesiredStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the task for `id` and notify listeners.
    pub fn add_job(&self, id: JobId, task: Task) {
        debug!(job_id = %id, goal = %task.goal, "Setting desired task");
        self.write_tasks().insert(id, task);
        self.fire();
    }

    /// Same as [`add_job`](Self::add_job).
    pub fn update_job(&self, id: JobId, task: Task) {
        self.add_job(id, task);
    }

    /// Remove the task for `id`, returning it. Listeners are notified either way.
    pub fn remove_job(&self, id: &JobId) -> Option<Task> {
        let removed = self.write_tasks().remove(id);
        debug!(job_id = %id, removed = removed.is_some(), "Removing desired task");
        self.fire();
        removed
    }

    /// Snapshot of the whole table.
    pub fn tasks(&self) -> HashMap<JobId, Task> {
        self.read_tasks().clone()
    }

    pub fn task(&self, id: &JobId) -> Option<Task> {
        self.read_tasks().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_tasks().is_empty()
    }

    /// Register `listener` and deliver the current contents to it right away.
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        {
            let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
            let mut next = Vec::with_capacity(guard.len() + 1);
            next.extend(guard.iter().cloned());
            next.push(listener.clone());
            *guard = Arc::new(next);
        }
        self.notify(&listener);
    }

    /// Unregister `listener`, matched by identity. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn StateListener>) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        let removed = next.len() != guard.len();
        *guard = Arc::new(next);
        removed
    }

    fn fire(&self) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners.iter() {
            self.notify(listener);
        }
    }

    fn notify(&self, listener: &Arc<dyn StateListener>) {
        match panic::catch_unwind(AssertUnwindSafe(|| listener.tasks_changed(self))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "State listener failed"),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "State listener panicked");
            }
        }
    }

    fn read_tasks(&self) -> RwLockReadGuard<'_, HashMap<JobId, Task>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tasks(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Task>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use berth_core::{Goal, Job};

    fn task(name: &str) -> (JobId, Task) {
        let job = Job::new(name, "1", "busybox");
        (job.id(), Task::start(job))
    }

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
        sizes: Mutex<Vec<usize>>,
    }

    impl StateListener for CountingListener {
        fn tasks_changed(&self, table: &DesiredStateTable) -> Result<(), ListenerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(table.len());
            Ok(())
        }
    }

    struct FailingListener;

    impl StateListener for FailingListener {
        fn tasks_changed(&self, _table: &DesiredStateTable) -> Result<(), ListenerError> {
            Err("listener is a potato".into())
        }
    }

    struct PanickingListener;

    impl StateListener for PanickingListener {
        fn tasks_changed(&self, _table: &DesiredStateTable) -> Result<(), ListenerError> {
            panic!("listener exploded");
        }
    }

    #[test]
    fn test_add_listener_delivers_current_state() {
        let table = DesiredStateTable::new();
        let (id, t) = task("foo");
        table.add_job(id, t);

        let listener = Arc::new(CountingListener::default());
        table.add_listener(listener.clone());

        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*listener.sizes.lock().unwrap(), [1]);
    }

    #[test]
    fn test_mutations_notify_before_returning() {
        let table = DesiredStateTable::new();
        let listener = Arc::new(CountingListener::default());
        table.add_listener(listener.clone());

        let (id, t) = task("foo");
        table.add_job(id.clone(), t.clone());
        table.update_job(id.clone(), t.with_goal(Goal::Stop));
        assert_eq!(table.task(&id).map(|t| t.goal), Some(Goal::Stop));

        assert!(table.remove_job(&id).is_some());
        assert!(table.remove_job(&id).is_none());

        assert_eq!(listener.calls.load(Ordering::SeqCst), 5);
        assert_eq!(*listener.sizes.lock().unwrap(), [0, 1, 1, 0, 0]);
    }

    #[test]
    fn test_faulting_listeners_are_isolated() {
        let table = DesiredStateTable::new();
        table.add_listener(Arc::new(FailingListener));
        table.add_listener(Arc::new(PanickingListener));
        let listener = Arc::new(CountingListener::default());
        table.add_listener(listener.clone());

        let (id, t) = task("foo");
        table.add_job(id.clone(), t);

        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
        assert!(table.task(&id).is_some());
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let table = DesiredStateTable::new();
        let listener = Arc::new(CountingListener::default());
        let handle: Arc<dyn StateListener> = listener.clone();
        table.add_listener(handle.clone());

        assert!(table.remove_listener(&handle));
        assert!(!table.remove_listener(&handle));

        let (id, t) = task("foo");
        table.add_job(id, t);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_closure() {
        let table = DesiredStateTable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        table.add_listener(Arc::new(
            move |table: &DesiredStateTable| -> Result<(), ListenerError> {
                counter.store(table.len(), Ordering::SeqCst);
                Ok(())
            },
        ));

        let (id, t) = task("foo");
        table.add_job(id, t);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshots_are_consistent_under_concurrent_writers() {
        let table = Arc::new(DesiredStateTable::new());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // Each writer owns one job and cycles it through start, stop and
        // removal, checking its own writes are visible once the call returns.
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let (id, t) = task(&format!("job{}", w));
                    for _ in 0..200 {
                        table.add_job(id.clone(), t.clone());
                        assert_eq!(table.task(&id).map(|t| t.goal), Some(Goal::Start));
                        table.update_job(id.clone(), t.with_goal(Goal::Stop));
                        assert_eq!(table.task(&id).map(|t| t.goal), Some(Goal::Stop));
                        assert!(table.remove_job(&id).is_some());
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let table = table.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let snapshot = table.tasks();
                        assert!(snapshot.len() <= 4);
                        for (id, task) in &snapshot {
                            // Key and value always come from the same write.
                            assert_eq!(*id, task.job.id());
                        }
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_add_job() {
        let table = Arc::new(DesiredStateTable::new());
        let listener = Arc::new(CountingListener::default());
        table.add_listener(listener.clone());

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let (id, t) = task(&format!("job{}", i));
                    table.add_job(id, t);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(table.len(), 8);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 9);
    }
}
