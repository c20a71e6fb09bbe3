//! Task tracking and parked-task accounting
//!
//! Every task spawned through a context is registered in a [`TaskSet`]
//! until its future is dropped, whether it completed, failed or was
//! aborted. Tasks suspended on engine futures (queries, single and bounded
//! stream completion) are additionally counted as *parked*: only another
//! task can wake them, so once every live task is parked the graph has
//! settled.

use crate::types::TaskId;
use futures_util::task::{waker, ArcWake};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

tokio::task_local! {
    static PARK_CELL: Arc<ParkCell>;
}

struct TaskEntry {
    name: Arc<str>,
    abort: Option<AbortHandle>,
}

/// Registry of live tasks for one context
pub(crate) struct TaskSet {
    live: Mutex<HashMap<TaskId, TaskEntry>>,
    parked: AtomicUsize,
    spawned: AtomicU64,
    /// Bumped by `reset`; guards and park cells of older tasks stop
    /// touching the counters.
    generation: AtomicU64,
    changed: Notify,
}

impl TaskSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(HashMap::new()),
            parked: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            changed: Notify::new(),
        })
    }

    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .live
            .lock()
            .values()
            .map(|entry| entry.name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.changed.notified()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Spawn `fut` on `handle` and track it until its future is dropped
    pub fn spawn<F>(self: &Arc<Self>, handle: &Handle, id: TaskId, name: Arc<str>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation();
        let cell = Arc::new(ParkCell {
            parked: AtomicBool::new(false),
            tasks: self.clone(),
            generation,
        });
        let guard = LiveGuard {
            tasks: self.clone(),
            cell: cell.clone(),
            id,
            generation,
        };

        // The guard is moved into the future so it also runs when the
        // task is aborted before its first poll.
        let fut = PARK_CELL.scope(cell, async move {
            let _guard = guard;
            fut.await
        });

        self.live.lock().insert(
            id,
            TaskEntry {
                name,
                abort: None,
            },
        );
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let join = handle.spawn(fut);
        if let Some(entry) = self.live.lock().get_mut(&id) {
            entry.abort = Some(join.abort_handle());
        }
    }

    /// Abort every live task; returns how many were signalled
    pub fn abort_all(&self) -> usize {
        let handles: Vec<AbortHandle> = self
            .live
            .lock()
            .values()
            .filter_map(|entry| entry.abort.clone())
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Abort everything and forget it; late guard drops are ignored
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.abort_all();
        self.live.lock().clear();
        self.parked.store(0, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn finish(&self, id: TaskId, generation: u64) {
        if generation == self.generation() {
            self.live.lock().remove(&id);
        }
        self.changed.notify_waiters();
    }
}

/// Removes a task from its set when the task's future is dropped
struct LiveGuard {
    tasks: Arc<TaskSet>,
    cell: Arc<ParkCell>,
    id: TaskId,
    generation: u64,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.cell.unpark();
        self.tasks.finish(self.id, self.generation);
    }
}

/// Per-task parked flag
struct ParkCell {
    parked: AtomicBool,
    tasks: Arc<TaskSet>,
    generation: u64,
}

impl ParkCell {
    fn park(&self) {
        if !self.parked.swap(true, Ordering::SeqCst) && self.current() {
            self.tasks.parked.fetch_add(1, Ordering::SeqCst);
            self.tasks.changed.notify_waiters();
        }
    }

    fn unpark(&self) {
        if self.parked.swap(false, Ordering::SeqCst) && self.current() {
            self.tasks.parked.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn current(&self) -> bool {
        self.generation == self.tasks.generation()
    }
}

/// Waker that clears the task's parked flag before waking it
struct ParkWaker {
    cell: Arc<ParkCell>,
    waker: Waker,
}

impl ArcWake for ParkWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.cell.unpark();
        arc_self.waker.wake_by_ref();
    }
}

/// Future wrapper marking the current task parked while `inner` is pending
///
/// Parking is per task, not per future: a `Park` pending inside `join!` or
/// `select!` marks the whole task parked even while a sibling branch waits
/// on a timer or I/O, and `finalize` may abandon the task with that work
/// unfinished. Only wrap futures that are the task's sole pending work.
///
/// Outside a tracked task this is a plain pass-through.
pub struct Park<F> {
    inner: F,
    cell: Option<Arc<ParkCell>>,
}

/// Wrap an engine suspension point
pub fn park<F: Future + Unpin>(inner: F) -> Park<F> {
    Park { inner, cell: None }
}

impl<F: Future + Unpin> Future for Park<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<F::Output> {
        if self.cell.is_none() {
            self.cell = PARK_CELL.try_with(|cell| cell.clone()).ok();
        }
        let Some(cell) = self.cell.clone() else {
            return self.inner.poll_unpin(cx);
        };

        // Being polled means the task is running
        cell.unpark();

        let park_waker = waker(Arc::new(ParkWaker {
            cell: cell.clone(),
            waker: cx.waker().clone(),
        }));
        let mut park_cx = TaskContext::from_waker(&park_waker);
        match self.inner.poll_unpin(&mut park_cx) {
            Poll::Ready(output) => Poll::Ready(output),
            Poll::Pending => {
                cell.park();
                Poll::Pending
            }
        }
    }
}

impl<F> Drop for Park<F> {
    fn drop(&mut self) {
        if let Some(cell) = &self.cell {
            cell.unpark();
        }
    }
}
