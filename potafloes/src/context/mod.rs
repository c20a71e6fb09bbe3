//! Execution context: task lifecycle, settling and error capture
//!
//! A [`Context`] owns every task spawned on behalf of the entity graph,
//! the errors those tasks raise, and one [`EntityContext`] per entity
//! type. Its lifecycle is:
//!
//! ```text
//! init() ──► spawn()/register() ... ──► stop()/finalize() ──► freeze() ──► reset()
//!                                           │
//!                      waits until every task finished, or every
//!                      remaining task is parked on an engine future
//! ```
//!
//! The first task error force-stops the context and is returned by
//! [`Context::run`].

pub(crate) mod tasks;

pub use tasks::{park, Park};

use crate::config::ContextConfig;
use crate::entity::context::{EntityContext, EntityContextStats};
use crate::entity::{scope, Entity};
use crate::error::{Error, Result};
use crate::schema::EntityType;
use crate::types::{ContextId, EntityTypeId, TaskId};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tasks::TaskSet;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Shared handle on a context's settle barrier
///
/// Every caller of [`Context::stop`] gets a clone of the same future and
/// observes the same outcome.
pub type Settled = Shared<BoxFuture<'static, Result<()>>>;

/// A task failure captured by the context
#[derive(Debug)]
pub struct TaskFailure {
    /// Name the task was spawned with
    pub task: String,
    /// What the task returned, or a `TaskPanicked` error
    pub error: anyhow::Error,
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    frozen: bool,
    stopping: bool,
    finalizer: Option<Settled>,
}

struct ContextInner {
    id: ContextId,
    config: ContextConfig,
    lifecycle: Mutex<Lifecycle>,
    tasks: Arc<TaskSet>,
    errors: Mutex<Vec<TaskFailure>>,
    entity_contexts: RwLock<HashMap<EntityTypeId, Arc<EntityContext>>>,
}

/// Lifecycle owner for an entity graph
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

thread_local! {
    static CURRENT: Context = Context::new(
        std::thread::current().name().unwrap_or("unnamed").to_string(),
    );
}

impl Context {
    /// Create a context with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(ContextConfig::named(name))
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::new(),
                config,
                lifecycle: Mutex::new(Lifecycle::default()),
                tasks: TaskSet::new(),
                errors: Mutex::new(Vec::new()),
                entity_contexts: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The calling thread's context, created on first use and named after
    /// the thread
    pub fn current() -> Context {
        CURRENT.with(|ctx| ctx.clone())
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lifecycle.lock().initialized
    }

    /// Whether the context has settled and refuses new instances and queries
    pub fn is_frozen(&self) -> bool {
        self.inner.lifecycle.lock().frozen
    }

    pub fn init(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.initialized {
            return Err(Error::AlreadyInitialized(self.name().to_string()));
        }
        lifecycle.initialized = true;
        debug!(context = %self.name(), id = %self.id(), "context initialized");
        Ok(())
    }

    /// Spawn a tracked task inheriting the caller's entity scope
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F) -> Result<TaskId>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_scoped(name.into(), scope::current(), fut)
    }

    /// Track a task that was spawned directly on the runtime
    ///
    /// Aborting the tracked wrapper aborts the underlying task as well.
    pub fn register(
        &self,
        name: impl Into<String>,
        handle: JoinHandle<anyhow::Result<()>>,
    ) -> Result<TaskId> {
        let name = name.into();
        let task = name.clone();
        let guard = AbortOnDrop(handle.abort_handle());
        self.spawn(name, async move {
            let _guard = guard;
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(Error::TaskPanicked {
                    task,
                    message: panic_message(e.into_panic().as_ref()),
                }
                .into()),
                Err(_) => Ok(()),
            }
        })
    }

    pub(crate) fn spawn_scoped<F>(&self, name: String, scope: Option<Entity>, fut: F) -> Result<TaskId>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime { task: name.clone() })?;
        let id = TaskId::next();

        if self.inner.lifecycle.lock().stopping {
            debug!(context = %self.name(), task = %name, "context is stopping, task not started");
            return Ok(id);
        }

        let name: Arc<str> = Arc::from(name);
        let task_name = name.clone();
        let ctx = self.clone();
        let capture_panics = self.inner.config.capture_panics;

        let body = async move {
            let outcome = if capture_panics {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(Error::TaskPanicked {
                        task: task_name.to_string(),
                        message: panic_message(panic.as_ref()),
                    }
                    .into()),
                }
            } else {
                fut.await
            };

            if let Err(e) = outcome {
                ctx.fail(&task_name, e);
            }
        };

        debug!(context = %self.name(), task = %name, %id, "spawning task");
        self.inner
            .tasks
            .spawn(&handle, id, name, scope::within(scope, body));
        Ok(id)
    }

    fn fail(&self, task: &str, error: anyhow::Error) {
        error!(context = %self.name(), task = %task, error = %format!("{error:#}"), "task failed");
        self.inner.errors.lock().push(TaskFailure {
            task: task.to_string(),
            error,
        });
        // Only the abort matters here; whoever awaits `stop` drives the
        // finalizer.
        let _ = self.stop(true);
    }

    /// Request a stop and return the shared settle barrier
    ///
    /// With `force`, every tracked task is aborted first and no new tasks
    /// are started. The returned future drives finalization; concurrent
    /// callers share it.
    pub fn stop(&self, force: bool) -> Settled {
        if force {
            self.inner.lifecycle.lock().stopping = true;
            let aborted = self.inner.tasks.abort_all();
            if aborted > 0 {
                warn!(context = %self.name(), aborted, "force stop aborted running tasks");
            }
        }

        let mut lifecycle = self.inner.lifecycle.lock();
        if let Some(finalizer) = &lifecycle.finalizer {
            return finalizer.clone();
        }

        let ctx = self.clone();
        let finalizer = async move { ctx.finalize().await }.boxed().shared();
        lifecycle.finalizer = Some(finalizer.clone());
        finalizer
    }

    /// Wait until the graph settles, then freeze
    ///
    /// The graph has settled when no tracked task is live, including tasks
    /// spawned while draining, or when every live task is parked on an
    /// engine future. Parked tasks are aborted when
    /// `ContextConfig::abandon_parked` is set.
    pub async fn finalize(&self) -> Result<()> {
        let tasks = &self.inner.tasks;
        let mut abandoned = false;

        loop {
            let notified = tasks.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let live = tasks.live();
            let parked = tasks.parked();
            if live == 0 {
                break;
            }
            if parked >= live {
                if !self.inner.config.abandon_parked {
                    info!(context = %self.name(), parked, "settled with parked tasks left suspended");
                    break;
                }
                if !abandoned {
                    warn!(
                        context = %self.name(),
                        parked,
                        tasks = ?tasks.live_names(),
                        "settled with tasks waiting on futures nothing can resolve, abandoning them"
                    );
                    abandoned = true;
                }
                tasks.abort_all();
            }

            notified.await;
        }

        debug!(context = %self.name(), spawned = tasks.spawned(), "all tasks finished");
        self.freeze()
    }

    /// Mark the context non-writable and freeze every entity context
    pub fn freeze(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.frozen {
                return Err(Error::AlreadyFrozen(self.name().to_string()));
            }
            lifecycle.frozen = true;
        }

        let entity_contexts: Vec<Arc<EntityContext>> =
            self.inner.entity_contexts.read().values().cloned().collect();
        for entity_context in entity_contexts {
            entity_context.freeze(self.inner.config.warn_pending_queries);
        }

        info!(context = %self.name(), "context frozen");
        Ok(())
    }

    /// Abort leftovers and return to the pre-`init` state
    ///
    /// Every entity context is dropped; its instances are torn down so
    /// their attachments release each other.
    pub fn reset(&self) {
        self.inner.tasks.reset();
        *self.inner.lifecycle.lock() = Lifecycle::default();
        self.inner.errors.lock().clear();

        let entity_contexts: Vec<Arc<EntityContext>> = self
            .inner
            .entity_contexts
            .write()
            .drain()
            .map(|(_, ec)| ec)
            .collect();
        for entity_context in entity_contexts {
            entity_context.reset();
        }

        info!(context = %self.name(), "context reset");
    }

    /// Run `entrypoint` as task "main" on a fresh current-thread runtime
    /// until the graph settles
    ///
    /// Returns the first captured task error, if any.
    pub fn run<F, Fut>(&self, entrypoint: F) -> anyhow::Result<()>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let outcome = runtime.block_on(self.run_async(entrypoint));
        drop(runtime);
        outcome
    }

    /// [`Context::run`] on the caller's runtime
    pub async fn run_async<F, Fut>(&self, entrypoint: F) -> anyhow::Result<()>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.init()?;
        self.spawn("main", entrypoint(self.clone()))?;
        let settled = self.stop(false).await;

        if let Some(failure) = self.take_first_error() {
            return Err(failure.error);
        }
        settled?;
        Ok(())
    }

    /// Messages of every captured task error, oldest first
    pub fn errors(&self) -> Vec<String> {
        self.inner
            .errors
            .lock()
            .iter()
            .map(|failure| format!("{}: {:#}", failure.task, failure.error))
            .collect()
    }

    /// Remove and return the oldest captured task error
    pub fn take_first_error(&self) -> Option<TaskFailure> {
        let mut errors = self.inner.errors.lock();
        if errors.is_empty() {
            None
        } else {
            Some(errors.remove(0))
        }
    }

    /// Names of the tasks currently tracked
    pub fn live_tasks(&self) -> Vec<String> {
        self.inner.tasks.live_names()
    }

    /// The per-type instance table for `entity_type`, created on demand
    pub fn entity_context(&self, entity_type: &EntityType) -> Arc<EntityContext> {
        if let Some(ec) = self.inner.entity_contexts.read().get(&entity_type.id()) {
            return ec.clone();
        }

        let frozen = self.is_frozen();
        self.inner
            .entity_contexts
            .write()
            .entry(entity_type.id())
            .or_insert_with(|| {
                Arc::new(EntityContext::new(
                    entity_type.clone(),
                    self.name().to_string(),
                    frozen,
                ))
            })
            .clone()
    }

    /// Get statistics about the context
    pub fn stats(&self) -> ContextStats {
        let (initialized, frozen) = {
            let lifecycle = self.inner.lifecycle.lock();
            (lifecycle.initialized, lifecycle.frozen)
        };
        let mut entity_types: Vec<EntityContextStats> = self
            .inner
            .entity_contexts
            .read()
            .values()
            .map(|ec| ec.stats())
            .collect();
        entity_types.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));

        ContextStats {
            id: self.id(),
            name: self.name().to_string(),
            initialized,
            frozen,
            live_tasks: self.inner.tasks.live(),
            parked_tasks: self.inner.tasks.parked(),
            spawned_tasks: self.inner.tasks.spawned(),
            errors: self.inner.errors.lock().len(),
            entity_types,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

/// Statistics about a context
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub id: ContextId,
    pub name: String,
    pub initialized: bool,
    pub frozen: bool,
    /// Tasks currently tracked
    pub live_tasks: usize,
    /// Live tasks suspended on engine futures
    pub parked_tasks: usize,
    /// Tasks spawned since the last reset
    pub spawned_tasks: u64,
    /// Captured task errors
    pub errors: usize,
    pub entity_types: Vec<EntityContextStats>,
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_init_twice() {
        let ctx = Context::new("init");
        ctx.init().unwrap();
        assert_eq!(
            ctx.init().unwrap_err(),
            Error::AlreadyInitialized("init".to_string())
        );
        ctx.reset();
        ctx.init().unwrap();
    }

    #[test]
    fn test_freeze_twice() {
        let ctx = Context::new("freeze");
        ctx.freeze().unwrap();
        assert!(ctx.is_frozen());
        assert!(matches!(ctx.freeze(), Err(Error::AlreadyFrozen(_))));
    }

    #[test]
    fn test_spawn_without_runtime() {
        let ctx = Context::new("bare");
        let err = ctx.spawn("orphan", async { Ok(()) }).unwrap_err();
        assert_eq!(
            err,
            Error::NoRuntime {
                task: "orphan".to_string()
            }
        );
    }

    #[test]
    fn test_run_drains_nested_spawns() {
        let ctx = Context::new("drain");
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();

        ctx.run(move |ctx| async move {
            for i in 0..3 {
                let counter = seen.clone();
                let inner_ctx = ctx.clone();
                ctx.spawn(format!("outer-{i}"), async move {
                    tokio::task::yield_now().await;
                    let counter2 = counter.clone();
                    inner_ctx.spawn("inner", async move {
                        counter2.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })?;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 6);
        assert!(ctx.is_frozen());
        assert_eq!(ctx.stats().live_tasks, 0);
        assert_eq!(ctx.stats().spawned_tasks, 7);
    }

    #[test]
    fn test_run_returns_first_error() {
        let ctx = Context::new("failing");
        let err = ctx
            .run(|_| async { Err(anyhow::anyhow!("boom")) })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(ctx.is_frozen());
    }

    #[test]
    fn test_panic_is_captured() {
        let ctx = Context::new("panicky");
        let err = ctx
            .run(|ctx| async move {
                ctx.spawn("explode", async { panic!("kaboom") })?;
                Ok(())
            })
            .unwrap_err();

        match err.downcast_ref::<Error>() {
            Some(Error::TaskPanicked { task, message }) => {
                assert_eq!(task, "explode");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_force_stops_siblings() {
        let ctx = Context::new("force");
        let finished = Arc::new(AtomicUsize::new(0));
        let seen = finished.clone();

        let result = ctx.run(move |ctx| async move {
            ctx.spawn("sleeper", async move {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
            ctx.spawn("failer", async { Err(anyhow::anyhow!("stop everything")) })?;
            Ok(())
        });

        assert!(result.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_register_external_task() {
        let ctx = Context::new("register");
        ctx.init().unwrap();
        let handle = tokio::spawn(async { Err(anyhow::anyhow!("external failure")) });
        ctx.register("external", handle).unwrap();

        ctx.stop(false).await.unwrap();
        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("external: external failure"));
    }

    #[tokio::test]
    async fn test_stop_is_shared() {
        let ctx = Context::new("shared");
        let a = ctx.stop(false);
        let b = ctx.stop(false);
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok());
        assert!(rb.is_ok());
        assert!(ctx.is_frozen());
    }

    #[test]
    fn test_stats_serialize() {
        let ctx = Context::new("stats");
        let json = serde_json::to_value(ctx.stats()).unwrap();
        assert_eq!(json["name"], "stats");
        assert_eq!(json["live_tasks"], 0);
    }

    #[test]
    fn test_current_is_per_thread() {
        let a = Context::current();
        let b = Context::current();
        assert_eq!(a, b);

        let other = std::thread::spawn(|| Context::current().id())
            .join()
            .unwrap();
        assert_ne!(other, a.id());
    }
}
