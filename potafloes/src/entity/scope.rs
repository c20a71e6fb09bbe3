//! Task-local entity scope
//!
//! Implementations run "on behalf of" the entity they were scheduled for.
//! Tasks spawned from inside a scope inherit it, which is how provenance
//! (`producers`, `readers`) finds the acting entity.

use super::Entity;
use std::future::Future;

tokio::task_local! {
    static ENTITY_SCOPE: Option<Entity>;
}

/// The entity the current task acts for, if any
pub fn current() -> Option<Entity> {
    ENTITY_SCOPE.try_with(|scope| scope.clone()).ok().flatten()
}

/// Run `fut` inside `scope`
pub(crate) fn within<F: Future>(scope: Option<Entity>, fut: F) -> impl Future<Output = F::Output> {
    ENTITY_SCOPE.scope(scope, fut)
}
