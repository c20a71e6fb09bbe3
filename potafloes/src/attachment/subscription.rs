//! Attachment subscribers
//!
//! A subscriber is an async callback invoked once per element an
//! attachment holds. Each delivery runs as its own tracked task.

use crate::value::Value;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Boxed subscriber callback
pub type Callback = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named callback registered on an attachment
#[derive(Clone)]
pub struct Subscriber {
    name: Arc<str>,
    callback: Callback,
}

impl Subscriber {
    pub fn new<F, Fut>(name: impl AsRef<str>, callback: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.as_ref()),
            callback: Arc::new(move |item| callback(item).boxed()),
        }
    }

    /// Used as the prefix of delivery task names
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn deliver(&self, item: Value) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.callback)(item)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscriber").field(&self.name).finish()
    }
}
