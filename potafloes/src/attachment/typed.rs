//! Typed views over attachments

use super::{Attachment, Completion, SingleState, Store};
use crate::context::park;
use crate::error::{Error, Result};
use crate::value::Value;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::IntoFuture;
use std::ops::Deref;
use tokio::sync::watch;

/// Unbounded attachment of distinct elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bag(Attachment);

impl Bag {
    pub(crate) fn wrap(attachment: Attachment) -> Self {
        Self(attachment)
    }

    pub fn attachment(&self) -> &Attachment {
        &self.0
    }
}

impl Deref for Bag {
    type Target = Attachment;

    fn deref(&self) -> &Attachment {
        &self.0
    }
}

/// Attachment holding at most one element
///
/// Awaiting a `Single` suspends until the first send and yields the
/// value, or `None` if the slot was explicitly emptied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Single(Attachment);

impl Single {
    pub(crate) fn wrap(attachment: Attachment) -> Self {
        Self(attachment)
    }

    pub fn attachment(&self) -> &Attachment {
        &self.0
    }

    /// `None` while unset, `Some(None)` once emptied
    pub fn value(&self) -> Option<Option<Value>> {
        match self.state() {
            SingleState::Unset => None,
            SingleState::Empty => Some(None),
            SingleState::Set(v) => Some(Some(v)),
        }
    }

    pub fn is_set(&self) -> bool {
        self.state() != SingleState::Unset
    }

    fn state(&self) -> SingleState {
        self.0.with_store(|store| match store {
            Store::Single(s) => s.state(),
            _ => SingleState::Unset,
        })
    }

    fn receiver(&self) -> Result<watch::Receiver<SingleState>> {
        self.0.with_store(|store| match store {
            Store::Single(s) => Ok(s.subscribe()),
            _ => Err(self.wrong_kind()),
        })
    }

    fn wrong_kind(&self) -> Error {
        Error::WrongAttachmentKind {
            attachment: self.0.label(),
            expected: "Single".to_string(),
            actual: self.0.kind().name().to_string(),
        }
    }

    /// Wait for the first send; a parked suspension point
    ///
    /// Combined with other work in one task (`join!`, `select!`), a parked
    /// wait gets the whole task abandoned once the graph settles. Use
    /// [`Single::wait_unparked`] there.
    pub async fn wait(&self) -> Result<Option<Value>> {
        park(self.first_send()?).await
    }

    /// Wait for the first send without counting the task as parked
    pub async fn wait_unparked(&self) -> Result<Option<Value>> {
        self.first_send()?.await
    }

    fn first_send(&self) -> Result<BoxFuture<'static, Result<Option<Value>>>> {
        let mut rx = self.receiver()?;
        let label = self.0.label();
        Ok(async move {
            let state = rx
                .wait_for(|state| *state != SingleState::Unset)
                .await
                .map_err(|_| Error::AttachmentDropped(label))?;
            Ok(match &*state {
                SingleState::Set(v) => Some(v.clone()),
                _ => None,
            })
        }
        .boxed())
    }
}

impl Deref for Single {
    type Target = Attachment;

    fn deref(&self) -> &Attachment {
        &self.0
    }
}

impl IntoFuture for Single {
    type Output = Result<Option<Value>>;
    type IntoFuture = BoxFuture<'static, Result<Option<Value>>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}

/// Attachment with `min..=max` cardinality
///
/// Awaiting a `BoundedStream` suspends until `max` counted sends arrived
/// and yields the collected elements, or `IncompleteBoundedStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedStream(Attachment);

impl BoundedStream {
    pub(crate) fn wrap(attachment: Attachment) -> Self {
        Self(attachment)
    }

    pub fn attachment(&self) -> &Attachment {
        &self.0
    }

    /// Counted sends so far, `None` sends included
    pub fn count(&self) -> usize {
        self.0.with_store(|store| match store {
            Store::Bounded(s) => s.count(),
            _ => 0,
        })
    }

    pub fn bounds(&self) -> (usize, usize) {
        self.0.with_store(|store| match store {
            Store::Bounded(s) => s.bounds(),
            _ => (0, 0),
        })
    }

    /// Completion result, if the stream reached `max`
    pub fn completion(&self) -> Completion {
        self.0.with_store(|store| match store {
            Store::Bounded(s) => s.completion(),
            _ => None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.completion().is_some()
    }

    fn receiver(&self) -> Result<watch::Receiver<Completion>> {
        self.0.with_store(|store| match store {
            Store::Bounded(s) => Ok(s.subscribe()),
            _ => Err(Error::WrongAttachmentKind {
                attachment: self.0.label(),
                expected: "BoundedStream".to_string(),
                actual: self.0.kind().name().to_string(),
            }),
        })
    }

    /// Wait for completion; a parked suspension point
    ///
    /// See [`Single::wait`] for waits combined with other work.
    pub async fn wait(&self) -> Result<Vec<Value>> {
        park(self.completed()?).await
    }

    /// Wait for completion without counting the task as parked
    pub async fn wait_unparked(&self) -> Result<Vec<Value>> {
        self.completed()?.await
    }

    fn completed(&self) -> Result<BoxFuture<'static, Result<Vec<Value>>>> {
        let mut rx = self.receiver()?;
        let label = self.0.label();
        Ok(async move {
            let completion = rx
                .wait_for(|completion| completion.is_some())
                .await
                .map_err(|_| Error::AttachmentDropped(label.clone()))?;
            (*completion)
                .clone()
                .unwrap_or_else(|| Err(Error::AttachmentDropped(label)))
        }
        .boxed())
    }
}

impl Deref for BoundedStream {
    type Target = Attachment;

    fn deref(&self) -> &Attachment {
        &self.0
    }
}

impl IntoFuture for BoundedStream {
    type Output = Result<Vec<Value>>;
    type IntoFuture = BoxFuture<'static, Result<Vec<Value>>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}
