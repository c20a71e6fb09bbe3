//! Reactive attachments
//!
//! An [`Attachment`] is a container bound to one field of one entity. It
//! holds distinct elements and fans every new element out to its
//! subscribers, each delivery spawned as a task in the owning context.
//! Subscribing replays the elements already held, so a subscriber sees
//! every element exactly once regardless of when it subscribed.
//!
//! Three variants share this machinery:
//!
//! - [`Bag`]: unbounded
//! - [`Single`]: at most one element, awaitable
//! - [`BoundedStream`]: `min..=max` elements, awaitable once complete

mod store;
mod subscription;
mod typed;

pub use store::{AttachmentStore, BagStore, BoundedStore, Completion, Outcome, SingleState, SingleStore};
pub use subscription::{Callback, Subscriber};
pub use typed::{Bag, BoundedStream, Single};

use crate::context::Context;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::schema::{AttachmentKind, Schema};
use crate::value::{Value, ValueType};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

pub(crate) enum Store {
    Bag(BagStore),
    Single(SingleStore),
    Bounded(BoundedStore),
}

impl Store {
    fn get(&self) -> &dyn AttachmentStore {
        match self {
            Store::Bag(s) => s as &dyn AttachmentStore,
            Store::Single(s) => s,
            Store::Bounded(s) => s,
        }
    }

    fn get_mut(&mut self) -> &mut dyn AttachmentStore {
        match self {
            Store::Bag(s) => s as &mut dyn AttachmentStore,
            Store::Single(s) => s,
            Store::Bounded(s) => s,
        }
    }
}

struct Slot {
    store: Store,
    subscribers: Vec<Subscriber>,
}

struct AttachmentInner {
    kind: AttachmentKind,
    inner_type: ValueType,
    bearer: Arc<str>,
    field: Arc<str>,
    context: Context,
    schema: Option<Schema>,
    slot: Mutex<Slot>,
}

/// Shared handle on an attachment
#[derive(Clone)]
pub struct Attachment {
    inner: Arc<AttachmentInner>,
}

/// Argument to entity construction or to [`Attachment::add`]: a plain
/// value or an attachment
#[derive(Debug, Clone)]
pub enum Argument {
    Value(Value),
    Attachment(Attachment),
}

impl Attachment {
    /// Create a free-standing attachment
    ///
    /// `bearer` and `field` only label the attachment in logs and errors.
    pub fn new(
        context: &Context,
        bearer: impl AsRef<str>,
        field: impl AsRef<str>,
        kind: AttachmentKind,
        inner_type: ValueType,
    ) -> Result<Self> {
        Self::create(
            context,
            None,
            Arc::from(bearer.as_ref()),
            Arc::from(field.as_ref()),
            kind,
            inner_type,
        )
    }

    pub(crate) fn create(
        context: &Context,
        schema: Option<Schema>,
        bearer: Arc<str>,
        field: Arc<str>,
        kind: AttachmentKind,
        inner_type: ValueType,
    ) -> Result<Self> {
        let store = match kind {
            AttachmentKind::Bag => Store::Bag(BagStore::new()),
            AttachmentKind::Single => Store::Single(SingleStore::new(bearer.clone(), field.clone())),
            AttachmentKind::Bounded { min, max } => {
                AttachmentKind::bounded(&field, min, max)?;
                Store::Bounded(BoundedStore::new(Arc::from(format!("{bearer}.{field}")), min, max))
            }
        };

        Ok(Self {
            inner: Arc::new(AttachmentInner {
                kind,
                inner_type,
                bearer,
                field,
                context: context.clone(),
                schema,
                slot: Mutex::new(Slot {
                    store,
                    subscribers: Vec::new(),
                }),
            }),
        })
    }

    pub fn kind(&self) -> AttachmentKind {
        self.inner.kind
    }

    pub fn inner_type(&self) -> &ValueType {
        &self.inner.inner_type
    }

    /// Label of the bearing entity
    pub fn bearer(&self) -> &str {
        &self.inner.bearer
    }

    pub fn field(&self) -> &str {
        &self.inner.field
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// `bearer.field`, the name used in error messages
    pub fn label(&self) -> String {
        format!("{}.{}", self.inner.bearer, self.inner.field)
    }

    /// Whether both handles point at the same attachment
    pub fn same(&self, other: &Attachment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn items(&self) -> Vec<Value> {
        self.inner.slot.lock().store.get().items()
    }

    pub fn contains(&self, item: impl Into<Value>) -> bool {
        self.inner.slot.lock().store.get().contains(&item.into())
    }

    pub fn len(&self) -> usize {
        self.inner.slot.lock().store.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.slot.lock().subscribers.len()
    }

    /// Offer an item
    ///
    /// Returns whether the attachment changed. Subscribers are notified
    /// only on change, each through a spawned task.
    pub fn send(&self, item: impl Into<Value>) -> Result<bool> {
        let item = item.into();
        self.check_item(&item)?;

        let (outcome, subscribers) = {
            let mut slot = self.inner.slot.lock();
            // Deliveries need a runtime; fail before the store changes
            if !slot.subscribers.is_empty() {
                self.require_runtime(&item)?;
            }
            let outcome = slot.store.get_mut().insert(item)?;
            let subscribers = if outcome.added.is_some() {
                slot.subscribers.clone()
            } else {
                Vec::new()
            };
            (outcome, subscribers)
        };

        let changed = outcome.added.is_some();
        let mut failure = outcome.failure;
        if let Some(added) = outcome.added {
            trace!(attachment = %self, item = %added, subscribers = subscribers.len(), "item added");
            for subscriber in &subscribers {
                if let Err(e) = self.deliver(subscriber, added.clone()) {
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    fn check_item(&self, item: &Value) -> Result<()> {
        let accepted = match (item, self.inner.kind) {
            (Value::None, AttachmentKind::Single) => self.inner.inner_type.accepts(item),
            (Value::None, _) => true,
            _ => self.inner.inner_type.accepts(item),
        };
        if accepted {
            Ok(())
        } else {
            Err(Error::AttachmentItemType {
                attachment: self.label(),
                expected: self.inner.inner_type.to_string(),
                value: item.clone(),
            })
        }
    }

    /// Subscribe a callback named after this attachment
    pub fn subscribe<F, Fut>(&self, callback: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("{}_callback", self.inner.field);
        self.subscribe_with(Subscriber::new(name, callback))
    }

    pub fn subscribe_named<F, Fut>(&self, name: impl AsRef<str>, callback: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_with(Subscriber::new(name, callback))
    }

    /// Register `subscriber` and replay the elements already held
    pub fn subscribe_with(&self, subscriber: Subscriber) -> Result<()> {
        let held = {
            let mut slot = self.inner.slot.lock();
            let held = slot.store.get().items();
            if let Some(first) = held.first() {
                self.require_runtime(first)?;
            }
            slot.subscribers.push(subscriber.clone());
            held
        };

        trace!(attachment = %self, subscriber = %subscriber.name(), replayed = held.len(), "subscribed");
        let mut failure = None;
        for item in held {
            if let Err(e) = self.deliver(&subscriber, item) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Forward every element of `self` into `target`
    pub fn subscribe_attachment(&self, target: &Attachment) -> Result<()> {
        let name = format!("{}_to_{}", self.inner.field, target.inner.field);
        let target = target.clone();
        self.subscribe_named(name, move |item| {
            let target = target.clone();
            async move {
                target.send(item)?;
                Ok(())
            }
        })
    }

    /// Augmented union
    ///
    /// An attachment source forwards into `self` from now on; its item
    /// type must be compatible with ours. A plain value is sent.
    pub fn add(&self, source: impl Into<Argument>) -> Result<()> {
        match source.into() {
            Argument::Value(item) => self.send(item).map(|_| ()),
            Argument::Attachment(other) => {
                let schema = self.inner.schema.as_ref().or(other.inner.schema.as_ref());
                if !other.inner_type().is_subtype_of(self.inner_type(), schema) {
                    return Err(Error::IncompatibleAttachment {
                        target: self.to_string(),
                        origin: other.to_string(),
                    });
                }
                other.subscribe_attachment(self)
            }
        }
    }

    /// Typed view as a bag
    pub fn as_bag(&self) -> Result<Bag> {
        self.expect_kind("Bag").map(|_| Bag::wrap(self.clone()))
    }

    pub fn as_single(&self) -> Result<Single> {
        self.expect_kind("Single").map(|_| Single::wrap(self.clone()))
    }

    pub fn as_bounded(&self) -> Result<BoundedStream> {
        self.expect_kind("BoundedStream")
            .map(|_| BoundedStream::wrap(self.clone()))
    }

    fn expect_kind(&self, expected: &str) -> Result<()> {
        if self.inner.kind.name() == expected {
            Ok(())
        } else {
            Err(Error::WrongAttachmentKind {
                attachment: self.label(),
                expected: expected.to_string(),
                actual: self.inner.kind.name().to_string(),
            })
        }
    }

    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.inner.slot.lock().store)
    }

    fn require_runtime(&self, item: &Value) -> Result<()> {
        match tokio::runtime::Handle::try_current() {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::NoRuntime {
                task: format!("{}.send({})", self.label(), item),
            }),
        }
    }

    fn deliver(&self, subscriber: &Subscriber, item: Value) -> Result<()> {
        let task = format!("{}({})", subscriber.name(), item);
        self.inner.context.spawn(task, subscriber.deliver(item))?;
        Ok(())
    }

    /// Drop elements and subscribers, releasing the entities they hold
    pub(crate) fn teardown(&self) {
        let mut slot = self.inner.slot.lock();
        slot.store.get_mut().clear();
        slot.subscribers.clear();
    }
}

/// Make `a` and `b` mirror each other
pub fn double_bind(a: &Attachment, b: &Attachment) -> Result<()> {
    a.subscribe_attachment(b)?;
    b.subscribe_attachment(a)
}

impl PartialEq for Attachment {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Attachment {}

impl fmt::Display for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@{}.{}",
            self.inner.kind.name(),
            self.inner.inner_type,
            self.inner.bearer,
            self.inner.field
        )
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("kind", &self.inner.kind)
            .field("bearer", &self.inner.bearer)
            .field("field", &self.inner.field)
            .field("len", &self.len())
            .finish()
    }
}

macro_rules! argument_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Argument {
                fn from(v: $ty) -> Self {
                    Argument::Value(v.into())
                }
            }
        )*
    };
}

argument_from_value!(Value, bool, i64, i32, u32, &str, String, Entity, &Entity, Vec<Value>);

macro_rules! argument_from_attachment {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Argument {
                fn from(a: $ty) -> Self {
                    Argument::Attachment(a.attachment().clone())
                }
            }

            impl From<&$ty> for Argument {
                fn from(a: &$ty) -> Self {
                    Argument::Attachment(a.attachment().clone())
                }
            }
        )*
    };
}

argument_from_attachment!(Bag, Single, BoundedStream);

impl From<Attachment> for Argument {
    fn from(a: Attachment) -> Self {
        Argument::Attachment(a)
    }
}

impl From<&Attachment> for Argument {
    fn from(a: &Attachment) -> Self {
        Argument::Attachment(a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bag(ctx: &Context, field: &str, inner: ValueType) -> Attachment {
        Attachment::new(ctx, "Thing[]", field, AttachmentKind::Bag, inner).unwrap()
    }

    #[test]
    fn test_type_checked_send() {
        let ctx = Context::new("attachments");
        let ints = bag(&ctx, "ints", ValueType::Int);
        let err = ints.send("nope").unwrap_err();
        assert_eq!(
            err,
            Error::AttachmentItemType {
                attachment: "Thing[].ints".to_string(),
                expected: "int".to_string(),
                value: Value::str("nope"),
            }
        );
        // no subscribers, so no runtime needed
        assert!(ints.send(1).unwrap());
        assert!(!ints.send(1).unwrap());
        assert!(!ints.send(Value::None).unwrap());
        assert_eq!(ints.items(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_single_none_requires_optional_type() {
        let ctx = Context::new("attachments");
        let strict = Attachment::new(&ctx, "Thing[]", "slot", AttachmentKind::Single, ValueType::Int).unwrap();
        assert!(matches!(
            strict.send(Value::None),
            Err(Error::AttachmentItemType { .. })
        ));

        let optional = Attachment::new(
            &ctx,
            "Thing[]",
            "slot",
            AttachmentKind::Single,
            ValueType::optional(ValueType::Int),
        )
        .unwrap();
        assert!(!optional.send(Value::None).unwrap());
        assert_eq!(optional.as_single().unwrap().value(), Some(None));
    }

    #[test]
    fn test_wrong_kind() {
        let ctx = Context::new("attachments");
        let ints = bag(&ctx, "ints", ValueType::Int);
        assert!(ints.as_bag().is_ok());
        assert_eq!(
            ints.as_single().unwrap_err(),
            Error::WrongAttachmentKind {
                attachment: "Thing[].ints".to_string(),
                expected: "Single".to_string(),
                actual: "Bag".to_string(),
            }
        );
    }

    #[test]
    fn test_incompatible_add() {
        let ctx = Context::new("attachments");
        let ints = bag(&ctx, "ints", ValueType::Int);
        let strs = bag(&ctx, "strs", ValueType::Str);
        let anything = bag(&ctx, "anything", ValueType::Any);

        assert!(matches!(
            ints.add(&strs),
            Err(Error::IncompatibleAttachment { .. })
        ));
        assert!(matches!(
            ints.add(&anything),
            Err(Error::IncompatibleAttachment { .. })
        ));
    }

    #[test]
    fn test_invalid_bounds() {
        let ctx = Context::new("attachments");
        let err = Attachment::new(
            &ctx,
            "Thing[]",
            "scores",
            AttachmentKind::Bounded { min: 3, max: 1 },
            ValueType::Int,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidBounds { .. }));
    }

    #[tokio::test]
    async fn test_subscriber_replay_and_fanout() {
        let ctx = Context::new("attachments");
        let ints = bag(&ctx, "ints", ValueType::Int);
        let calls = Arc::new(AtomicUsize::new(0));

        ints.send(1).unwrap();
        let seen = calls.clone();
        ints.subscribe(move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        ints.send(2).unwrap();
        ints.send(2).unwrap();

        ctx.stop(false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ints.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_double_bind_mirrors() {
        let ctx = Context::new("attachments");
        let a = bag(&ctx, "a", ValueType::Int);
        let b = bag(&ctx, "b", ValueType::Int);
        a.send(1).unwrap();
        double_bind(&a, &b).unwrap();
        b.send(2).unwrap();

        ctx.stop(false).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert!(a.contains(2));
        assert!(b.contains(1));
    }

    #[test]
    fn test_send_without_runtime_leaves_bound_pair_in_sync() {
        let ctx = Context::new("attachments");
        let a = bag(&ctx, "a", ValueType::Int);
        let b = bag(&ctx, "b", ValueType::Int);
        double_bind(&a, &b).unwrap();

        assert!(matches!(a.send(1), Err(Error::NoRuntime { .. })));
        assert!(a.is_empty());
        assert!(matches!(a.send(1), Err(Error::NoRuntime { .. })));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            assert!(a.send(1).unwrap());
            ctx.stop(false).await.unwrap();
        });
        assert_eq!(a.items(), vec![Value::Int(1)]);
        assert_eq!(b.items(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_replay_without_runtime_does_not_subscribe() {
        let ctx = Context::new("attachments");
        let ints = bag(&ctx, "ints", ValueType::Int);
        ints.send(1).unwrap();

        let err = ints.subscribe(|_| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::NoRuntime { .. }));
        assert_eq!(ints.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_add_forwards() {
        let ctx = Context::new("attachments");
        let target = bag(&ctx, "target", ValueType::optional(ValueType::Int));
        let source = bag(&ctx, "source", ValueType::Int);
        source.send(5).unwrap();

        target.add(&source).unwrap();
        target.add(6).unwrap();
        source.send(7).unwrap();

        ctx.stop(false).await.unwrap();
        let mut items: Vec<i64> = target.items().iter().filter_map(Value::as_int).collect();
        items.sort();
        assert_eq!(items, vec![5, 6, 7]);
        assert!(!source.contains(6));
    }
}
