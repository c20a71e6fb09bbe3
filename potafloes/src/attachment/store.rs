//! Attachment storage backends
//!
//! This module defines the `AttachmentStore` trait and one store per
//! attachment variant. Stores only hold elements and decide whether an
//! offered item changes them; fan-out to subscribers is the attachment's
//! job.

use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// Result of offering an item to a store
#[derive(Debug, Default)]
pub struct Outcome {
    /// Newly held element, to be delivered to subscribers
    pub added: Option<Value>,
    /// Failure raised after the store already changed
    pub failure: Option<Error>,
}

impl Outcome {
    fn unchanged() -> Self {
        Self::default()
    }

    fn added(item: Value) -> Self {
        Self {
            added: Some(item),
            failure: None,
        }
    }
}

/// Trait for attachment storage backends
pub trait AttachmentStore: Send + Sync {
    /// Offer an item; `Value::None` is an empty send
    fn insert(&mut self, item: Value) -> Result<Outcome>;

    /// Held elements in insertion order
    fn items(&self) -> Vec<Value>;

    fn contains(&self, item: &Value) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every element
    fn clear(&mut self);
}

/// Unbounded set of distinct elements
#[derive(Debug, Default)]
pub struct BagStore {
    items: Vec<Value>,
    seen: HashSet<Value>,
}

impl BagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttachmentStore for BagStore {
    fn insert(&mut self, item: Value) -> Result<Outcome> {
        if item.is_none() || !self.seen.insert(item.clone()) {
            return Ok(Outcome::unchanged());
        }
        self.items.push(item.clone());
        Ok(Outcome::added(item))
    }

    fn items(&self) -> Vec<Value> {
        self.items.clone()
    }

    fn contains(&self, item: &Value) -> bool {
        self.seen.contains(item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
        self.seen.clear();
    }
}

/// State of a single-value slot
#[derive(Debug, Clone, PartialEq)]
pub enum SingleState {
    Unset,
    /// Explicitly sent `None`; terminal
    Empty,
    Set(Value),
}

/// At most one element, published through a watch channel
pub struct SingleStore {
    bearer: Arc<str>,
    field: Arc<str>,
    state: watch::Sender<SingleState>,
}

impl SingleStore {
    pub fn new(bearer: Arc<str>, field: Arc<str>) -> Self {
        let (state, _) = watch::channel(SingleState::Unset);
        Self {
            bearer,
            field,
            state,
        }
    }

    pub fn state(&self) -> SingleState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SingleState> {
        self.state.subscribe()
    }

    fn double_set(&self, existing: Value, attempted: Value) -> Error {
        Error::DoubleSet {
            entity: self.bearer.to_string(),
            attribute: self.field.to_string(),
            existing,
            attempted,
        }
    }
}

impl AttachmentStore for SingleStore {
    fn insert(&mut self, item: Value) -> Result<Outcome> {
        match (self.state(), item) {
            (SingleState::Unset, Value::None) => {
                self.state.send_replace(SingleState::Empty);
                Ok(Outcome::unchanged())
            }
            (SingleState::Unset, item) => {
                self.state.send_replace(SingleState::Set(item.clone()));
                Ok(Outcome::added(item))
            }
            (SingleState::Empty, Value::None) => Ok(Outcome::unchanged()),
            (SingleState::Empty, item) => Err(self.double_set(Value::None, item)),
            (SingleState::Set(existing), item) if existing == item => Ok(Outcome::unchanged()),
            (SingleState::Set(existing), item) => Err(self.double_set(existing, item)),
        }
    }

    fn items(&self) -> Vec<Value> {
        match &*self.state.borrow() {
            SingleState::Set(item) => vec![item.clone()],
            _ => Vec::new(),
        }
    }

    fn contains(&self, item: &Value) -> bool {
        matches!(&*self.state.borrow(), SingleState::Set(held) if held == item)
    }

    fn len(&self) -> usize {
        usize::from(matches!(&*self.state.borrow(), SingleState::Set(_)))
    }

    fn clear(&mut self) {
        self.state.send_replace(SingleState::Unset);
    }
}

/// Completion of a bounded stream: `None` until `max` counted sends
pub type Completion = Option<Result<Vec<Value>>>;

/// Distinct elements with `min..=max` cardinality
///
/// Every new element and every `None` send is counted; duplicates are
/// ignored. The send that brings the count to `max` completes the
/// stream, with `IncompleteBoundedStream` if fewer than `min` elements
/// arrived.
pub struct BoundedStore {
    attachment: Arc<str>,
    min: usize,
    max: usize,
    count: usize,
    items: Vec<Value>,
    completion: watch::Sender<Completion>,
}

impl BoundedStore {
    pub fn new(attachment: Arc<str>, min: usize, max: usize) -> Self {
        let initial = if max == 0 { Some(Ok(Vec::new())) } else { None };
        let (completion, _) = watch::channel(initial);
        Self {
            attachment,
            min,
            max,
            count: 0,
            items: Vec::new(),
            completion,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    pub fn completion(&self) -> Completion {
        self.completion.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Completion> {
        self.completion.subscribe()
    }
}

impl AttachmentStore for BoundedStore {
    fn insert(&mut self, item: Value) -> Result<Outcome> {
        if !item.is_none() && self.items.contains(&item) {
            return Ok(Outcome::unchanged());
        }
        if self.count >= self.max {
            return Err(Error::BoundedStreamOverflow {
                attachment: self.attachment.to_string(),
                max: self.max,
            });
        }

        self.count += 1;
        let mut outcome = if item.is_none() {
            Outcome::unchanged()
        } else {
            self.items.push(item.clone());
            Outcome::added(item)
        };

        if self.count == self.max {
            if self.items.len() < self.min {
                let incomplete = Error::IncompleteBoundedStream {
                    attachment: self.attachment.to_string(),
                    len: self.items.len(),
                    min: self.min,
                };
                self.completion.send_replace(Some(Err(incomplete.clone())));
                outcome.failure = Some(incomplete);
            } else {
                self.completion.send_replace(Some(Ok(self.items.clone())));
            }
        }
        Ok(outcome)
    }

    fn items(&self) -> Vec<Value> {
        self.items.clone()
    }

    fn contains(&self, item: &Value) -> bool {
        self.items.contains(item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label() -> Arc<str> {
        Arc::from("Thing[].field")
    }

    #[test]
    fn test_bag_idempotent() {
        let mut bag = BagStore::new();
        assert_eq!(bag.insert(Value::Int(1)).unwrap().added, Some(Value::Int(1)));
        assert!(bag.insert(Value::Int(1)).unwrap().added.is_none());
        assert!(bag.insert(Value::None).unwrap().added.is_none());
        assert_eq!(bag.items(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_single_exclusive() {
        let mut single = SingleStore::new(Arc::from("Thing[]"), Arc::from("slot"));
        assert!(single.insert(Value::Int(1)).unwrap().added.is_some());
        assert!(single.insert(Value::Int(1)).unwrap().added.is_none());

        let err = single.insert(Value::Int(2)).unwrap_err();
        assert_eq!(
            err,
            Error::DoubleSet {
                entity: "Thing[]".to_string(),
                attribute: "slot".to_string(),
                existing: Value::Int(1),
                attempted: Value::Int(2),
            }
        );
        assert_eq!(single.state(), SingleState::Set(Value::Int(1)));
    }

    #[test]
    fn test_single_empty_is_terminal() {
        let mut single = SingleStore::new(Arc::from("Thing[]"), Arc::from("slot"));
        assert!(single.insert(Value::None).unwrap().added.is_none());
        assert_eq!(single.state(), SingleState::Empty);
        assert!(single.insert(Value::None).is_ok());
        assert!(matches!(
            single.insert(Value::Int(3)),
            Err(Error::DoubleSet { .. })
        ));
        assert!(single.items().is_empty());
    }

    #[test]
    fn test_bounded_counts_none_and_ignores_duplicates() {
        let mut bounded = BoundedStore::new(label(), 0, 2);
        bounded.insert(Value::Int(7)).unwrap();
        bounded.insert(Value::None).unwrap();
        assert_eq!(bounded.count(), 2);
        assert_eq!(bounded.completion(), Some(Ok(vec![Value::Int(7)])));

        // duplicate after completion is still a no-op
        assert!(bounded.insert(Value::Int(7)).unwrap().added.is_none());
        assert!(matches!(
            bounded.insert(Value::Int(8)),
            Err(Error::BoundedStreamOverflow { max: 2, .. })
        ));
        assert!(matches!(
            bounded.insert(Value::None),
            Err(Error::BoundedStreamOverflow { .. })
        ));
    }

    #[test]
    fn test_bounded_incomplete() {
        let mut bounded = BoundedStore::new(label(), 2, 2);
        bounded.insert(Value::Int(1)).unwrap();
        let outcome = bounded.insert(Value::None).unwrap();
        assert!(outcome.added.is_none());
        assert_eq!(
            outcome.failure,
            Some(Error::IncompleteBoundedStream {
                attachment: "Thing[].field".to_string(),
                len: 1,
                min: 2
            })
        );
        assert!(matches!(bounded.completion(), Some(Err(_))));
    }

    #[test]
    fn test_bounded_zero_max_is_complete() {
        let bounded = BoundedStore::new(label(), 0, 0);
        assert_eq!(bounded.completion(), Some(Ok(Vec::new())));
    }
}
