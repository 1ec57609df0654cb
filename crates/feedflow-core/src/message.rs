//! Versioned messages
//!
//! A message is an immutable envelope: the entry before, the entry now, and
//! the set of axes that differ between them. Entries are shared through
//! `Arc`, so a snapshot pinned by an in-flight execution can never change
//! underneath it.

use std::fmt;
use std::sync::Arc;

use crate::{AxisSet, AxisValue, EntryId, FeedError, MessageAxis};

/// Bound for values carried by feeds
pub trait FeedValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> FeedValue for T {}

/// One immutable state of a feed
#[derive(Clone)]
pub struct MessageEntry<T> {
    id: EntryId,
    data: Option<T>,
    error: Option<FeedError>,
    is_transient: bool,
    custom: Vec<(MessageAxis, AxisValue)>,
}

impl<T> MessageEntry<T> {
    /// No data, no error, not transient
    pub fn empty() -> Self {
        MessageEntry {
            id: EntryId::next(),
            data: None,
            error: None,
            is_transient: false,
            custom: Vec::new(),
        }
    }

    /// Entry holding `data`
    pub fn of(data: T) -> Self {
        MessageEntry {
            data: Some(data),
            ..Self::empty()
        }
    }

    #[inline]
    pub fn id(&self) -> EntryId {
        self.id
    }

    #[inline]
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    #[inline]
    pub fn error(&self) -> Option<&FeedError> {
        self.error.as_ref()
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    /// Value of a custom axis
    pub fn axis_value(&self, axis: MessageAxis) -> Option<&AxisValue> {
        self.custom
            .iter()
            .find(|(a, _)| *a == axis)
            .map(|(_, value)| value)
    }

    /// Custom axes set on this entry
    pub fn custom_axes(&self) -> impl Iterator<Item = (MessageAxis, &AxisValue)> + '_ {
        self.custom.iter().map(|(axis, value)| (*axis, value))
    }
}

impl<T: Clone> MessageEntry<T> {
    /// Start building a successor of this entry
    pub fn edit(&self) -> MessageBuilder<T> {
        MessageBuilder {
            data: self.data.clone(),
            error: self.error.clone(),
            is_transient: self.is_transient,
            custom: self.custom.clone(),
        }
    }
}

impl<T: PartialEq> MessageEntry<T> {
    /// Per-axis equality rule
    pub fn axis_equals(&self, other: &MessageEntry<T>, axis: MessageAxis) -> bool {
        match axis {
            MessageAxis::DATA => self.data == other.data,
            MessageAxis::ERROR => self.error == other.error,
            MessageAxis::PROGRESS => self.is_transient == other.is_transient,
            custom => match (self.axis_value(custom), other.axis_value(custom)) {
                (None, None) => true,
                (Some(a), Some(b)) => a.same(b),
                _ => false,
            },
        }
    }

    /// Axes whose value differs between `self` and `next`
    pub fn diff(&self, next: &MessageEntry<T>) -> AxisSet {
        let mut changes = AxisSet::new();

        for axis in [MessageAxis::DATA, MessageAxis::ERROR, MessageAxis::PROGRESS] {
            if !self.axis_equals(next, axis) {
                changes.insert(axis);
            }
        }

        let custom_axes = self.custom.iter().chain(next.custom.iter()).map(|(a, _)| *a);
        for axis in custom_axes {
            if !self.axis_equals(next, axis) {
                changes.insert(axis);
            }
        }

        changes
    }
}

impl<T: fmt::Debug> fmt::Debug for MessageEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEntry")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_transient", &self.is_transient)
            .field("custom", &self.custom.len())
            .finish()
    }
}

/// Builder for a successor entry
pub struct MessageBuilder<T> {
    data: Option<T>,
    error: Option<FeedError>,
    is_transient: bool,
    custom: Vec<(MessageAxis, AxisValue)>,
}

impl<T> MessageBuilder<T> {
    /// Data the builder currently holds
    pub fn current_data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn data(mut self, data: Option<T>) -> Self {
        self.data = data;
        self
    }

    pub fn error(mut self, error: Option<FeedError>) -> Self {
        self.error = error;
        self
    }

    pub fn transient(mut self, is_transient: bool) -> Self {
        self.is_transient = is_transient;
        self
    }

    /// Set or clear a custom axis
    ///
    /// Built-in axes have dedicated setters and are ignored here.
    pub fn axis(mut self, axis: MessageAxis, value: Option<AxisValue>) -> Self {
        if axis.is_builtin() {
            return self;
        }
        self.custom.retain(|(a, _)| *a != axis);
        if let Some(value) = value {
            self.custom.push((axis, value));
        }
        self
    }

    pub fn build(self) -> MessageEntry<T> {
        MessageEntry {
            id: EntryId::next(),
            data: self.data,
            error: self.error,
            is_transient: self.is_transient,
            custom: self.custom,
        }
    }
}

/// Versioned message: previous entry, current entry and the changed axes
pub struct Message<T> {
    previous: Arc<MessageEntry<T>>,
    current: Arc<MessageEntry<T>>,
    changes: AxisSet,
}

impl<T> Clone for Message<T> {
    fn clone(&self) -> Self {
        Message {
            previous: Arc::clone(&self.previous),
            current: Arc::clone(&self.current),
            changes: self.changes.clone(),
        }
    }
}

impl<T> Message<T> {
    /// Canonical empty seed of every stream
    pub fn initial() -> Self {
        let entry = Arc::new(MessageEntry::empty());
        Message {
            previous: Arc::clone(&entry),
            current: entry,
            changes: AxisSet::new(),
        }
    }

    #[inline]
    pub fn current(&self) -> &MessageEntry<T> {
        &self.current
    }

    #[inline]
    pub fn current_arc(&self) -> &Arc<MessageEntry<T>> {
        &self.current
    }

    #[inline]
    pub fn previous(&self) -> &MessageEntry<T> {
        &self.previous
    }

    #[inline]
    pub fn changes(&self) -> &AxisSet {
        &self.changes
    }

    /// An empty change set is only valid for the first message of a stream
    #[inline]
    pub fn is_initial(&self) -> bool {
        self.changes.is_empty()
    }

    /// Untyped view of this message
    pub fn info(&self) -> MessageInfo {
        MessageInfo {
            entry: self.current.id(),
            changes: self.changes.clone(),
            is_transient: self.current.is_transient(),
            has_data: self.current.data().is_some(),
            error: self.current.error().cloned(),
            custom: self
                .current
                .custom_axes()
                .map(|(axis, value)| (axis, value.clone()))
                .collect(),
        }
    }
}

impl<T: PartialEq> Message<T> {
    /// Build a message from two entries, computing the changed axes
    pub fn from_entries(previous: Arc<MessageEntry<T>>, current: Arc<MessageEntry<T>>) -> Self {
        let changes = previous.diff(&current);
        Message {
            previous,
            current,
            changes,
        }
    }

    /// First message of a new subscription, diffed against the empty seed
    pub fn first(current: Arc<MessageEntry<T>>) -> Self {
        Self::from_entries(Arc::new(MessageEntry::empty()), current)
    }

    /// Successor of this message
    pub fn next(&self, entry: MessageEntry<T>) -> Self {
        Self::from_entries(Arc::clone(&self.current), Arc::new(entry))
    }
}

impl<T: Clone + PartialEq> Message<T> {
    /// Successor built by editing the current entry
    pub fn update(&self, f: impl FnOnce(MessageBuilder<T>) -> MessageBuilder<T>) -> Self {
        self.next(f(self.current.edit()).build())
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("current", &self.current)
            .field("changes", &self.changes)
            .finish()
    }
}

/// Type-erased view of a message
#[derive(Clone, Debug, PartialEq)]
pub struct MessageInfo {
    pub entry: EntryId,
    pub changes: AxisSet,
    pub is_transient: bool,
    pub has_data: bool,
    pub error: Option<FeedError>,
    pub custom: Vec<(MessageAxis, AxisValue)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_message() {
        let message = Message::<u32>::initial();
        assert!(message.is_initial());
        assert!(message.current().data().is_none());
        assert!(message.current().error().is_none());
        assert!(!message.current().is_transient());
    }

    #[test]
    fn test_next_computes_changes() {
        let first = Message::initial().next(MessageEntry::of(1u32));
        assert_eq!(first.changes(), &AxisSet::from([MessageAxis::DATA]));

        let loading = first.update(|b| b.transient(true));
        assert_eq!(loading.changes(), &AxisSet::from([MessageAxis::PROGRESS]));
        assert_eq!(loading.current().data(), Some(&1));

        let failed = loading.update(|b| b.transient(false).error(Some(FeedError::Cancelled)));
        assert_eq!(
            failed.changes(),
            &AxisSet::from([MessageAxis::ERROR, MessageAxis::PROGRESS])
        );
    }

    #[test]
    fn test_custom_axis_identity() {
        let axis = MessageAxis::register("Pagination");
        let token = AxisValue::new("page-2");

        let a = Message::<u32>::initial().update(|b| b.axis(axis, Some(token.clone())));
        assert_eq!(a.changes(), &AxisSet::from([axis]));

        let same = a.update(|b| b.axis(axis, Some(token.clone())));
        assert!(same.changes().is_empty());

        let other = a.update(|b| b.axis(axis, Some(AxisValue::new("page-2"))));
        assert_eq!(other.changes(), &AxisSet::from([axis]));

        let cleared = other.update(|b| b.axis(axis, None));
        assert_eq!(cleared.changes(), &AxisSet::from([axis]));
    }

    #[test]
    fn test_builtin_axis_ignored_by_custom_setter() {
        let message = Message::<u32>::initial().update(|b| b.axis(MessageAxis::DATA, Some(AxisValue::new(1u8))));
        assert!(message.changes().is_empty());
    }

    #[test]
    fn test_info_is_untyped_view() {
        let message = Message::initial().next(MessageEntry::of("x".to_string()));
        let info = message.info();
        assert!(info.has_data);
        assert!(!info.is_transient);
        assert_eq!(info.entry, message.current().id());
        assert_eq!(info.changes, AxisSet::from([MessageAxis::DATA]));
        assert!(info.custom.is_empty());

        let axis = MessageAxis::register("Origin");
        let token = AxisValue::new("cache");
        let tagged = message.update(|b| b.axis(axis, Some(token.clone())));
        assert_eq!(tagged.info().custom, vec![(axis, token)]);
    }

    proptest! {
        #[test]
        fn prop_changes_match_axis_rules(
            a in proptest::option::of(0u8..4),
            b in proptest::option::of(0u8..4),
            ta: bool,
            tb: bool,
        ) {
            let first = Message::initial().update(|x| x.data(a).transient(ta));
            let second = first.update(|x| x.data(b).transient(tb));

            prop_assert_eq!(second.changes().contains(MessageAxis::DATA), a != b);
            prop_assert_eq!(second.changes().contains(MessageAxis::PROGRESS), ta != tb);
            prop_assert!(!second.changes().contains(MessageAxis::ERROR));
        }

        #[test]
        fn prop_first_message_diffs_against_empty(v in proptest::option::of(any::<i32>())) {
            let entry = Arc::new(MessageEntry::empty().edit().data(v).build());
            let message = Message::first(entry);
            prop_assert_eq!(message.is_initial(), v.is_none());
        }
    }
}
