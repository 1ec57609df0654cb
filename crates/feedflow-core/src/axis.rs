//! Message axes
//!
//! An axis is an independently-changeable dimension of a message (data,
//! error, progress, or any custom dimension registered at runtime). Axes are
//! interned: each name maps to a small integer token, so membership checks in
//! touched-axis sets are integer comparisons.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

const BUILTIN_AXES: [&str; 3] = ["Data", "Error", "Progress"];

fn registry() -> &'static RwLock<Vec<&'static str>> {
    static REGISTRY: OnceLock<RwLock<Vec<&'static str>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(BUILTIN_AXES.to_vec()))
}

/// Interned axis token
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageAxis(u32);

impl MessageAxis {
    /// The value carried by the message
    pub const DATA: MessageAxis = MessageAxis(0);
    /// The error carried by the message
    pub const ERROR: MessageAxis = MessageAxis(1);
    /// The transient / in-progress flag
    pub const PROGRESS: MessageAxis = MessageAxis(2);

    /// Register (or look up) a custom axis by name
    ///
    /// Registering a name twice yields the same token.
    pub fn register(name: &str) -> MessageAxis {
        if let Some(axis) = Self::lookup(name) {
            return axis;
        }

        let mut names = registry().write();
        if let Some(index) = names.iter().position(|n| *n == name) {
            return MessageAxis(index as u32);
        }
        // Interned names live for the whole process; the set of axes is small.
        let interned: &'static str = Box::leak(name.to_owned().into_boxed_str());
        names.push(interned);
        MessageAxis((names.len() - 1) as u32)
    }

    /// Find an already registered axis
    pub fn lookup(name: &str) -> Option<MessageAxis> {
        registry()
            .read()
            .iter()
            .position(|n| *n == name)
            .map(|index| MessageAxis(index as u32))
    }

    /// Axis name
    pub fn name(self) -> &'static str {
        registry()
            .read()
            .get(self.0 as usize)
            .copied()
            .unwrap_or("<unknown>")
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_builtin(self) -> bool {
        (self.0 as usize) < BUILTIN_AXES.len()
    }
}

impl fmt::Debug for MessageAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Axis({})", self.name())
    }
}

impl fmt::Display for MessageAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered, duplicate-free set of axes
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AxisSet {
    axes: Vec<MessageAxis>,
}

impl AxisSet {
    pub fn new() -> Self {
        AxisSet { axes: Vec::new() }
    }

    /// Insert an axis, keeping insertion order. Returns false if already present.
    pub fn insert(&mut self, axis: MessageAxis) -> bool {
        if self.axes.contains(&axis) {
            return false;
        }
        self.axes.push(axis);
        true
    }

    #[inline]
    pub fn contains(&self, axis: MessageAxis) -> bool {
        self.axes.contains(&axis)
    }

    /// Check whether the two sets share at least one axis
    pub fn intersects(&self, other: &AxisSet) -> bool {
        self.first_common(other).is_some()
    }

    /// First axis of `self` (in order) that is also in `other`
    pub fn first_common(&self, other: &AxisSet) -> Option<MessageAxis> {
        self.axes.iter().copied().find(|a| other.contains(*a))
    }

    pub fn clear(&mut self) {
        self.axes.clear();
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MessageAxis> + '_ {
        self.axes.iter().copied()
    }
}

impl fmt::Debug for AxisSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.axes.iter()).finish()
    }
}

impl FromIterator<MessageAxis> for AxisSet {
    fn from_iter<I: IntoIterator<Item = MessageAxis>>(iter: I) -> Self {
        let mut set = AxisSet::new();
        for axis in iter {
            set.insert(axis);
        }
        set
    }
}

impl<const N: usize> From<[MessageAxis; N]> for AxisSet {
    fn from(axes: [MessageAxis; N]) -> Self {
        axes.into_iter().collect()
    }
}

/// Opaque value of a custom axis
///
/// Custom axis values compare by identity: two values are equal only if
/// they are clones of the same `AxisValue`.
#[derive(Clone)]
pub struct AxisValue(Arc<dyn Any + Send + Sync>);

impl AxisValue {
    pub fn new<V: Any + Send + Sync>(value: V) -> Self {
        AxisValue(Arc::new(value))
    }

    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.0.downcast_ref::<V>()
    }

    /// Identity comparison
    pub fn same(&self, other: &AxisValue) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl PartialEq for AxisValue {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AxisValue({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}
