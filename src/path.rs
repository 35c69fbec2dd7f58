//! Structured, hashable, prefix-matchable operation identity.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A single component of a [`Path`].
///
/// Implemented for any type that is `Debug + Eq + Hash + Send + Sync + 'static`, which covers
/// strings, integers, enums, and newtypes without requiring a component-specific adapter.
pub trait PathElement: Send + Sync + 'static {
    /// Type-erased equality: `false` whenever `other` is not the same concrete type.
    fn dyn_eq(&self, other: &dyn PathElement) -> bool;
    /// Feeds this component's discriminating state into `state`, stable across the process.
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn dyn_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn as_any(&self) -> &dyn Any;
}

impl<T> PathElement for T
where
    T: fmt::Debug + Eq + Hash + Send + Sync + 'static,
{
    fn dyn_eq(&self, other: &dyn PathElement) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        // Mix in the concrete type so that equal-looking values of different types
        // (e.g. `1u64` and `1i64`) never collide across component types.
        std::any::TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }

    fn dyn_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for dyn PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dyn_debug(f)
    }
}

/// A structured, order-sensitive identity for an operation.
///
/// Two paths are equal iff component-wise equal; `a.is_prefix_of(b)` holds iff `a.len() <= b.len()`
/// and the first `a.len()` components of `b` equal `a`'s components. Components may be of
/// heterogeneous types (a string segment followed by an integer id is a common shape).
///
/// `Path` is the key type of the [`Client`](crate::client::Client) registry.
#[derive(Clone, Default)]
pub struct Path(Vec<Arc<dyn PathElement>>);

impl Path {
    /// The empty path; a prefix of every path, including itself.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// A single-component path.
    pub fn of<T: PathElement>(component: T) -> Self {
        Self(vec![Arc::new(component)])
    }

    /// Returns a new path with `component` appended.
    pub fn append<T: PathElement>(&self, component: T) -> Self {
        let mut components = self.0.clone();
        components.push(Arc::new(component));
        Self(components)
    }

    /// Returns a new path with `component` inserted at the front.
    pub fn prepend<T: PathElement>(&self, component: T) -> Self {
        let mut components = Vec::with_capacity(self.0.len() + 1);
        components.push(Arc::new(component) as Arc<dyn PathElement>);
        components.extend(self.0.iter().cloned());
        Self(components)
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `true` iff `self`'s components are a component-wise prefix of `other`'s.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a.dyn_eq(b.as_ref()))
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.dyn_eq(b.as_ref()))
    }
}

impl Eq for Path {}

impl Hash for Path {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for component in &self.0 {
            component.dyn_hash(state);
        }
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Path").field(&self.0).finish()
    }
}
