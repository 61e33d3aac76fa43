use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An immutable, cheaply cloneable store of request-scoped values, keyed by
/// type. At most one value of each type is carried; layering a second value
/// of the same type shadows the first.
///
/// Values are shared behind [`Arc`], so cloning a context never copies the
/// values themselves. [`Context::with`] copies only the key table, which
/// stays small (one entry per middleware).
#[derive(Clone, Default)]
pub struct Context {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context carrying `value` in addition to everything in
    /// `self`. An existing value of the same type is shadowed.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(&self, value: T) -> Self {
        let mut values = self.values.clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self { values }
    }

    /// Like [`Context::with`], but shares an already-reference-counted value.
    #[must_use]
    pub fn with_shared<T: Send + Sync + 'static>(&self, value: Arc<T>) -> Self {
        let mut values = self.values.clone();
        values.insert(TypeId::of::<T>(), value);
        Self { values }
    }

    /// Look up a value by type.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Look up a value by type, returning the shared handle.
    #[must_use]
    pub fn get_shared<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Look up a value by type, panicking when it is absent.
    ///
    /// Use this from `for_context`-style accessors where the value is
    /// installed unconditionally by the middleware stack; its absence means
    /// the server was mis-assembled.
    #[must_use]
    pub fn expect<T: Send + Sync + 'static>(&self, what: &str) -> &T {
        match self.get::<T>() {
            Some(v) => v,
            None => panic!("no {what} in this context"),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.values.len())
            .finish()
    }
}
