//! Property store with change notification.
//!
//! Every bus-exposed object keeps its mirrored state in a [`PropertyStore`].
//! All writes go through a single compare-and-set operation that notifies the
//! object's [`PropertySink`] exactly once per observed transition, while the
//! object's own lock is still held.

use std::{mem, sync::Arc};

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::event::{BusObject, Event, EventSender};

/// Represents the result of an update operation on a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// The stored value already matched.
   Noop,
   /// The value changed; carries the previous value.
   Updated(T),
}

impl<T> UpdateOp<T> {
   pub const fn is_updated(&self) -> bool {
      matches!(self, Self::Updated(_))
   }
}

/// Values that can live in a property store.
pub trait PropertyValue: Clone + Send + 'static {
   /// Whether storing `other` over `self` would be a no-op.
   fn same_as(&self, other: &Self) -> bool;
}

macro_rules! eq_property_value {
   ($($ty:ty),* $(,)?) => {
      $(
         impl PropertyValue for $ty {
            fn same_as(&self, other: &Self) -> bool {
               self == other
            }
         }
      )*
   };
}

eq_property_value!(bool, u16, u32, u64, i16, i32, i64, f64, String, SmolStr, Vec<String>);

impl<T: PropertyValue + PartialEq> PropertyValue for Option<T> {
   fn same_as(&self, other: &Self) -> bool {
      self == other
   }
}

/// A string list compared as a set: order and duplicates are ignored.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StrSet(pub Vec<String>);

impl PropertyValue for StrSet {
   fn same_as(&self, other: &Self) -> bool {
      let mut a: Vec<&str> = self.0.iter().map(String::as_str).collect();
      let mut b: Vec<&str> = other.0.iter().map(String::as_str).collect();
      a.sort_unstable();
      a.dedup();
      b.sort_unstable();
      b.dedup();
      a == b
   }
}

/// Receives change notifications from a [`PropertyStore`].
///
/// Called with the store's lock held; implementations must not block and must
/// not call back into the same store.
pub trait PropertySink<S>: Send + Sync {
   fn changed(&self, path: &str, name: &'static str, state: &S);
}

/// Sink that republishes changes as `PropertiesChanged` on a fixed bus object.
pub struct BusSink {
   bus: EventSender,
   object: BusObject,
}

impl BusSink {
   pub fn new(bus: EventSender, object: BusObject) -> Arc<Self> {
      Arc::new(Self { bus, object })
   }
}

impl<S> PropertySink<S> for BusSink {
   fn changed(&self, _path: &str, name: &'static str, _state: &S) {
      self.bus.emit(Event::PropertyChanged(self.object, name));
   }
}

/// Named attribute storage for one tracked object.
pub struct PropertyStore<S> {
   path: SmolStr,
   state: Mutex<S>,
   sink: Arc<dyn PropertySink<S>>,
}

impl<S> PropertyStore<S> {
   pub fn new(path: impl Into<SmolStr>, state: S, sink: Arc<dyn PropertySink<S>>) -> Self {
      Self {
         path: path.into(),
         state: Mutex::new(state),
         sink,
      }
   }

   /// Identity of the object owning this store.
   pub fn path(&self) -> &SmolStr {
      &self.path
   }

   pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
      f(&self.state.lock())
   }

   pub fn snapshot(&self) -> S
   where
      S: Clone,
   {
      self.state.lock().clone()
   }

   /// Mutates bookkeeping fields that are not published on the bus.
   pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
      f(&mut self.state.lock())
   }

   /// Stores `value` and notifies the sink if it differs from the current one.
   pub fn set<V: PropertyValue>(
      &self,
      name: &'static str,
      field: impl FnOnce(&mut S) -> &mut V,
      value: V,
   ) -> UpdateOp<V> {
      self.set_when(name, field, value, |_| true)
   }

   /// Stores `value` without ever notifying.
   pub fn set_quiet<V: PropertyValue>(
      &self,
      field: impl FnOnce(&mut S) -> &mut V,
      value: V,
   ) -> UpdateOp<V> {
      self.set_when("", field, value, |_| false)
   }

   /// Stores `value`; on a change, notifies only if `notify` approves the new
   /// state.
   pub fn set_when<V: PropertyValue>(
      &self,
      name: &'static str,
      field: impl FnOnce(&mut S) -> &mut V,
      value: V,
      notify: impl FnOnce(&S) -> bool,
   ) -> UpdateOp<V> {
      let mut state = self.state.lock();
      self.store(&mut state, name, field, value, notify)
   }

   /// Like [`set`](Self::set), but computes the value from the current state
   /// under the same lock.
   pub fn set_derived<V: PropertyValue>(
      &self,
      name: &'static str,
      field: impl FnOnce(&mut S) -> &mut V,
      value: impl FnOnce(&S) -> V,
   ) -> UpdateOp<V> {
      let mut state = self.state.lock();
      let value = value(&state);
      self.store(&mut state, name, field, value, |_| true)
   }

   fn store<V: PropertyValue>(
      &self,
      state: &mut S,
      name: &'static str,
      field: impl FnOnce(&mut S) -> &mut V,
      value: V,
      notify: impl FnOnce(&S) -> bool,
   ) -> UpdateOp<V> {
      let slot = field(state);
      if slot.same_as(&value) {
         return UpdateOp::Noop;
      }
      let prev = mem::replace(slot, value);
      if notify(state) {
         self.sink.changed(&self.path, name, state);
      }
      UpdateOp::Updated(prev)
   }
}

#[cfg(test)]
pub mod testing {
   use super::*;

   /// Sink that records `(path, name)` for every notification.
   #[derive(Default)]
   pub struct CountingSink {
      pub seen: Mutex<Vec<(String, &'static str)>>,
   }

   impl CountingSink {
      pub fn new() -> Arc<Self> {
         Arc::new(Self::default())
      }

      pub fn count(&self, name: &str) -> usize {
         self.seen.lock().iter().filter(|(_, n)| *n == name).count()
      }
   }

   impl<S> PropertySink<S> for CountingSink {
      fn changed(&self, path: &str, name: &'static str, _state: &S) {
         self.seen.lock().push((path.to_string(), name));
      }
   }
}
