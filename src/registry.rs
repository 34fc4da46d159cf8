//! Concurrency-safe collections of tracked objects.
//!
//! Registries own the collection-level lock. Lookups hand out clones (usually
//! `Arc`s) so that no caller keeps the lock while talking to the bus or
//! notifying subscribers.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Ordered map guarded by a single collection lock.
pub struct Registry<K, V> {
   entries: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> Default for Registry<K, V> {
   fn default() -> Self {
      Self {
         entries: RwLock::new(BTreeMap::new()),
      }
   }
}

impl<K: Ord + Clone, V: Clone> Registry<K, V> {
   pub fn new() -> Self {
      Self::default()
   }

   /// Inserts `value` unless `key` is already present. Returns whether it was
   /// inserted.
   pub fn insert_new(&self, key: K, value: V) -> bool {
      let mut entries = self.entries.write();
      if entries.contains_key(&key) {
         return false;
      }
      entries.insert(key, value);
      true
   }

   pub fn remove(&self, key: &K) -> Option<V> {
      self.entries.write().remove(key)
   }

   pub fn get(&self, key: &K) -> Option<V> {
      self.entries.read().get(key).cloned()
   }

   pub fn contains(&self, key: &K) -> bool {
      self.entries.read().contains_key(key)
   }

   pub fn len(&self) -> usize {
      self.entries.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.read().is_empty()
   }

   pub fn keys(&self) -> Vec<K> {
      self.entries.read().keys().cloned().collect()
   }

   pub fn values(&self) -> Vec<V> {
      self.entries.read().values().cloned().collect()
   }

   /// Removes every entry, returning them.
   pub fn drain(&self) -> Vec<V> {
      let entries = std::mem::take(&mut *self.entries.write());
      entries.into_values().collect()
   }

   /// Runs `f` with the collection lock held for reading.
   pub fn with<R>(&self, f: impl FnOnce(&BTreeMap<K, V>) -> R) -> R {
      f(&self.entries.read())
   }
}

/// Two-level registry: values grouped under an owner key (devices per adapter).
pub struct GroupedRegistry<G, K, V> {
   groups: RwLock<BTreeMap<G, BTreeMap<K, V>>>,
}

impl<G: Ord, K: Ord, V> Default for GroupedRegistry<G, K, V> {
   fn default() -> Self {
      Self {
         groups: RwLock::new(BTreeMap::new()),
      }
   }
}

impl<G: Ord + Clone, K: Ord + Clone, V: Clone> GroupedRegistry<G, K, V> {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn insert_new(&self, group: G, key: K, value: V) -> bool {
      let mut groups = self.groups.write();
      let group = groups.entry(group).or_default();
      if group.contains_key(&key) {
         return false;
      }
      group.insert(key, value);
      true
   }

   pub fn remove(&self, group: &G, key: &K) -> Option<V> {
      let mut groups = self.groups.write();
      let members = groups.get_mut(group)?;
      let removed = members.remove(key);
      if members.is_empty() {
         groups.remove(group);
      }
      removed
   }

   pub fn remove_group(&self, group: &G) -> Vec<V> {
      self
         .groups
         .write()
         .remove(group)
         .map(|m| m.into_values().collect())
         .unwrap_or_default()
   }

   /// Finds a value by key in any group.
   pub fn find(&self, key: &K) -> Option<V> {
      self
         .groups
         .read()
         .values()
         .find_map(|members| members.get(key).cloned())
   }

   pub fn group(&self, group: &G) -> Vec<V> {
      self
         .groups
         .read()
         .get(group)
         .map(|m| m.values().cloned().collect())
         .unwrap_or_default()
   }

   pub fn all(&self) -> Vec<V> {
      self
         .groups
         .read()
         .values()
         .flat_map(|m| m.values().cloned())
         .collect()
   }

   /// Runs `f` with the collection lock held for reading.
   pub fn with<R>(&self, f: impl FnOnce(&BTreeMap<G, BTreeMap<K, V>>) -> R) -> R {
      f(&self.groups.read())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_insert_new_keeps_first_value() {
      let reg: Registry<String, u32> = Registry::new();
      assert!(reg.insert_new("a".into(), 1));
      assert!(!reg.insert_new("a".into(), 2));
      assert_eq!(reg.get(&"a".into()), Some(1));
      assert_eq!(reg.len(), 1);
      assert_eq!(reg.drain(), vec![1]);
      assert!(reg.is_empty());
   }

   #[test]
   fn test_grouped_find_and_cleanup() {
      let reg: GroupedRegistry<&str, &str, u32> = GroupedRegistry::new();
      reg.insert_new("hci0", "d1", 1);
      reg.insert_new("hci0", "d2", 2);
      reg.insert_new("hci1", "d3", 3);

      assert_eq!(reg.find(&"d3"), Some(3));
      assert_eq!(reg.group(&"hci0"), vec![1, 2]);
      assert_eq!(reg.all().len(), 3);

      assert_eq!(reg.remove(&"hci1", &"d3"), Some(3));
      reg.with(|groups| assert!(!groups.contains_key("hci1")));
      assert_eq!(reg.remove_group(&"hci0"), vec![1, 2]);
      assert!(reg.all().is_empty());
   }
}
