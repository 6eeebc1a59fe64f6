//! Small insertion-ordered symbol-id to value map.
//!
//! Lookup is linear on purpose: scopes hold a handful of entries and a scan
//! beats hashing at that size. Insertion order is creation order, which the
//! backtrace printer relies on.

use smallvec::SmallVec;

use crate::vm::value::Value;

/// One lexical scope of the running program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope(SmallVec<[(u16, Value); 8]>);

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: u16) -> Option<&Value> {
        self.0.iter().find(|(slot, _)| *slot == id).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Value> {
        self.0
            .iter_mut()
            .find(|(slot, _)| *slot == id)
            .map(|(_, v)| v)
    }

    /// Binds `id`, overwriting an existing entry in place.
    pub fn insert(&mut self, id: u16, value: Value) {
        match self.get_mut(id) {
            Some(slot) => *slot = value,
            None => self.0.push((id, value)),
        }
    }

    /// Unbinds `id`; true when something was removed.
    pub fn remove(&mut self, id: u16) -> bool {
        match self.0.iter().position(|(slot, _)| *slot == id) {
            Some(index) => {
                self.0.remove(index);
                true
            }
            None => false,
        }
    }

    /// Finds the symbol id bound to a value, for backtrace rendering.
    #[must_use]
    pub fn id_of(&self, value: &Value) -> Option<u16> {
        self.0
            .iter()
            .find(|(_, held)| held.same_function(value))
            .map(|(slot, _)| *slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u16, Value)> {
        self.0.iter()
    }
}

impl FromIterator<(u16, Value)> for Scope {
    fn from_iter<T: IntoIterator<Item = (u16, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_overwrites_in_place() {
        let mut scope = Scope::new();
        scope.insert(3, Value::Number(1.0));
        scope.insert(5, Value::Number(2.0));
        scope.insert(3, Value::Number(9.0));
        assert_eq!(scope.len(), 2);
        assert_eq!(scope.get(3), Some(&Value::Number(9.0)));
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut scope = Scope::new();
        scope.insert(7, Value::Nil);
        scope.insert(2, Value::True);
        let ids: Vec<u16> = scope.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![7, 2]);
    }

    #[test]
    fn remove_unbinds() {
        let mut scope = Scope::new();
        scope.insert(1, Value::Nil);
        assert!(scope.remove(1));
        assert!(!scope.remove(1));
        assert!(scope.get(1).is_none());
    }
}
