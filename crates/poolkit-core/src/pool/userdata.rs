//! String-keyed user data attached to a pool.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::rc::Rc;

/// Value stored under a userdata key.
pub type UserValue = Rc<dyn Any>;

/// Lazily created per-pool table. Dropped, with its values, when the pool
/// is cleared.
#[derive(Default)]
pub(crate) struct UserdataTable {
    entries: HashMap<Cow<'static, str>, UserValue>,
}

impl UserdataTable {
    /// Insert under a copied key, replacing any previous value.
    pub(crate) fn set(&mut self, key: &str, value: UserValue) -> Option<UserValue> {
        self.entries.insert(Cow::Owned(key.to_owned()), value)
    }

    /// Insert under a borrowed key that outlives the pool.
    pub(crate) fn setn(&mut self, key: &'static str, value: UserValue) -> Option<UserValue> {
        self.entries.insert(Cow::Borrowed(key), value)
    }

    pub(crate) fn get(&self, key: &str) -> Option<UserValue> {
        self.entries.get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(AsRef::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut table = UserdataTable::default();
        let key = String::from("answer");
        table.set(&key, Rc::new(42_u32));
        drop(key);
        let value = table.get("answer").unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn setn_borrows_static_key() {
        let mut table = UserdataTable::default();
        table.setn("static", Rc::new("v"));
        assert!(table.get("static").is_some());
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["static"]);
    }

    #[test]
    fn replace_returns_previous() {
        let mut table = UserdataTable::default();
        assert!(table.set("k", Rc::new(1_i32)).is_none());
        let old = table.set("k", Rc::new(2_i32)).unwrap();
        assert_eq!(old.downcast_ref::<i32>(), Some(&1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn missing_key() {
        let table = UserdataTable::default();
        assert!(table.get("nope").is_none());
    }
}
