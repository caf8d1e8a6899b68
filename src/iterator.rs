//! Cursor over the items of one store.

use std::collections::VecDeque;

use log::debug;

use crate::{DpsError, Result};

/// What an adapter provides so a [`StoreIterator`] can walk one of its stores.
pub trait ItemSource {
    /// Whether the store still exists.
    fn store_exists(&mut self, store: u64) -> Result<bool>;

    /// Encoded keys of a store, reserved metadata excluded.
    fn list_keys(&mut self, store: u64) -> Result<Vec<String>>;

    /// Value behind an encoded key, `None` if it has vanished meanwhile.
    fn read_item(&mut self, store: u64, encoded_key: &str) -> Result<Option<Vec<u8>>>;

    /// Turn an encoded key back into the caller's bytes.
    fn decode_key(&self, encoded_key: &str) -> Result<Vec<u8>>;
}

/// Store-scoped cursor. Keys are fetched once, on the first call to `next_item`.
#[derive(Debug)]
pub struct StoreIterator {
    store: u64,
    keys: Option<VecDeque<String>>,
    position: usize,
    exhausted: bool,
}

impl StoreIterator {
    pub(crate) fn new(store: u64) -> Self {
        StoreIterator {
            store,
            keys: None,
            position: 0,
            exhausted: false,
        }
    }

    /// The store this iterator is bound to.
    pub fn store_id(&self) -> u64 {
        self.store
    }

    /// Items handed out so far.
    pub fn position(&self) -> usize {
        self.position
    }

    #[allow(missing_docs)]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn check_store(&self, store: u64) -> Result<()> {
        if store != self.store {
            return Err(DpsError::StoreIteration(format!(
                "iterator belongs to store {} but was used with store {}",
                self.store, store
            )));
        }
        Ok(())
    }

    /// Next decoded key/value pair of `store`, `None` once exhausted.
    pub(crate) fn next_item<S: ItemSource + ?Sized>(
        &mut self,
        store: u64,
        source: &mut S,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check_store(store)?;
        if self.exhausted {
            return Ok(None);
        }

        if self.keys.is_none() {
            let listed = source.store_exists(store).and_then(|exists| {
                if exists {
                    source.list_keys(store)
                } else {
                    Err(DpsError::InvalidStoreId(store.to_string()))
                }
            });
            let keys = match listed {
                Ok(keys) => keys,
                Err(e) => return self.fail(e),
            };
            debug!("iterator over store {} fetched {} keys", store, keys.len());
            self.keys = Some(keys.into());
        }

        while let Some(key) = self.keys.as_mut().and_then(VecDeque::pop_front) {
            let value = match source.read_item(store, &key) {
                Ok(value) => value,
                Err(e) => return self.fail(e),
            };
            match value {
                Some(value) => {
                    let key = match source.decode_key(&key) {
                        Ok(key) => key,
                        Err(e) => return self.fail(e),
                    };
                    self.position += 1;
                    return Ok(Some((key, value)));
                }
                // Removed between the key fetch and now.
                None => match source.store_exists(store) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => return self.fail(e),
                },
            }
        }

        self.exhausted = true;
        self.keys = None;
        Ok(None)
    }

    fn fail<T>(&mut self, error: DpsError) -> Result<T> {
        self.exhausted = true;
        self.keys = None;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MapSource {
        items: BTreeMap<String, Vec<u8>>,
        vanish_after_listing: Option<String>,
    }

    impl ItemSource for MapSource {
        fn store_exists(&mut self, store: u64) -> Result<bool> {
            Ok(store == 1)
        }

        fn list_keys(&mut self, _store: u64) -> Result<Vec<String>> {
            let keys = self.items.keys().cloned().collect();
            if let Some(gone) = self.vanish_after_listing.take() {
                self.items.remove(&gone);
            }
            Ok(keys)
        }

        fn read_item(&mut self, _store: u64, encoded_key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.items.get(encoded_key).cloned())
        }

        fn decode_key(&self, encoded_key: &str) -> Result<Vec<u8>> {
            if encoded_key.contains('!') {
                return Err(DpsError::Protocol(format!("cannot decode '{encoded_key}'")));
            }
            Ok(encoded_key.as_bytes().to_vec())
        }
    }

    fn source(keys: &[&str]) -> MapSource {
        MapSource {
            items: keys.iter().map(|k| (k.to_string(), k.to_uppercase().into_bytes())).collect(),
            vanish_after_listing: None,
        }
    }

    #[test]
    fn yields_every_item_once() {
        let mut src = source(&["a", "b", "c"]);
        let mut it = StoreIterator::new(1);
        let mut seen = Vec::new();
        while let Some((k, v)) = it.next_item(1, &mut src).unwrap() {
            assert_eq!(v, k.to_ascii_uppercase());
            seen.push(k);
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(it.is_exhausted());
        assert_eq!(it.position(), 3);
        assert!(it.next_item(1, &mut src).unwrap().is_none());
    }

    #[test]
    fn empty_store_yields_nothing() {
        let mut src = source(&[]);
        let mut it = StoreIterator::new(1);
        assert!(it.next_item(1, &mut src).unwrap().is_none());
    }

    #[test]
    fn wrong_store_is_an_error() {
        let mut src = source(&["a"]);
        let mut it = StoreIterator::new(1);
        let err = it.next_item(2, &mut src).unwrap_err();
        assert!(matches!(err, DpsError::StoreIteration(_)));
        assert_eq!(it.position(), 0);
    }

    #[test]
    fn items_removed_mid_iteration_are_skipped() {
        let mut src = source(&["a", "b", "c"]);
        src.vanish_after_listing = Some("b".to_string());
        let mut it = StoreIterator::new(1);
        let mut count = 0;
        while it.next_item(1, &mut src).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn missing_store_exhausts_the_iterator() {
        let mut src = source(&["a"]);
        let mut it = StoreIterator::new(9);
        assert!(matches!(
            it.next_item(9, &mut src).unwrap_err(),
            DpsError::InvalidStoreId(_)
        ));
        assert!(it.is_exhausted());
    }

    #[test]
    fn undecodable_key_exhausts_the_iterator() {
        let mut src = source(&["a!", "b"]);
        let mut it = StoreIterator::new(1);
        assert!(matches!(it.next_item(1, &mut src), Err(DpsError::Protocol(_))));
        assert!(it.is_exhausted());
        assert!(it.next_item(1, &mut src).unwrap().is_none());
        assert_eq!(it.position(), 0);
    }
}
