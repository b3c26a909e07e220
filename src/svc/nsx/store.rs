//! # Store module
//!
//! This module provide a thread-safe, multi-indexed in-memory mirror of the
//! fabric objects the operator has observed

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

// -----------------------------------------------------------------------------
// Indexer names

pub const BY_NAMESPACE: &str = "by-namespace";
pub const BY_CR_NAME: &str = "by-cr-name";
pub const BY_CR_UID: &str = "by-cr-uid";
pub const BY_ASSOCIATED_RESOURCE: &str = "by-associated-resource";
pub const BY_VPC: &str = "by-vpc";

// -----------------------------------------------------------------------------
// Identified trait

/// objects stored in the cache expose a stable identity, the policy path for
/// realized objects
pub trait Identified {
    fn id(&self) -> &str;
}

// -----------------------------------------------------------------------------
// Store structure

/// an index function must be pure and deterministic, it is evaluated before
/// any lock is taken so a panicking indexer leaves the store untouched
pub type IndexFn<T> = fn(&T) -> Vec<String>;

struct Entry<T> {
    object: Arc<T>,
    index_keys: HashMap<&'static str, Vec<String>>,
}

struct Inner<T> {
    objects: HashMap<String, Entry<T>>,
    indexes: HashMap<&'static str, HashMap<String, BTreeSet<String>>>,
}

pub struct Store<T> {
    indexers: Vec<(&'static str, IndexFn<T>)>,
    inner: RwLock<Inner<T>>,
    synced: AtomicBool,
}

impl<T> Store<T>
where
    T: Identified,
{
    pub fn new(indexers: &[(&'static str, IndexFn<T>)]) -> Self {
        Self {
            indexers: indexers.to_vec(),
            inner: RwLock::new(Inner {
                objects: HashMap::new(),
                indexes: indexers
                    .iter()
                    .map(|(name, _)| (*name, HashMap::new()))
                    .collect(),
            }),
            synced: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.read().objects.get(id).map(|entry| entry.object.to_owned())
    }

    /// insert or replace the object, all affected indexes are updated under
    /// one write lock
    pub fn update(&self, object: T) {
        let id = object.id().to_string();
        let index_keys: HashMap<&'static str, Vec<String>> = self
            .indexers
            .iter()
            .map(|(name, index)| (*name, index(&object)))
            .collect();

        let mut inner = self.write();
        if let Some(previous) = inner.objects.remove(&id) {
            Self::deindex(&mut inner, &id, &previous.index_keys);
        }

        for (name, keys) in &index_keys {
            if let Some(index) = inner.indexes.get_mut(name) {
                for key in keys {
                    index.entry(key.to_owned()).or_default().insert(id.to_owned());
                }
            }
        }

        inner.objects.insert(
            id,
            Entry {
                object: Arc::new(object),
                index_keys,
            },
        );
    }

    /// remove the object from the cache and every index, empty index buckets
    /// are pruned to bound memory under high-cardinality short-lived keys
    pub fn delete(&self, id: &str) {
        let mut inner = self.write();
        if let Some(entry) = inner.objects.remove(id) {
            Self::deindex(&mut inner, id, &entry.index_keys);
        }
    }

    fn deindex(inner: &mut Inner<T>, id: &str, index_keys: &HashMap<&'static str, Vec<String>>) {
        for (name, keys) in index_keys {
            if let Some(index) = inner.indexes.get_mut(name) {
                for key in keys {
                    if let Some(bucket) = index.get_mut(key) {
                        bucket.remove(id);
                        if bucket.is_empty() {
                            index.remove(key);
                        }
                    }
                }
            }
        }
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.read()
            .objects
            .values()
            .map(|entry| entry.object.to_owned())
            .collect()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.read().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().objects.is_empty()
    }

    /// returns the objects matching the given index key
    pub fn by_index(&self, name: &str, key: &str) -> Vec<Arc<T>> {
        self.filter(&[(name, key)])
    }

    /// returns the intersection across the given index queries, a missing
    /// index yields an empty result and the scan quick-exits once the
    /// intersection becomes empty
    pub fn filter(&self, queries: &[(&str, &str)]) -> Vec<Arc<T>> {
        let inner = self.read();
        let mut intersection: Option<BTreeSet<String>> = None;

        for (name, key) in queries {
            let Some(index) = inner.indexes.get(name) else {
                return vec![];
            };

            let bucket = index.get(*key).cloned().unwrap_or_default();
            intersection = Some(match intersection {
                None => bucket,
                Some(acc) => acc.intersection(&bucket).cloned().collect(),
            });

            if intersection.as_ref().is_some_and(BTreeSet::is_empty) {
                return vec![];
            }
        }

        intersection
            .unwrap_or_default()
            .iter()
            .filter_map(|id| inner.objects.get(id).map(|entry| entry.object.to_owned()))
            .collect()
    }

    /// one-shot flag marking first full population
    pub fn done_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct Obj {
        id: String,
        namespace: String,
        kind: String,
    }

    impl Identified for Obj {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn obj(id: &str, namespace: &str, kind: &str) -> Obj {
        Obj {
            id: id.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
        }
    }

    fn store() -> Store<Obj> {
        Store::new(&[
            ("ns", |o: &Obj| vec![o.namespace.to_owned()]),
            ("kind", |o: &Obj| vec![o.kind.to_owned()]),
        ])
    }

    #[test]
    fn filter_should_intersect_indexes() {
        let store = store();
        store.update(obj("1", "a", "X"));
        store.update(obj("2", "a", "Y"));
        store.update(obj("3", "b", "X"));

        let hits = store.filter(&[("ns", "a"), ("kind", "X")]);

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "1");
    }

    #[test]
    fn filter_should_agree_with_single_index_queries() {
        let store = store();
        store.update(obj("1", "a", "X"));
        store.update(obj("2", "a", "Y"));
        store.update(obj("3", "b", "X"));

        let both: Vec<String> = store
            .filter(&[("ns", "a"), ("kind", "X")])
            .iter()
            .map(|o| o.id.to_owned())
            .collect();

        for id in &both {
            assert!(store.by_index("ns", "a").iter().any(|o| &o.id == id));
            assert!(store.by_index("kind", "X").iter().any(|o| &o.id == id));
        }
    }

    #[test]
    fn filter_on_unknown_index_should_be_empty() {
        let store = store();
        store.update(obj("1", "a", "X"));

        assert!(store.filter(&[("nope", "a")]).is_empty());
        assert!(store.filter(&[("ns", "a"), ("nope", "a")]).is_empty());
    }

    #[test]
    fn update_should_replace_and_reindex() {
        let store = store();
        store.update(obj("1", "a", "X"));
        store.update(obj("1", "b", "X"));

        assert!(store.by_index("ns", "a").is_empty());
        assert_eq!(store.by_index("ns", "b").len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_should_prune_empty_buckets() {
        let store = store();
        store.update(obj("1", "a", "X"));
        store.delete("1");

        assert!(store.get("1").is_none());
        assert!(store.by_index("ns", "a").is_empty());
        let inner = store.read();
        assert!(inner.indexes.get("ns").is_some_and(HashMap::is_empty));
    }

    #[test]
    fn last_writer_should_win_for_one_key() {
        let store = Arc::new(store());
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = store.to_owned();
                std::thread::spawn(move || {
                    store.update(obj("1", "a", &format!("K{n}")));
                    store.update(obj(&format!("other-{n}"), "a", "X"));
                })
            })
            .collect();

        for writer in writers {
            writer.join().expect("writer to finish");
        }

        // one object under key "1", fully indexed under exactly one kind
        assert_eq!(store.len(), 9);
        let kind = store.get("1").expect("object to be present").kind.to_owned();
        assert_eq!(store.by_index("kind", &kind).iter().filter(|o| o.id == "1").count(), 1);
    }

    #[test]
    fn synced_should_latch() {
        let store = store();

        assert!(!store.synced());
        store.done_synced();
        assert!(store.synced());
    }
}
