use crate::error::{Error, Result};
use crate::obs::logger::LoggerAndTracer;
use crate::query::BsonValue;
use crate::storage::catalog::{Catalog, CollectionMetadata, IndexMetadata, IndexOptions, IndexRef};
use crate::storage::index_keys::{generate_keys, IndexKeys};
use crate::storage::index_table::{IndexTable, RecordId};
use crate::storage::record_store::RecordStore;
use crate::util::bson_utils::bson_eq;
use crate::{event, info};
use arc_swap::ArcSwap;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Data of one collection: its records, the `_id` lookup map and one table per index.
pub struct CollectionStore {
    pub id: u32,
    pub name: String,
    pub records: RecordStore,
    ids: SkipMap<BsonValue, RecordId>,
    index_tables: SkipMap<u32, Arc<IndexTable>>,
    write_lock: Mutex<()>,
}

impl CollectionStore {
    fn new(id: u32, name: &str) -> Self {
        CollectionStore {
            id,
            name: name.to_string(),
            records: RecordStore::new(),
            ids: SkipMap::new(),
            index_tables: SkipMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the table of the referenced index, unless the index was dropped.
    pub fn index_table(&self, index_ref: &IndexRef) -> Option<Arc<IndexTable>> {
        self.index_tables
            .get(&index_ref.id)
            .map(|e| e.value().clone())
            .filter(|table| &table.index_ref == index_ref)
    }

    pub fn record_id_of(&self, id: &Bson) -> Option<RecordId> {
        self.ids.get(&BsonValue(id.clone())).map(|e| *e.value())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory storage: a copy-on-write catalog plus the data of every collection.
///
/// Writers of a collection are serialized by the collection write lock.
/// Catalog changes are serialized by `catalog_lock`, always taken after the
/// collection write lock.
pub struct StorageEngine {
    logger: Arc<dyn LoggerAndTracer>,
    catalog: ArcSwap<Catalog>,
    catalog_lock: Mutex<()>,
    collections: SkipMap<u32, Arc<CollectionStore>>,
    next_version: AtomicU64,
}

impl StorageEngine {
    pub fn new(logger: Arc<dyn LoggerAndTracer>) -> Arc<Self> {
        Arc::new(StorageEngine {
            logger,
            catalog: ArcSwap::from_pointee(Catalog::new()),
            catalog_lock: Mutex::new(()),
            collections: SkipMap::new(),
            next_version: AtomicU64::new(1),
        })
    }

    pub fn get_collection(&self, name: &str) -> Option<Arc<CollectionMetadata>> {
        self.catalog.load().get_collection(name)
    }

    pub fn collection_store(&self, id: u32) -> Option<Arc<CollectionStore>> {
        self.collections.get(&id).map(|e| e.value().clone())
    }

    fn lock_catalog(&self) -> MutexGuard<'_, ()> {
        self.catalog_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_collection_if_not_exists(&self, name: &str) -> Result<Arc<CollectionMetadata>> {
        if let Some(collection) = self.get_collection(name) {
            return Ok(collection);
        }
        let _guard = self.lock_catalog();

        // The collection might have been created concurrently
        let catalog = self.catalog.load_full();
        if let Some(collection) = catalog.get_collection(name) {
            return Ok(collection);
        }
        let catalog = catalog.add_collection(name);
        let collection = catalog
            .get_collection(name)
            .ok_or_else(|| Error::UnexpectedError(format!("Collection {} not created", name)))?;
        self.collections
            .insert(collection.id, Arc::new(CollectionStore::new(collection.id, name)));
        self.catalog.store(Arc::new(catalog));
        info!(self.logger, "Collection {} created with id {}", name, collection.id);
        Ok(collection)
    }

    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let _guard = self.lock_catalog();
        let catalog = self.catalog.load_full();
        let collection = match catalog.get_collection(name) {
            Some(collection) => collection,
            None => return Ok(false),
        };
        self.catalog.store(Arc::new(catalog.drop_collection(name)));
        self.collections.remove(&collection.id);
        info!(self.logger, "Collection {} dropped", name);
        Ok(true)
    }

    fn store_for(&self, name: &str) -> Result<(Arc<CollectionMetadata>, Arc<CollectionStore>)> {
        let metadata = self
            .get_collection(name)
            .ok_or_else(|| Error::CollectionNotFound { name: name.to_string() })?;
        let store = self
            .collection_store(metadata.id)
            .ok_or_else(|| Error::CollectionNotFound { name: name.to_string() })?;
        Ok((metadata, store))
    }

    /// Inserts a document, adding an `_id` if it has none, and returns its record id.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<(RecordId, Bson)> {
        self.create_collection_if_not_exists(collection)?;
        let (_, store) = self.store_for(collection)?;
        let _guard = store.lock();

        let doc = with_id(doc);
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        if store.record_id_of(&id).is_some() {
            return Err(duplicate_key("_id_", &[("_id", &id)]));
        }

        let metadata = self.metadata_of(&store)?;
        let keys = keys_of(&metadata, &doc)?;
        check_unique(&store, &keys, None)?;

        let record_id = store.records.next_record_id();
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        store.records.put(record_id, version, Arc::new(doc));
        store.ids.insert(BsonValue(id.clone()), record_id);
        self.add_keys(&store, &keys, record_id, version)?;

        event!(self.logger, "event: insert, collection={}, record_id={}, version={}", collection, record_id, version);
        Ok((record_id, id))
    }

    /// Replaces the document of a record. The `_id` cannot change.
    pub fn replace(&self, collection: &str, record_id: RecordId, doc: Document) -> Result<()> {
        let (_, store) = self.store_for(collection)?;
        let _guard = store.lock();

        let old = store
            .records
            .get(record_id)
            .ok_or_else(|| Error::WriteConflict(format!("Record {} was deleted concurrently", record_id)))?;
        let old_id = old.doc.get("_id").cloned().unwrap_or(Bson::Null);
        let mut new_doc = Document::new();
        match doc.get("_id") {
            Some(id) if !bson_eq(id, &old_id) => {
                return Err(Error::InvalidRequest(
                    "The _id field cannot be changed by a replacement".to_string(),
                ))
            }
            _ => {
                new_doc.insert("_id", old_id.clone());
            }
        }
        for (name, value) in doc {
            if name != "_id" {
                new_doc.insert(name, value);
            }
        }

        let metadata = self.metadata_of(&store)?;
        let old_keys = keys_of(&metadata, &old.doc)?;
        let new_keys = keys_of(&metadata, &new_doc)?;
        check_unique(&store, &new_keys, Some(record_id))?;

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        remove_keys(&store, &old_keys, record_id);
        store.records.put(record_id, version, Arc::new(new_doc));
        self.add_keys(&store, &new_keys, record_id, version)?;
        event!(self.logger, "event: replace, collection={}, record_id={}, version={}", collection, record_id, version);
        Ok(())
    }

    pub fn delete(&self, collection: &str, record_id: RecordId) -> Result<bool> {
        let (_, store) = self.store_for(collection)?;
        let _guard = store.lock();

        let record = match store.records.get(record_id) {
            Some(record) => record,
            None => return Ok(false),
        };
        let metadata = self.metadata_of(&store)?;
        let keys = keys_of(&metadata, &record.doc)?;
        remove_keys(&store, &keys, record_id);
        store.records.remove(record_id);
        if let Some(id) = record.doc.get("_id") {
            store.ids.remove(&BsonValue(id.clone()));
        }
        event!(self.logger, "event: delete, collection={}, record_id={}", collection, record_id);
        Ok(true)
    }

    /// Builds a new index over the existing documents, then publishes it in the catalog.
    ///
    /// Creating an index identical to an existing one is a no-op. Creating a
    /// different index under an existing name fails.
    pub fn create_index(
        &self,
        collection: &str,
        key_pattern: &Document,
        options: &IndexOptions,
    ) -> Result<(Arc<IndexMetadata>, bool)> {
        let index = IndexMetadata::new(key_pattern, options)?;
        self.create_collection_if_not_exists(collection)?;
        let (_, store) = self.store_for(collection)?;
        let _guard = store.lock();

        let metadata = self.metadata_of(&store)?;
        if let Some(existing) = metadata.index(&index.name) {
            if existing.same_definition(&index) {
                return Ok((existing, false));
            }
            return Err(Error::IndexAlreadyExists {
                collection_name: collection.to_string(),
                index_name: index.name.clone(),
            });
        }
        if let Some(existing) = metadata.indexes.values().find(|i| i.same_definition(&index)) {
            return Err(Error::IndexAlreadyExists {
                collection_name: collection.to_string(),
                index_name: existing.name.clone(),
            });
        }

        let mut index = IndexMetadata { id: metadata.next_index_id, ..index };
        let table = IndexTable::new(&index);
        let mut record_id = None;
        while let Some((id, record)) = store.records.next_after(record_id, true) {
            let keys = generate_keys(&index, &record.doc)?;
            for key in &keys.keys {
                if index.unique && table.has_other_record(key, Some(id)) {
                    return Err(duplicate_key(&index.name, &named_key(&index, key)));
                }
                table.insert(key.clone(), id, record.version);
            }
            if keys.flips_multikey(&index) {
                index = index.with_multikey(&keys.multikey, &keys.multikey_paths);
            }
            record_id = Some(id);
        }
        let entries = table.len();
        store.index_tables.insert(index.id, Arc::new(table));

        let _catalog_guard = self.lock_catalog();
        let catalog = self.catalog.load_full();
        let current = self.current_metadata(&catalog, &store)?;
        let updated = current.add_index(index.clone());
        let created = updated
            .index(&index.name)
            .ok_or_else(|| Error::UnexpectedError(format!("Index {} not created", index.name)))?;
        self.catalog.store(Arc::new(catalog.replace_collection(updated)));
        info!(
            self.logger,
            "Index {} created on {} with {} entries",
            created.name,
            collection,
            entries
        );
        Ok((created, true))
    }

    pub fn drop_index(&self, collection: &str, name: &str) -> Result<Arc<IndexMetadata>> {
        let (_, store) = self.store_for(collection)?;
        let _guard = store.lock();
        let _catalog_guard = self.lock_catalog();

        let catalog = self.catalog.load_full();
        let metadata = self.current_metadata(&catalog, &store)?;
        let index = metadata.index(name).ok_or_else(|| Error::IndexNotFound {
            collection_name: collection.to_string(),
            index_name: name.to_string(),
        })?;
        self.catalog
            .store(Arc::new(catalog.replace_collection(metadata.drop_index(name))));
        store.index_tables.remove(&index.id);
        info!(self.logger, "Index {} dropped from {}", name, collection);
        Ok(index)
    }

    /// Hides or unhides an index. Returns the previous state of the index.
    pub fn set_index_hidden(&self, collection: &str, name: &str, hidden: bool) -> Result<Arc<IndexMetadata>> {
        self.modify_index(collection, name, |index| {
            // Unhiding makes new plans possible
            Ok((index.with_hidden(hidden), index.hidden && !hidden))
        })
    }

    /// Makes an index unique, failing if it already holds duplicate keys.
    pub fn convert_to_unique(&self, collection: &str, name: &str) -> Result<Arc<IndexMetadata>> {
        let (_, store) = self.store_for(collection)?;
        self.modify_index(collection, name, |index| {
            if index.is_hashed() || index.is_wildcard() {
                return Err(Error::InvalidRequest(format!("Index {} cannot be made unique", index.name)));
            }
            if let Some(table) = store.index_table(&index.index_ref()) {
                if let Some(key) = table.find_duplicate() {
                    return Err(duplicate_key(&index.name, &named_key(index, &key)));
                }
            }
            Ok((index.with_unique(), false))
        })
    }

    fn modify_index<F>(&self, collection: &str, name: &str, modify: F) -> Result<Arc<IndexMetadata>>
    where
        F: FnOnce(&IndexMetadata) -> Result<(IndexMetadata, bool)>,
    {
        let (_, store) = self.store_for(collection)?;
        let _guard = store.lock();
        let _catalog_guard = self.lock_catalog();

        let catalog = self.catalog.load_full();
        let metadata = self.current_metadata(&catalog, &store)?;
        let index = metadata.index(name).ok_or_else(|| Error::IndexNotFound {
            collection_name: collection.to_string(),
            index_name: name.to_string(),
        })?;
        let (modified, new_epoch) = modify(&index)?;
        if modified == *index {
            return Ok(index);
        }
        self.catalog
            .store(Arc::new(catalog.replace_collection(metadata.replace_index(modified, new_epoch))));
        info!(self.logger, "Index {} of {} modified", name, collection);
        Ok(index)
    }

    fn metadata_of(&self, store: &CollectionStore) -> Result<Arc<CollectionMetadata>> {
        self.current_metadata(&self.catalog.load(), store)
    }

    fn current_metadata(&self, catalog: &Catalog, store: &CollectionStore) -> Result<Arc<CollectionMetadata>> {
        catalog
            .get_collection(&store.name)
            .filter(|c| c.id == store.id)
            .ok_or_else(|| Error::CollectionNotFound { name: store.name.clone() })
    }

    fn add_keys(
        &self,
        store: &CollectionStore,
        keys: &[(Arc<IndexMetadata>, IndexKeys)],
        record_id: RecordId,
        version: u64,
    ) -> Result<()> {
        let mut flipped = Vec::new();
        for (index, index_keys) in keys {
            if let Some(table) = store.index_table(&index.index_ref()) {
                for key in &index_keys.keys {
                    table.insert(key.clone(), record_id, version);
                }
            }
            if index_keys.flips_multikey(index) {
                flipped.push((index, index_keys));
            }
        }
        if flipped.is_empty() {
            return Ok(());
        }

        let _catalog_guard = self.lock_catalog();
        let catalog = self.catalog.load_full();
        let mut metadata = self.current_metadata(&catalog, store)?.as_ref().clone();
        for (index, index_keys) in flipped {
            if let Some(current) = metadata.resolve(&index.index_ref()) {
                let updated = current.with_multikey(&index_keys.multikey, &index_keys.multikey_paths);
                metadata = metadata.replace_index(updated, true);
                event!(self.logger, "event: index became multikey, index={}", index.name);
            }
        }
        self.catalog.store(Arc::new(catalog.replace_collection(metadata)));
        Ok(())
    }
}

fn with_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut with_id = Document::new();
    with_id.insert("_id", ObjectId::new());
    with_id.extend(doc);
    with_id
}

fn keys_of(metadata: &CollectionMetadata, doc: &Document) -> Result<Vec<(Arc<IndexMetadata>, IndexKeys)>> {
    metadata
        .indexes
        .values()
        .map(|index| Ok((index.clone(), generate_keys(index, doc)?)))
        .collect()
}

fn check_unique(
    store: &CollectionStore,
    keys: &[(Arc<IndexMetadata>, IndexKeys)],
    record_id: Option<RecordId>,
) -> Result<()> {
    for (index, index_keys) in keys.iter().filter(|(index, _)| index.unique) {
        if let Some(table) = store.index_table(&index.index_ref()) {
            for key in &index_keys.keys {
                if table.has_other_record(key, record_id) {
                    return Err(duplicate_key(&index.name, &named_key(index, key)));
                }
            }
        }
    }
    Ok(())
}

fn remove_keys(store: &CollectionStore, keys: &[(Arc<IndexMetadata>, IndexKeys)], record_id: RecordId) {
    for (index, index_keys) in keys {
        if let Some(table) = store.index_table(&index.index_ref()) {
            for key in &index_keys.keys {
                table.remove(key.clone(), record_id);
            }
        }
    }
}

fn named_key<'a>(index: &'a IndexMetadata, key: &'a [Bson]) -> Vec<(&'a str, &'a Bson)> {
    index.fields.iter().map(|f| f.name.as_str()).zip(key.iter()).collect()
}

fn duplicate_key(index_name: &str, key: &[(&str, &Bson)]) -> Error {
    let mut doc = Document::new();
    for (name, value) in key {
        doc.insert(name.to_string(), (*value).clone());
    }
    Error::DuplicateKey {
        index_name: index_name.to_string(),
        key: doc.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::logger::test_instance;
    use crate::storage::Direction;
    use crate::storage::index_table::KeyRange;
    use bson::{bson, doc};

    fn scan_all(store: &CollectionStore, index: &IndexMetadata) -> Vec<(Vec<Bson>, RecordId)> {
        let table = store.index_table(&index.index_ref()).unwrap();
        let width = index.fields.len();
        let range = KeyRange {
            start: table.lowest_with_prefix(&[], width),
            end: table.highest_with_prefix(&[], width),
        };
        let mut entries = Vec::new();
        let mut after = None;
        while let Some((entry, _)) = table.next_in_range(&range, after.as_ref(), &Direction::Forward) {
            entries.push((entry.key.clone(), entry.record_id));
            after = Some(entry);
        }
        entries
    }

    #[test]
    fn test_index_is_maintained_by_writes() {
        let engine = StorageEngine::new(test_instance());
        let (first, _) = engine.insert("c", doc! { "_id": 1, "a": 1 }).unwrap();
        let (index, created) = engine.create_index("c", &doc! { "a": 1 }, &IndexOptions::default()).unwrap();
        assert!(created);
        let (second, _) = engine.insert("c", doc! { "_id": 2, "a": 2 }).unwrap();

        let metadata = engine.get_collection("c").unwrap();
        let store = engine.collection_store(metadata.id).unwrap();
        assert_eq!(scan_all(&store, &index), vec![(vec![bson!(1)], first), (vec![bson!(2)], second)]);

        engine.replace("c", first, doc! { "a": 3 }).unwrap();
        assert_eq!(scan_all(&store, &index), vec![(vec![bson!(2)], second), (vec![bson!(3)], first)]);
        assert_eq!(store.records.get(first).unwrap().doc.get("_id"), Some(&bson!(1)));

        engine.delete("c", second).unwrap();
        assert_eq!(scan_all(&store, &index), vec![(vec![bson!(3)], first)]);
        assert!(store.record_id_of(&bson!(2)).is_none());
    }

    #[test]
    fn test_unique_constraints() {
        let engine = StorageEngine::new(test_instance());
        engine.insert("c", doc! { "_id": 1, "a": 1 }).unwrap();
        let err = engine.insert("c", doc! { "_id": 1.0 }).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { ref index_name, .. } if index_name == "_id_"));

        engine
            .create_index("c", &doc! { "a": 1 }, &IndexOptions::default().unique())
            .unwrap();
        assert!(engine.insert("c", doc! { "a": 1 }).is_err());
        assert!(engine.insert("c", doc! { "a": 2 }).is_ok());
    }

    #[test]
    fn test_create_index_conflicts() {
        let engine = StorageEngine::new(test_instance());
        let options = IndexOptions::default();
        engine.create_index("c", &doc! { "a": 1 }, &options).unwrap();
        let (_, created) = engine.create_index("c", &doc! { "a": 1 }, &options).unwrap();
        assert!(!created);
        let err = engine
            .create_index("c", &doc! { "b": 1 }, &IndexOptions::default().with_name("a_1"))
            .unwrap_err();
        assert!(matches!(err, Error::IndexAlreadyExists { .. }));
    }

    #[test]
    fn test_multikey_flip_bumps_the_plan_epoch() {
        let engine = StorageEngine::new(test_instance());
        engine.create_index("c", &doc! { "a": 1 }, &IndexOptions::default()).unwrap();
        let epoch = engine.get_collection("c").unwrap().plan_epoch;
        engine.insert("c", doc! { "a": 1 }).unwrap();
        assert_eq!(engine.get_collection("c").unwrap().plan_epoch, epoch);
        engine.insert("c", doc! { "a": [1, 2] }).unwrap();
        let metadata = engine.get_collection("c").unwrap();
        assert_eq!(metadata.plan_epoch, epoch + 1);
        assert!(metadata.index("a_1").unwrap().multikey[0]);
    }

    #[test]
    fn test_convert_to_unique_detects_duplicates() {
        let engine = StorageEngine::new(test_instance());
        engine.create_index("c", &doc! { "a": 1 }, &IndexOptions::default()).unwrap();
        engine.insert("c", doc! { "a": 1 }).unwrap();
        engine.insert("c", doc! { "a": 1 }).unwrap();
        assert!(engine.convert_to_unique("c", "a_1").is_err());
        assert!(!engine.get_collection("c").unwrap().index("a_1").unwrap().unique);

        engine.create_index("c", &doc! { "b": 1 }, &IndexOptions::default()).unwrap();
        engine.delete("c", 1).unwrap();
        engine.convert_to_unique("c", "b_1").unwrap();
        assert!(engine.get_collection("c").unwrap().index("b_1").unwrap().unique);
    }

    #[test]
    fn test_hidden_index_keeps_its_identity() {
        let engine = StorageEngine::new(test_instance());
        let (index, _) = engine.create_index("c", &doc! { "a": 1 }, &IndexOptions::default()).unwrap();
        engine.set_index_hidden("c", "a_1", true).unwrap();
        let metadata = engine.get_collection("c").unwrap();
        let hidden = metadata.resolve(&index.index_ref()).unwrap();
        assert!(hidden.hidden);
        assert_eq!(metadata.visible_indexes().count(), 0);
    }
}
