use crate::error::{Error, Result};
use crate::query::optimizer::normalization_rules::all_normalization_rules;
use crate::query::parser::parse_conditions;
use crate::query::{format_path, parse_field_path, Expr, PathComponent};
use crate::util::collation::Collation;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Maximum number of fields in a key pattern.
const MAX_KEY_FIELDS: usize = 32;

/// The `Catalog` maintains the mapping from collection names to their metadata.
///
/// It is immutable: every change produces a new `Catalog` sharing the untouched
/// collections with the previous one. Readers hold an `Arc` on the version they
/// started with and never observe a partially applied change.
#[derive(Debug, PartialEq)]
pub struct Catalog {
    /// The next collection id (the first 10 are reserved for internal collections)
    pub next_collection_id: u32,
    /// Mapping from collection name to its metadata.
    pub collections: BTreeMap<String, Arc<CollectionMetadata>>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            next_collection_id: 10,
            collections: BTreeMap::new(),
        }
    }

    pub fn get_collection(&self, name: &str) -> Option<Arc<CollectionMetadata>> {
        self.collections.get(name).cloned()
    }

    pub fn add_collection(&self, name: &str) -> Self {
        let id = self.next_collection_id;
        let mut collections = self.collections.clone();
        collections.insert(name.to_string(), Arc::new(CollectionMetadata::new(id, name)));
        Catalog {
            next_collection_id: id + 1,
            collections,
        }
    }

    pub fn drop_collection(&self, name: &str) -> Self {
        let mut collections = self.collections.clone();
        collections.remove(name);
        Catalog {
            next_collection_id: self.next_collection_id,
            collections,
        }
    }

    /// Replaces the metadata of an existing collection.
    pub fn replace_collection(&self, collection: CollectionMetadata) -> Self {
        let mut collections = self.collections.clone();
        collections.insert(collection.name.clone(), Arc::new(collection));
        Catalog {
            next_collection_id: self.next_collection_id,
            collections,
        }
    }
}

/// Describes a collection's metadata, including its ID, name, and declared indexes.
///
/// `version` changes on every metadata change. `plan_epoch` only changes when a
/// change can make a new plan possible (index creation, index made visible,
/// a field becoming multikey): cached plans built under an older epoch are
/// stale. Changes that only remove options (drop, hide) are handled by
/// removing the plans that use the index.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMetadata {
    /// Globally unique collection identifier.
    pub id: u32,
    /// Collection name.
    pub name: String,
    /// The id of the next index
    pub next_index_id: u32,
    pub version: u64,
    pub plan_epoch: u64,
    /// Mapping from index name to its metadata.
    pub indexes: BTreeMap<String, Arc<IndexMetadata>>,
}

impl CollectionMetadata {
    pub fn new(id: u32, name: &str) -> Self {
        CollectionMetadata {
            id,
            name: name.to_string(),
            next_index_id: 1,
            version: 0,
            plan_epoch: 0,
            indexes: BTreeMap::new(),
        }
    }

    pub fn index(&self, name: &str) -> Option<Arc<IndexMetadata>> {
        self.indexes.get(name).cloned()
    }

    /// Resolves an index reference, failing if the index was dropped or
    /// dropped and recreated under the same name.
    pub fn resolve(&self, index_ref: &IndexRef) -> Option<Arc<IndexMetadata>> {
        self.indexes
            .get(&index_ref.name)
            .filter(|index| index.id == index_ref.id)
            .cloned()
    }

    /// Indexes the planner may choose, in name order.
    pub fn visible_indexes(&self) -> impl Iterator<Item = &Arc<IndexMetadata>> {
        self.indexes.values().filter(|index| !index.hidden)
    }

    pub fn add_index(&self, mut index: IndexMetadata) -> CollectionMetadata {
        index.id = self.next_index_id;
        let mut indexes = self.indexes.clone();
        indexes.insert(index.name.to_string(), Arc::new(index));
        CollectionMetadata {
            id: self.id,
            name: self.name.clone(),
            next_index_id: self.next_index_id + 1,
            version: self.version + 1,
            plan_epoch: self.plan_epoch + 1,
            indexes,
        }
    }

    pub fn drop_index(&self, name: &str) -> CollectionMetadata {
        let mut indexes = self.indexes.clone();
        indexes.remove(name);
        CollectionMetadata {
            id: self.id,
            name: self.name.clone(),
            next_index_id: self.next_index_id,
            version: self.version + 1,
            plan_epoch: self.plan_epoch,
            indexes,
        }
    }

    /// Replaces an index by a modified version of itself.
    pub fn replace_index(&self, index: IndexMetadata, new_epoch: bool) -> CollectionMetadata {
        let mut indexes = self.indexes.clone();
        indexes.insert(index.name.to_string(), Arc::new(index));
        CollectionMetadata {
            id: self.id,
            name: self.name.clone(),
            next_index_id: self.next_index_id,
            version: self.version + 1,
            plan_epoch: self.plan_epoch + new_epoch as u64,
            indexes,
        }
    }
}

/// Stable reference to an index: a dropped and recreated index gets a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexRef {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Ascending,
    Descending,
    Hashed,
}

/// One field of a key pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyField {
    pub path: Vec<PathComponent>,
    /// Dotted path as written in the key pattern.
    pub name: String,
    pub kind: KeyKind,
}

impl KeyField {
    pub fn is_descending(&self) -> bool {
        self.kind == KeyKind::Descending
    }
}

/// Scope of a wildcard (`$**`) index.
#[derive(Debug, Clone, PartialEq)]
pub struct WildcardSpec {
    /// Sub-tree covered by `a.$**`, empty for `$**`.
    pub root: Vec<String>,
    /// Paths listed in `wildcardProjection`, with their inclusion flag.
    pub projection: Option<(BTreeSet<String>, bool)>,
}

impl WildcardSpec {
    /// Returns `true` if values found at `path` belong to the index.
    pub fn covers(&self, path: &str) -> bool {
        let components: Vec<&str> = path.split('.').collect();
        if components.len() < self.root.len()
            || components.iter().zip(self.root.iter()).any(|(c, r)| c != r)
        {
            return false;
        }
        match &self.projection {
            None => components[0] != "_id",
            Some((paths, include)) => {
                let listed = paths
                    .iter()
                    .any(|p| path == p || path.starts_with(&format!("{}.", p)));
                if *include {
                    listed
                } else {
                    !listed && components[0] != "_id"
                }
            }
        }
    }
}

/// Options accepted when creating an index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_filter_expression: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard_projection: Option<Document>,
}

impl IndexOptions {
    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(bson::from_document(doc.clone())?)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_partial_filter(mut self, filter: Document) -> Self {
        self.partial_filter_expression = Some(filter);
        self
    }

    pub fn with_collation(mut self, collation: Document) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn with_wildcard_projection(mut self, projection: Document) -> Self {
        self.wildcard_projection = Some(projection);
        self
    }
}

/// Describes a single index within a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMetadata {
    /// Unique identifier for the index.
    pub id: u32,
    /// Name of the index (e.g., "a_1_b_-1").
    pub name: String,
    pub key_pattern: Document,
    pub fields: Vec<KeyField>,
    pub wildcard: Option<WildcardSpec>,
    pub unique: bool,
    pub sparse: bool,
    pub hidden: bool,
    /// Normalized partial filter.
    pub partial_filter: Option<Arc<Expr>>,
    pub partial_filter_doc: Option<Document>,
    pub collation: Collation,
    /// Multikey flag of every key field.
    pub multikey: Vec<bool>,
    /// Multikey paths of a wildcard index.
    pub multikey_paths: BTreeSet<String>,
}

impl IndexMetadata {
    /// Validates a key pattern and its options.
    pub fn new(key_pattern: &Document, options: &IndexOptions) -> Result<IndexMetadata> {
        let (fields, wildcard) = parse_key_pattern(key_pattern, options)?;

        let hashed = fields.iter().filter(|f| f.kind == KeyKind::Hashed).count();
        if hashed > 1 {
            return Err(Error::InvalidRequest("A key pattern can only contain one hashed field".to_string()));
        }
        if hashed == 1 && options.unique {
            return Err(Error::InvalidRequest("A hashed index cannot be unique".to_string()));
        }
        if wildcard.is_some() && options.unique {
            return Err(Error::InvalidRequest("A wildcard index cannot be unique".to_string()));
        }

        let (partial_filter, partial_filter_doc) = match &options.partial_filter_expression {
            Some(doc) => {
                let filter = all_normalization_rules()
                    .iter()
                    .fold(parse_conditions(doc)?, |expr, rule| rule.apply(expr));
                (Some(filter), Some(doc.clone()))
            }
            None => (None, None),
        };

        let collation = match &options.collation {
            Some(doc) => Collation::from_document(doc)?,
            None => Collation::simple(),
        };

        let name = match &options.name {
            Some(name) if name.is_empty() => {
                return Err(Error::InvalidRequest("Index name cannot be empty".to_string()))
            }
            Some(name) => name.clone(),
            None => default_index_name(key_pattern),
        };

        Ok(IndexMetadata {
            id: 0,
            name,
            key_pattern: key_pattern.clone(),
            multikey: vec![false; fields.len()],
            fields,
            wildcard,
            unique: options.unique,
            sparse: options.sparse,
            hidden: options.hidden,
            partial_filter,
            partial_filter_doc,
            collation,
            multikey_paths: BTreeSet::new(),
        })
    }

    pub fn index_ref(&self) -> IndexRef {
        IndexRef {
            name: self.name.clone(),
            id: self.id,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    pub fn is_hashed(&self) -> bool {
        self.fields.iter().any(|f| f.kind == KeyKind::Hashed)
    }

    pub fn is_multikey(&self) -> bool {
        self.multikey.iter().any(|m| *m) || !self.multikey_paths.is_empty()
    }

    /// Returns `true` if a wildcard index saw an array on `path` or one of its prefixes.
    pub fn is_multikey_path(&self, path: &str) -> bool {
        let mut prefix = String::new();
        for component in path.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(component);
            if self.multikey_paths.contains(&prefix) {
                return true;
            }
        }
        false
    }

    /// Position of the key field indexing `path`.
    pub fn position_of(&self, path: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == path)
    }

    /// Returns `true` if the index has the same definition as `other`, ignoring
    /// state that changes over time.
    pub fn same_definition(&self, other: &IndexMetadata) -> bool {
        self.key_pattern == other.key_pattern
            && self.unique == other.unique
            && self.sparse == other.sparse
            && self.partial_filter_doc == other.partial_filter_doc
            && self.collation == other.collation
            && self.wildcard == other.wildcard
    }

    /// Document describing the index, as returned by `list_indexes`.
    pub fn describe(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("v", 2);
        doc.insert("key", self.key_pattern.clone());
        doc.insert("name", self.name.clone());
        if self.unique {
            doc.insert("unique", true);
        }
        if self.sparse {
            doc.insert("sparse", true);
        }
        if self.hidden {
            doc.insert("hidden", true);
        }
        if let Some(filter) = &self.partial_filter_doc {
            doc.insert("partialFilterExpression", filter.clone());
        }
        if !self.collation.is_simple() {
            doc.insert("collation", self.collation.to_document());
        }
        if let Some(WildcardSpec { projection: Some((paths, include)), .. }) = &self.wildcard {
            let mut projection = Document::new();
            for path in paths {
                projection.insert(path.clone(), if *include { 1 } else { 0 });
            }
            doc.insert("wildcardProjection", projection);
        }
        doc
    }

    /// Multikey paths reported by explain, keyed by key field name.
    pub fn multikey_paths_document(&self) -> Document {
        let mut doc = Document::new();
        for (field, multikey) in self.fields.iter().zip(self.multikey.iter()) {
            let paths: Vec<Bson> = if *multikey { vec![Bson::String(field.name.clone())] } else { vec![] };
            doc.insert(field.name.clone(), paths);
        }
        doc
    }

    pub fn with_hidden(&self, hidden: bool) -> IndexMetadata {
        IndexMetadata { hidden, ..self.clone() }
    }

    pub fn with_unique(&self) -> IndexMetadata {
        IndexMetadata { unique: true, ..self.clone() }
    }

    /// Returns a copy with the given fields and wildcard paths flagged multikey.
    pub fn with_multikey(&self, fields: &[bool], paths: &BTreeSet<String>) -> IndexMetadata {
        let multikey = self
            .multikey
            .iter()
            .zip(fields.iter().chain(std::iter::repeat(&false)))
            .map(|(a, b)| *a || *b)
            .collect();
        let multikey_paths = self.multikey_paths.union(paths).cloned().collect();
        IndexMetadata {
            multikey,
            multikey_paths,
            ..self.clone()
        }
    }
}

fn parse_key_pattern(key_pattern: &Document, options: &IndexOptions) -> Result<(Vec<KeyField>, Option<WildcardSpec>)> {
    if key_pattern.is_empty() {
        return Err(Error::InvalidRequest("Index key pattern cannot be empty".to_string()));
    }
    if key_pattern.len() > MAX_KEY_FIELDS {
        return Err(Error::InvalidRequest(format!(
            "Index key pattern cannot have more than {} fields",
            MAX_KEY_FIELDS
        )));
    }

    let mut fields = Vec::with_capacity(key_pattern.len());
    let mut wildcard = None;

    for (name, value) in key_pattern {
        if name == "$**" || name.ends_with(".$**") {
            if key_pattern.len() != 1 {
                return Err(Error::InvalidRequest("A wildcard index cannot be compound".to_string()));
            }
            if !is_ascending(value) {
                return Err(Error::InvalidRequest(format!("Invalid wildcard key value: {}", value)));
            }
            let root: Vec<String> = name
                .trim_end_matches("$**")
                .trim_end_matches('.')
                .split('.')
                .filter(|c| !c.is_empty())
                .map(|c| c.to_string())
                .collect();
            let projection = match &options.wildcard_projection {
                Some(_) if !root.is_empty() => {
                    return Err(Error::InvalidRequest(
                        "wildcardProjection is only allowed on a '$**' index".to_string(),
                    ));
                }
                Some(doc) => Some(parse_wildcard_projection(doc)?),
                None => None,
            };
            wildcard = Some(WildcardSpec { root, projection });
            fields.push(KeyField {
                path: vec!["$_path".into()],
                name: "$_path".to_string(),
                kind: KeyKind::Ascending,
            });
            fields.push(KeyField {
                path: vec![],
                name: name.clone(),
                kind: KeyKind::Ascending,
            });
            continue;
        }

        let kind = match value {
            Bson::String(s) if s == "hashed" => KeyKind::Hashed,
            v if is_ascending(v) => KeyKind::Ascending,
            v if is_descending(v) => KeyKind::Descending,
            other => {
                return Err(Error::InvalidRequest(format!(
                    "Invalid key value for field '{}': {}",
                    name, other
                )))
            }
        };
        fields.push(KeyField {
            path: parse_field_path(name)?,
            name: format_path(&parse_field_path(name)?),
            kind,
        });
    }

    if wildcard.is_none() && options.wildcard_projection.is_some() {
        return Err(Error::InvalidRequest(
            "wildcardProjection is only allowed on a wildcard index".to_string(),
        ));
    }

    Ok((fields, wildcard))
}

fn parse_wildcard_projection(doc: &Document) -> Result<(BTreeSet<String>, bool)> {
    let mut paths = BTreeSet::new();
    let mut include = None;
    for (path, value) in doc {
        let flag = match value {
            Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => true,
            Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => false,
            other => {
                return Err(Error::InvalidRequest(format!(
                    "Invalid wildcardProjection value for '{}': {}",
                    path, other
                )))
            }
        };
        if include.is_some_and(|i| i != flag) {
            return Err(Error::InvalidRequest(
                "wildcardProjection cannot mix inclusion and exclusion".to_string(),
            ));
        }
        include = Some(flag);
        paths.insert(format_path(&parse_field_path(path)?));
    }
    match include {
        Some(include) => Ok((paths, include)),
        None => Err(Error::InvalidRequest("wildcardProjection cannot be empty".to_string())),
    }
}

fn is_ascending(value: &Bson) -> bool {
    matches!(value, Bson::Int32(1) | Bson::Int64(1)) || matches!(value, Bson::Double(d) if *d == 1.0)
}

fn is_descending(value: &Bson) -> bool {
    matches!(value, Bson::Int32(-1) | Bson::Int64(-1)) || matches!(value, Bson::Double(d) if *d == -1.0)
}

/// Builds the default name of an index: `{ a: 1, b: -1 }` is named `a_1_b_-1`.
pub fn default_index_name(key_pattern: &Document) -> String {
    key_pattern
        .iter()
        .map(|(field, value)| {
            let value = match value {
                Bson::String(s) => s.clone(),
                Bson::Double(d) => format!("{}", *d as i64),
                other => other.to_string(),
            };
            format!("{}_{}", field, value)
        })
        .collect::<Vec<_>>()
        .join("_")
}
