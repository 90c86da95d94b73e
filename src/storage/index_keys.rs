use crate::error::{Error, Result};
use crate::query::execution::filters::to_filter;
use crate::query::{collect_path_values, PathComponent, Parameters};
use crate::storage::catalog::{IndexMetadata, KeyKind, WildcardSpec};
use crate::util::bson_utils::{bson_eq, cmp_bson, hash_key};
use bson::{Bson, Document};
use std::collections::BTreeSet;

/// Keys generated for one document.
#[derive(Debug, Default, PartialEq)]
pub struct IndexKeys {
    /// One value per key field, already transformed by the index collation
    /// and hashing.
    pub keys: Vec<Vec<Bson>>,
    /// Key fields for which the document produced several keys.
    pub multikey: Vec<bool>,
    /// Wildcard paths for which the document contains an array.
    pub multikey_paths: BTreeSet<String>,
}

impl IndexKeys {
    /// Returns `true` if indexing the document flags something new as multikey.
    pub fn flips_multikey(&self, index: &IndexMetadata) -> bool {
        self.multikey
            .iter()
            .zip(index.multikey.iter())
            .any(|(new, old)| *new && !*old)
            || !self.multikey_paths.is_subset(&index.multikey_paths)
    }
}

/// Generates the index keys of `doc`.
///
/// A missing field produces a `null` key, an empty array an `undefined` key.
/// A document excluded by a sparse or partial index produces no key.
pub fn generate_keys(index: &IndexMetadata, doc: &Document) -> Result<IndexKeys> {
    if let Some(filter) = &index.partial_filter {
        if !to_filter(filter, &Parameters::new(), &index.collation)?(doc) {
            return Ok(IndexKeys::default());
        }
    }

    if let Some(spec) = &index.wildcard {
        return Ok(wildcard_keys(index, spec, doc));
    }

    let mut per_field = Vec::with_capacity(index.fields.len());
    let mut multikey = vec![false; index.fields.len()];
    let mut array_prefix: Option<&[PathComponent]> = None;
    let mut all_missing = true;

    for (position, field) in index.fields.iter().enumerate() {
        let path_values = collect_path_values(doc, &field.path);
        all_missing &= path_values.is_missing();

        let mut is_multikey = path_values.through_array;
        let mut values = Vec::new();
        for value in path_values.values {
            match value {
                None => values.push(Bson::Null),
                Some(Bson::Array(elements)) => {
                    is_multikey = true;
                    if elements.is_empty() {
                        values.push(Bson::Undefined);
                    } else {
                        values.extend(elements.iter().cloned());
                    }
                }
                Some(value) => values.push(value.clone()),
            }
        }

        if is_multikey {
            if field.kind == KeyKind::Hashed {
                return Err(Error::InvalidRequest(format!(
                    "Hashed field '{}' cannot index an array",
                    field.name
                )));
            }
            let prefix = &field.path[..first_array_prefix(doc, &field.path)];
            match array_prefix {
                Some(existing) if existing != prefix => {
                    return Err(Error::InvalidRequest(format!(
                        "Cannot index parallel arrays in index '{}'",
                        index.name
                    )))
                }
                _ => array_prefix = Some(prefix),
            }
        }

        let mut values: Vec<Bson> = values
            .iter()
            .map(|v| index.collation.collation_key(v))
            .map(|v| if field.kind == KeyKind::Hashed { Bson::Int64(hash_key(&v)) } else { v })
            .collect();
        values.sort_by(cmp_bson);
        values.dedup_by(|a, b| bson_eq(a, b));

        multikey[position] = is_multikey;
        per_field.push(values);
    }

    if index.sparse && all_missing {
        return Ok(IndexKeys::default());
    }

    Ok(IndexKeys {
        keys: cartesian_product(&per_field),
        multikey,
        multikey_paths: BTreeSet::new(),
    })
}

/// Number of path components before the first array met on the path.
fn first_array_prefix(doc: &Document, path: &[PathComponent]) -> usize {
    let mut current = match path.first().and_then(|first| doc.get(first.to_string())) {
        Some(value) => value,
        None => return path.len(),
    };
    for (depth, component) in path.iter().enumerate().skip(1) {
        current = match current {
            Bson::Array(_) => return depth,
            Bson::Document(doc) => match doc.get(component.to_string()) {
                Some(value) => value,
                None => return path.len(),
            },
            _ => return path.len(),
        };
    }
    path.len()
}

fn cartesian_product(per_field: &[Vec<Bson>]) -> Vec<Vec<Bson>> {
    let mut keys: Vec<Vec<Bson>> = vec![Vec::with_capacity(per_field.len())];
    for values in per_field {
        let mut next = Vec::with_capacity(keys.len() * values.len());
        for key in &keys {
            for value in values {
                let mut key = key.clone();
                key.push(value.clone());
                next.push(key);
            }
        }
        keys = next;
    }
    keys
}

/// A wildcard index stores `(path, value)` for every leaf value of the
/// covered sub-tree. Arrays contribute one key per element.
fn wildcard_keys(index: &IndexMetadata, spec: &WildcardSpec, doc: &Document) -> IndexKeys {
    let mut collector = WildcardCollector {
        spec,
        keys: Vec::new(),
        multikey_paths: BTreeSet::new(),
    };
    for (name, value) in doc {
        collector.visit(name.clone(), value, false);
    }

    let mut keys: Vec<Vec<Bson>> = collector
        .keys
        .into_iter()
        .map(|(path, value)| vec![Bson::String(path), index.collation.collation_key(&value)])
        .collect();
    keys.sort_by(|a, b| cmp_bson(&a[0], &b[0]).then_with(|| cmp_bson(&a[1], &b[1])));
    keys.dedup_by(|a, b| bson_eq(&a[0], &b[0]) && bson_eq(&a[1], &b[1]));

    IndexKeys {
        keys,
        multikey: vec![false; index.fields.len()],
        multikey_paths: collector.multikey_paths,
    }
}

struct WildcardCollector<'a> {
    spec: &'a WildcardSpec,
    keys: Vec<(String, Bson)>,
    multikey_paths: BTreeSet<String>,
}

impl<'a> WildcardCollector<'a> {
    fn visit(&mut self, path: String, value: &Bson, in_array: bool) {
        match value {
            Bson::Document(doc) if !doc.is_empty() => {
                for (name, child) in doc {
                    self.visit(format!("{}.{}", path, name), child, false);
                }
            }
            Bson::Array(elements) if !in_array => {
                if !self.spec.covers(&path) && !self.may_cover_below(&path) {
                    return;
                }
                self.multikey_paths.insert(path.clone());
                if elements.is_empty() {
                    self.add(path, Bson::Undefined);
                    return;
                }
                for element in elements {
                    self.visit(path.clone(), element, true);
                }
            }
            leaf => self.add(path, leaf.clone()),
        }
    }

    fn add(&mut self, path: String, value: Bson) {
        if self.spec.covers(&path) {
            self.keys.push((path, value));
        }
    }

    fn may_cover_below(&self, path: &str) -> bool {
        let prefix = format!("{}.", path);
        let root = self.spec.root.join(".");
        root.starts_with(&prefix)
            || match &self.spec.projection {
                Some((paths, true)) => paths.iter().any(|p| p.starts_with(&prefix)),
                _ => false,
            }
    }
}
