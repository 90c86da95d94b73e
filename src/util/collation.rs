use crate::error::{Error, Result};
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// String comparison rules attached to an index or a query.
///
/// `simple` compares strings by their UTF-8 bytes. Any other locale with a
/// strength of 1 or 2 compares strings case-insensitively; strength 3 and
/// above behave like `simple` for the purpose of key generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    #[serde(default = "default_strength")]
    pub strength: u8,
}

fn default_strength() -> u8 {
    3
}

impl Default for Collation {
    fn default() -> Self {
        Collation::simple()
    }
}

impl Collation {
    pub fn simple() -> Self {
        Collation { locale: "simple".to_string(), strength: default_strength() }
    }

    pub fn new(locale: &str, strength: u8) -> Self {
        Collation { locale: locale.to_string(), strength }
    }

    pub fn is_simple(&self) -> bool {
        self.locale == "simple"
    }

    fn is_case_insensitive(&self) -> bool {
        !self.is_simple() && self.strength <= 2
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        let collation: Collation = bson::from_document(doc.clone())?;
        if collation.locale.is_empty() {
            return Err(Error::InvalidRequest("collation locale must not be empty".to_string()));
        }
        if !(1..=5).contains(&collation.strength) {
            return Err(Error::InvalidRequest(format!(
                "collation strength must be between 1 and 5, got {}",
                collation.strength
            )));
        }
        Ok(collation)
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("locale", self.locale.clone());
        if !self.is_simple() {
            doc.insert("strength", self.strength as i32);
        }
        doc
    }

    /// Returns the value whose binary order matches the collation order of `value`.
    /// Strings nested in arrays and documents are transformed too.
    pub fn collation_key(&self, value: &Bson) -> Bson {
        if !self.is_case_insensitive() {
            return value.clone();
        }
        match value {
            Bson::String(s) => Bson::String(s.to_lowercase()),
            Bson::Symbol(s) => Bson::String(s.to_lowercase()),
            Bson::Array(values) => Bson::Array(values.iter().map(|v| self.collation_key(v)).collect()),
            Bson::Document(doc) => Bson::Document(
                doc.iter()
                    .map(|(k, v)| (k.clone(), self.collation_key(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Returns `true` if keys built with `self` can answer string comparisons
    /// requested with `query`.
    pub fn matches(&self, query: &Collation) -> bool {
        self.is_case_insensitive() == query.is_case_insensitive()
            && (self.is_simple() && query.is_simple() || self == query)
    }
}

/// Returns `true` if the value is, or contains, a string.
pub fn contains_string(value: &Bson) -> bool {
    match value {
        Bson::String(_) | Bson::Symbol(_) => true,
        Bson::Array(values) => values.iter().any(contains_string),
        Bson::Document(doc) => doc.values().any(contains_string),
        _ => false,
    }
}
