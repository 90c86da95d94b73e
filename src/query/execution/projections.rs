use crate::query::{Projection, ProjectionExpr};
use bson::{Bson, Document};
use std::sync::Arc;

pub type Projector = Box<dyn Fn(Document) -> Document + Send + Sync>;

/// Compiles a projection into a function applied to every returned document.
pub fn to_projector(projection: &Arc<Projection>) -> Projector {
    match projection.as_ref() {
        Projection::Include(expr) => {
            let expr = expr.clone();
            Box::new(move |doc| include(&expr, &doc))
        }
        Projection::Exclude(expr) => {
            let expr = expr.clone();
            Box::new(move |mut doc| {
                exclude(&expr, &mut doc);
                doc
            })
        }
    }
}

fn include(expr: &ProjectionExpr, doc: &Document) -> Document {
    let mut projected = Document::new();
    if let Some(children) = expr.children() {
        // Fields keep the order they have in the document
        for (key, value) in doc {
            if let Some(child) = children.get(key) {
                if let Some(value) = include_value(child, value) {
                    projected.insert(key.clone(), value);
                }
            }
        }
    }
    projected
}

fn include_value(expr: &ProjectionExpr, value: &Bson) -> Option<Bson> {
    match expr {
        ProjectionExpr::Field => Some(value.clone()),
        ProjectionExpr::Fields { .. } => match value {
            Bson::Document(doc) => Some(Bson::Document(include(expr, doc))),
            // Sub-fields of an array apply to each of its documents
            Bson::Array(elements) => Some(Bson::Array(
                elements.iter().filter_map(|e| match e {
                    Bson::Document(_) | Bson::Array(_) => include_value(expr, e),
                    _ => None,
                }).collect(),
            )),
            _ => None,
        },
    }
}

fn exclude(expr: &ProjectionExpr, doc: &mut Document) {
    if let Some(children) = expr.children() {
        for (key, child) in children {
            match child.as_ref() {
                ProjectionExpr::Field => {
                    doc.remove(key);
                }
                nested => {
                    if let Some(value) = doc.get_mut(key) {
                        exclude_value(nested, value);
                    }
                }
            }
        }
    }
}

fn exclude_value(expr: &ProjectionExpr, value: &mut Bson) {
    match value {
        Bson::Document(doc) => exclude(expr, doc),
        Bson::Array(elements) => {
            for element in elements.iter_mut() {
                exclude_value(expr, element);
            }
        }
        _ => (),
    }
}
