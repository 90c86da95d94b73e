use crate::error::Result;
use crate::io::byte_writer::ByteWriter;
use crate::options::options::PlannerOptions;
use crate::query::canonical_query::{CanonicalQuery, QueryKind};
use crate::query::optimizer::enumerator::partial_index_eligibility;
use crate::query::{format_path, resolve_value, Expr, Parameters, Projection};
use crate::storage::catalog::CollectionMetadata;
use crate::util::bson_utils::{type_rank, write_canonical};
use crate::util::collation::contains_string;
use crate::util::murmur_hash64::murmur_hash64a;
use bson::Bson;
use std::collections::BTreeSet;

const SHAPE_SEED: u64 = 0x5155_4f4b_4b41_4442;

/// Identifies queries that can share a plan.
///
/// `query_hash` only depends on the structure of the query. `plan_cache_key`
/// also depends on the properties of the literal values that decide which
/// indexes are usable, like their type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryShape {
    pub query_hash: u64,
    pub plan_cache_key: u64,
}

impl QueryShape {
    pub fn compute(query: &CanonicalQuery, collection: &CollectionMetadata, options: &PlannerOptions) -> Result<Self> {
        let mut writer = ByteWriter::new();
        write_kind(&query.kind, &mut writer);
        write_expr(&query.filter, &mut writer);
        match &query.sort {
            Some(sort) => {
                writer.write_u32(sort.len() as u32);
                for field in sort.iter() {
                    writer.write_str(&field.path_string()).write_u8(field.order.as_i32() as u8);
                }
            }
            None => {
                writer.write_u32(0);
            }
        }
        match query.projection.as_deref() {
            Some(Projection::Include(expr)) => {
                writer.write_u8(1).write_str(&expr.paths().join(","));
            }
            Some(Projection::Exclude(expr)) => {
                writer.write_u8(2).write_str(&expr.paths().join(","));
            }
            None => {
                writer.write_u8(0);
            }
        }
        writer
            .write_str(&query.collation.locale)
            .write_u8(query.collation.strength);
        let query_hash = murmur_hash64a(writer.as_slice(), SHAPE_SEED);

        writer.write_str(query.hint.as_deref().unwrap_or(""));
        write_discriminators(&query.filter, &query.parameters, &mut writer)?;
        for (index, eligible) in partial_index_eligibility(collection, query, options)? {
            writer.write_str(&index).write_bool(eligible);
        }
        let plan_cache_key = murmur_hash64a(writer.as_slice(), SHAPE_SEED);

        Ok(QueryShape {
            query_hash,
            plan_cache_key,
        })
    }

    pub fn query_hash_hex(&self) -> String {
        format!("{:016X}", self.query_hash)
    }

    pub fn plan_cache_key_hex(&self) -> String {
        format!("{:016X}", self.plan_cache_key)
    }
}

fn write_kind(kind: &QueryKind, writer: &mut ByteWriter) {
    match kind {
        QueryKind::Find => {
            writer.write_u8(0);
        }
        QueryKind::Distinct { key } => {
            writer.write_u8(1).write_str(&format_path(key));
        }
        QueryKind::Group { key, accumulator } => {
            writer.write_u8(2).write_str(&format_path(key));
            match accumulator {
                Some((name, accumulator)) => {
                    writer.write_str(name);
                    write_canonical(&Bson::Document(accumulator.to_document()), writer);
                }
                None => {
                    writer.write_str("");
                }
            }
        }
    }
}

/// Writes the structure of a parametrized filter.
fn write_expr(expr: &Expr, writer: &mut ByteWriter) {
    match expr {
        Expr::Field(path) => {
            writer.write_u8(1).write_str(&format_path(path));
        }
        Expr::Literal(value) => {
            writer.write_u8(2);
            write_canonical(&value.0, writer);
        }
        Expr::Placeholder(_) => {
            writer.write_u8(3);
        }
        Expr::FieldFilters { field, filters } => {
            writer.write_u8(4);
            write_expr(field, writer);
            write_all(filters, writer);
        }
        Expr::Comparison { operator, value } => {
            writer.write_u8(5).write_str(operator.name());
            write_expr(value, writer);
        }
        Expr::ExprComparison { operator, value } => {
            writer.write_u8(6).write_str(operator.name());
            write_expr(value, writer);
        }
        Expr::And(children) => {
            writer.write_u8(7);
            write_all(children, writer);
        }
        Expr::Or(children) => {
            writer.write_u8(8);
            write_all(children, writer);
        }
        Expr::Not(child) => {
            writer.write_u8(9);
            write_expr(child, writer);
        }
        Expr::Nor(children) => {
            writer.write_u8(10);
            write_all(children, writer);
        }
        Expr::Exists(exists) => {
            writer.write_u8(11).write_bool(*exists);
        }
        Expr::Type { bson_type, negated } => {
            writer.write_u8(12).write_bool(*negated);
            write_expr(bson_type, writer);
        }
        Expr::Size { size, negated } => {
            writer.write_u8(13).write_bool(*negated);
            write_expr(size, writer);
        }
        Expr::All(values) => {
            writer.write_u8(14);
            write_expr(values, writer);
        }
        Expr::ElemMatch(children) => {
            writer.write_u8(15);
            write_all(children, writer);
        }
        Expr::ExprFilter(agg) => {
            writer.write_u8(16);
            write_canonical(&agg.to_bson(), writer);
        }
        Expr::AlwaysTrue => {
            writer.write_u8(17);
        }
        Expr::AlwaysFalse => {
            writer.write_u8(18);
        }
    }
}

fn write_all(exprs: &[std::sync::Arc<Expr>], writer: &mut ByteWriter) {
    writer.write_u32(exprs.len() as u32);
    for expr in exprs {
        write_expr(expr, writer);
    }
}

/// Writes, for every comparison, the type of its operand and whether it
/// contains strings: both decide whether the comparison can bound an index.
fn write_discriminators(expr: &Expr, parameters: &Parameters, writer: &mut ByteWriter) -> Result<()> {
    match expr {
        Expr::Comparison { value, .. } | Expr::ExprComparison { value, .. } => {
            let operand = resolve_value(value, parameters)?;
            writer.write_u8(type_rank(operand)).write_bool(contains_string(operand));
            if let Bson::Array(elements) = operand {
                let ranks: BTreeSet<u8> = elements.iter().map(type_rank).collect();
                writer.write_u32(ranks.len() as u32);
                for rank in ranks {
                    writer.write_u8(rank);
                }
            }
        }
        Expr::FieldFilters { filters: children, .. }
        | Expr::And(children)
        | Expr::Or(children)
        | Expr::Nor(children)
        | Expr::ElemMatch(children) => {
            for child in children {
                write_discriminators(child, parameters, writer)?;
            }
        }
        Expr::Not(child) => write_discriminators(child, parameters, writer)?,
        _ => (),
    }
    Ok(())
}
