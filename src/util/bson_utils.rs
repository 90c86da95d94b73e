use crate::io::byte_writer::ByteWriter;
use crate::util::murmur_hash64::murmur_hash64a;
use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, Timestamp};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Seed used for hashed index keys. Changing it invalidates every hashed index.
const HASHED_KEY_SEED: u64 = 0x5EED_2025_0309;

pub const RANK_MIN_KEY: u8 = 0;
pub const RANK_UNDEFINED: u8 = 1;
pub const RANK_NULL: u8 = 2;
pub const RANK_NUMBER: u8 = 3;
pub const RANK_STRING: u8 = 4;
pub const RANK_DOCUMENT: u8 = 5;
pub const RANK_ARRAY: u8 = 6;
pub const RANK_BINARY: u8 = 7;
pub const RANK_OBJECT_ID: u8 = 8;
pub const RANK_BOOLEAN: u8 = 9;
pub const RANK_DATE: u8 = 10;
pub const RANK_TIMESTAMP: u8 = 11;
pub const RANK_REGEX: u8 = 12;
pub const RANK_CODE: u8 = 13;
pub const RANK_MAX_KEY: u8 = 14;

/// Returns the canonical type rank of a value.
///
/// `MinKey < Undefined < Null < Numbers < String < Document < Array < Binary < ObjectId`
/// `< Boolean < DateTime < Timestamp < RegularExpression < Code < MaxKey`
///
/// `Undefined` never appears in user documents: it is the key stored for empty arrays.
pub fn type_rank(v: &Bson) -> u8 {
    use Bson::*;
    match v {
        MinKey => RANK_MIN_KEY,
        Undefined => RANK_UNDEFINED,
        Null => RANK_NULL,
        Double(_) | Int32(_) | Int64(_) | Decimal128(_) => RANK_NUMBER,
        String(_) | Symbol(_) => RANK_STRING,
        Document(_) => RANK_DOCUMENT,
        Array(_) => RANK_ARRAY,
        Binary(_) => RANK_BINARY,
        ObjectId(_) | DbPointer(_) => RANK_OBJECT_ID,
        Boolean(_) => RANK_BOOLEAN,
        DateTime(_) => RANK_DATE,
        Timestamp(_) => RANK_TIMESTAMP,
        RegularExpression(_) => RANK_REGEX,
        JavaScriptCode(_) | JavaScriptCodeWithScope(_) => RANK_CODE,
        MaxKey => RANK_MAX_KEY,
    }
}

/// Numeric view of a BSON number used for cross-type comparisons.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Dbl(f64),
}

fn as_num(v: &Bson) -> Option<Num> {
    match v {
        Bson::Int32(i) => Some(Num::Int(*i as i64)),
        Bson::Int64(i) => Some(Num::Int(*i)),
        Bson::Double(d) => Some(Num::Dbl(*d)),
        Bson::Decimal128(d) => Some(Num::Dbl(decimal_to_f64(d))),
        _ => None,
    }
}

/// Decimal128 values are compared through their closest `f64`.
pub fn decimal_to_f64(d: &bson::Decimal128) -> f64 {
    d.to_string().parse::<f64>().unwrap_or(f64::NAN)
}

/// Returns `true` if the value is a floating point (or decimal) NaN.
pub fn is_nan(v: &Bson) -> bool {
    matches!(as_num(v), Some(Num::Dbl(d)) if d.is_nan())
}

fn cmp_f64(x: f64, y: f64) -> Ordering {
    // NaN sorts below every other number and is equal to itself.
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn cmp_int_f64(x: i64, y: f64) -> Ordering {
    if y.is_nan() {
        return Ordering::Greater;
    }
    if y >= 9.223_372_036_854_775_807e18 {
        return Ordering::Less;
    }
    if y < -9.223_372_036_854_775_808e18 {
        return Ordering::Greater;
    }
    let truncated = y.trunc();
    match x.cmp(&(truncated as i64)) {
        Ordering::Equal => {
            let fraction = y - truncated;
            if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn cmp_num(a: Num, b: Num) -> Ordering {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => x.cmp(&y),
        (Num::Dbl(x), Num::Dbl(y)) => cmp_f64(x, y),
        (Num::Int(x), Num::Dbl(y)) => cmp_int_f64(x, y),
        (Num::Dbl(x), Num::Int(y)) => cmp_int_f64(y, x).reverse(),
    }
}

fn subtype_code(s: BinarySubtype) -> u8 {
    s.into()
}

fn str_value(v: &Bson) -> &str {
    match v {
        Bson::String(s) | Bson::Symbol(s) => s.as_str(),
        _ => "",
    }
}

/// Compares two [`Bson`] values using the canonical total order.
///
/// Values of different type classes compare by [`type_rank`]. Inside a class:
/// * numbers by numeric value, across int32/int64/double/decimal128
/// * strings by UTF-8 bytes
/// * documents field by field (name, then value), a prefix sorts first
/// * arrays element by element, a prefix sorts first
/// * binaries by length, then subtype, then bytes
/// * timestamps by (time, increment)
pub fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    use Bson::*;

    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Double(_) | Int32(_) | Int64(_) | Decimal128(_), _) => {
            match (as_num(a), as_num(b)) {
                (Some(x), Some(y)) => cmp_num(x, y),
                _ => Ordering::Equal,
            }
        }
        (String(_) | Symbol(_), _) => str_value(a).cmp(str_value(b)),
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (DateTime(x), DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        (ObjectId(x), ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Timestamp(x), Timestamp(y)) => (x.time, x.increment).cmp(&(y.time, y.increment)),
        (Binary(x), Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| subtype_code(x.subtype).cmp(&subtype_code(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (RegularExpression(x), RegularExpression(y)) => x
            .pattern
            .cmp(&y.pattern)
            .then_with(|| x.options.cmp(&y.options)),
        (JavaScriptCode(x), JavaScriptCode(y)) => x.cmp(y),
        (Array(av), Array(bv)) => {
            for (ai, bi) in av.iter().zip(bv.iter()) {
                let ord = cmp_bson(ai, bi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            av.len().cmp(&bv.len())
        }
        (Document(ad), Document(bd)) => cmp_documents(ad, bd),
        // MinKey, MaxKey, Null, Undefined and mixed legacy variants.
        _ => Ordering::Equal,
    }
}

fn cmp_documents(a: &Document, b: &Document) -> Ordering {
    for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
        let ord = type_rank(av)
            .cmp(&type_rank(bv))
            .then_with(|| ak.cmp(bk))
            .then_with(|| cmp_bson(av, bv));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Equality consistent with [`cmp_bson`]: `1 == 1.0 == 1i64`, `NaN == NaN`,
/// and documents are equal only if their fields appear in the same order.
pub fn bson_eq(a: &Bson, b: &Bson) -> bool {
    cmp_bson(a, b) == Ordering::Equal
}

/// Hash consistent with [`bson_eq`].
pub fn bson_hash<H: Hasher>(bson: &Bson, state: &mut H) {
    type_rank(bson).hash(state);
    match bson {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => {
            match as_num(bson).map(normalize_num) {
                Some(Num::Int(i)) => i.hash(state),
                Some(Num::Dbl(d)) => {
                    if d.is_nan() {
                        0x7FF8_0000_0000_0000u64.hash(state)
                    } else {
                        d.to_bits().hash(state)
                    }
                }
                None => (),
            }
        }
        Bson::String(s) | Bson::Symbol(s) => s.hash(state),
        Bson::Boolean(b) => b.hash(state),
        Bson::DateTime(d) => d.timestamp_millis().hash(state),
        Bson::Timestamp(ts) => (ts.time, ts.increment).hash(state),
        Bson::ObjectId(oid) => oid.bytes().hash(state),
        Bson::Binary(bin) => bin.bytes.hash(state),
        Bson::Array(arr) => {
            arr.len().hash(state);
            for elem in arr {
                bson_hash(elem, state);
            }
        }
        Bson::Document(doc) => {
            doc.len().hash(state);
            for (key, value) in doc {
                key.hash(state);
                bson_hash(value, state);
            }
        }
        Bson::RegularExpression(regex) => {
            regex.pattern.hash(state);
            regex.options.hash(state);
        }
        _ => (),
    }
}

/// Integral doubles inside the i64 range are represented as integers so that
/// numerically equal values share one encoding.
fn normalize_num(n: Num) -> Num {
    match n {
        Num::Dbl(d) if d.fract() == 0.0 && d >= -9.223_372_036_854_775_808e18 && d < 9.223_372_036_854_775_807e18 => {
            Num::Int(d as i64)
        }
        other => other,
    }
}

/// Writes a canonical binary encoding of `value`: two values that compare
/// equal produce identical bytes.
pub fn write_canonical(value: &Bson, writer: &mut ByteWriter) {
    writer.write_u8(type_rank(value));
    match value {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => {
            match as_num(value).map(normalize_num) {
                Some(Num::Int(i)) => writer.write_u8(0).write_i64(i),
                Some(Num::Dbl(d)) => writer.write_u8(1).write_f64(d),
                None => writer,
            };
        }
        Bson::String(s) | Bson::Symbol(s) => {
            writer.write_str(s);
        }
        Bson::Boolean(b) => {
            writer.write_bool(*b);
        }
        Bson::DateTime(d) => {
            writer.write_i64(d.timestamp_millis());
        }
        Bson::Timestamp(ts) => {
            writer.write_u32(ts.time).write_u32(ts.increment);
        }
        Bson::ObjectId(oid) => {
            writer.write_length_prefixed_slice(&oid.bytes());
        }
        Bson::Binary(bin) => {
            writer.write_u8(subtype_code(bin.subtype)).write_length_prefixed_slice(&bin.bytes);
        }
        Bson::RegularExpression(regex) => {
            writer.write_str(&regex.pattern).write_str(&regex.options);
        }
        Bson::JavaScriptCode(code) => {
            writer.write_str(code);
        }
        Bson::Array(arr) => {
            writer.write_u32(arr.len() as u32);
            for elem in arr {
                write_canonical(elem, writer);
            }
        }
        Bson::Document(doc) => {
            writer.write_u32(doc.len() as u32);
            for (key, value) in doc {
                writer.write_str(key);
                write_canonical(value, writer);
            }
        }
        _ => (),
    }
}

/// Computes the key stored in a hashed index for `value`.
pub fn hash_key(value: &Bson) -> i64 {
    let mut writer = ByteWriter::new();
    write_canonical(value, &mut writer);
    murmur_hash64a(writer.as_slice(), HASHED_KEY_SEED) as i64
}

/// Returns `true` if `a` and `b` belong to the same canonical type class.
pub fn same_type_class(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

/// Returns `true` for the `MinKey` and `MaxKey` sentinels.
pub fn is_sentinel(v: &Bson) -> bool {
    matches!(v, Bson::MinKey | Bson::MaxKey)
}

/// Smallest and largest values of the type class of `v`, with their inclusivity.
///
/// Range predicates only match values of the same class as their operand,
/// so `$gt: 1` covers `(1, inf.0]` and `$lt: "m"` covers `["", "m")`.
/// Returns `None` for classes that cannot be range-bounded (regex, code).
pub fn type_bracket(v: &Bson) -> Option<((Bson, bool), (Bson, bool))> {
    let bracket = match type_rank(v) {
        RANK_MIN_KEY | RANK_MAX_KEY => ((Bson::MinKey, true), (Bson::MaxKey, true)),
        RANK_UNDEFINED => ((Bson::Undefined, true), (Bson::Undefined, true)),
        RANK_NULL => ((Bson::Null, true), (Bson::Null, true)),
        RANK_NUMBER => (
            (Bson::Double(f64::NEG_INFINITY), true),
            (Bson::Double(f64::INFINITY), true),
        ),
        RANK_STRING => ((Bson::String(String::new()), true), (Bson::Document(Document::new()), false)),
        RANK_DOCUMENT => ((Bson::Document(Document::new()), true), (Bson::Array(vec![]), false)),
        RANK_ARRAY => ((Bson::Array(vec![]), true), (empty_binary(), false)),
        RANK_BINARY => ((empty_binary(), true), (Bson::ObjectId(ObjectId::from_bytes([0; 12])), false)),
        RANK_OBJECT_ID => (
            (Bson::ObjectId(ObjectId::from_bytes([0; 12])), true),
            (Bson::ObjectId(ObjectId::from_bytes([0xFF; 12])), true),
        ),
        RANK_BOOLEAN => ((Bson::Boolean(false), true), (Bson::Boolean(true), true)),
        RANK_DATE => (
            (Bson::DateTime(bson::DateTime::from_millis(i64::MIN)), true),
            (Bson::DateTime(bson::DateTime::from_millis(i64::MAX)), true),
        ),
        RANK_TIMESTAMP => (
            (Bson::Timestamp(Timestamp { time: 0, increment: 0 }), true),
            (Bson::Timestamp(Timestamp { time: u32::MAX, increment: u32::MAX }), true),
        ),
        _ => return None,
    };
    Some(bracket)
}

fn empty_binary() -> Bson {
    Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![] })
}
