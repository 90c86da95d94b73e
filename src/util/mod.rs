pub mod bson_utils;
pub mod collation;
pub mod interval;
pub mod murmur_hash64;
