use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Unit of a [`StorageQuantity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageUnit {
    Bytes,
    Kibibytes,
    Mebibytes,
    Gibibytes,
}

impl StorageUnit {
    fn multiplier(&self) -> usize {
        match self {
            StorageUnit::Bytes => 1,
            StorageUnit::Kibibytes => 1024,
            StorageUnit::Mebibytes => 1024 * 1024,
            StorageUnit::Gibibytes => 1024 * 1024 * 1024,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            StorageUnit::Bytes => "B",
            StorageUnit::Kibibytes => "KiB",
            StorageUnit::Mebibytes => "MiB",
            StorageUnit::Gibibytes => "GiB",
        }
    }
}

/// A memory size such as the budget of a blocking sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageQuantity {
    value: usize,
    unit: StorageUnit,
}

impl StorageQuantity {
    pub fn new(value: usize, unit: StorageUnit) -> Self {
        Self { value, unit }
    }

    pub fn to_bytes(&self) -> usize {
        self.value.saturating_mul(self.unit.multiplier())
    }
}

impl fmt::Display for StorageQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.symbol())
    }
}

/// Parses quantities written as `"<value> <unit>"`, e.g. `"32 MiB"` or `"512B"`.
impl FromStr for StorageQuantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let value = digits
            .parse::<usize>()
            .map_err(|_| Error::InvalidRequest(format!("Invalid storage quantity: '{}'", s)))?;
        let unit = match unit.trim() {
            "" | "B" => StorageUnit::Bytes,
            "KiB" => StorageUnit::Kibibytes,
            "MiB" => StorageUnit::Mebibytes,
            "GiB" => StorageUnit::Gibibytes,
            other => {
                return Err(Error::InvalidRequest(format!("Unknown storage unit: '{}'", other)))
            }
        };
        Ok(StorageQuantity::new(value, unit))
    }
}
