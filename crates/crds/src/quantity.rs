//! Kubernetes resource quantities
//!
//! Parses quantity strings such as `"500m"`, `"64"`, `"128Gi"` or `"1e3"`
//! into plain numbers, and aggregates CPU/memory amounts.

use std::ops::{Add, AddAssign, Sub};
use thiserror::Error;

/// Errors raised while parsing a quantity string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity: {0}")]
    Invalid(String),
}

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(char, f64); 10] = [
    ('n', 1e-9),
    ('u', 1e-6),
    ('m', 1e-3),
    ('k', 1e3),
    ('M', 1e6),
    ('G', 1e9),
    ('T', 1e12),
    ('P', 1e15),
    ('E', 1e18),
    ('K', 1e3),
];

/// Parse a Kubernetes quantity into its numeric value.
///
/// `"250m"` parses to `0.25`, `"2Gi"` to `2147483648.0`. A trailing `E`
/// is the exa suffix; exponents need a digit after the `e`/`E`.
pub fn parse_quantity(raw: &str) -> Result<f64, QuantityError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(QuantityError::Empty);
    }

    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return parse_number(number, raw).map(|n| n * multiplier);
        }
    }

    if let Some(last) = value.chars().last() {
        for (suffix, multiplier) in DECIMAL_SUFFIXES {
            if last == suffix {
                let number = &value[..value.len() - last.len_utf8()];
                return parse_number(number, raw).map(|n| n * multiplier);
            }
        }
    }

    parse_number(value, raw)
}

fn parse_number(number: &str, raw: &str) -> Result<f64, QuantityError> {
    let parsed: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(raw.to_string()))?;
    if parsed.is_finite() && parsed >= 0.0 {
        Ok(parsed)
    } else {
        Err(QuantityError::Invalid(raw.to_string()))
    }
}

/// CPU and memory amounts used for capacity and allocation accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceAmounts {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl ResourceAmounts {
    /// Build amounts from optional CPU and memory quantity strings.
    #[allow(clippy::cast_possible_truncation, reason = "request totals fit comfortably in i64")]
    pub fn from_quantities(cpu: Option<&str>, memory: Option<&str>) -> Result<Self, QuantityError> {
        let cpu_millis = cpu.map(parse_quantity).transpose()?.unwrap_or(0.0) * 1000.0;
        let memory_bytes = memory.map(parse_quantity).transpose()?.unwrap_or(0.0);
        Ok(Self {
            cpu_millis: cpu_millis.round() as i64,
            memory_bytes: memory_bytes.round() as i64,
        })
    }

    /// Amounts left after subtracting `used`, floored at zero.
    pub fn saturating_sub(self, used: ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu_millis: (self.cpu_millis - used.cpu_millis).max(0),
            memory_bytes: (self.memory_bytes - used.memory_bytes).max(0),
        }
    }
}

impl Add for ResourceAmounts {
    type Output = ResourceAmounts;

    fn add(self, rhs: ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu_millis: self.cpu_millis + rhs.cpu_millis,
            memory_bytes: self.memory_bytes + rhs.memory_bytes,
        }
    }
}

impl AddAssign for ResourceAmounts {
    fn add_assign(&mut self, rhs: ResourceAmounts) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceAmounts {
    type Output = ResourceAmounts;

    fn sub(self, rhs: ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu_millis: self.cpu_millis - rhs.cpu_millis,
            memory_bytes: self.memory_bytes - rhs.memory_bytes,
        }
    }
}
