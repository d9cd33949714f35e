use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod config;

pub use config::{
    AppSection, ChunkingSection, EngineConfig, NavigationSection, TimestampsSection, ViewSection,
    load_config,
};

// ===== DESCRIPTOR TYPES =====

/// Attribute map attached to groups and datasets in the remote store.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Half-open `[lo, hi)` range along one dimension of a dataset.
pub type SliceRange = (u64, u64);

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GroupDescriptor {
    pub path: String,
    pub subgroups: Vec<String>,
    pub datasets: Vec<String>,
    #[serde(default)]
    pub attrs: Attributes,
}

impl GroupDescriptor {
    pub fn has_dataset(&self, name: &str) -> bool {
        self.datasets.iter().any(|dataset| dataset == name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    pub path: String,
    pub shape: Vec<u64>,
    pub dtype: String,
    #[serde(default)]
    pub attrs: Attributes,
}

impl DatasetDescriptor {
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Length of the leading (time) dimension. Scalars count as one element.
    pub fn sample_count(&self) -> u64 {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Numeric attribute lookup. Non-numeric values read as `None`.
    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attrs.get(name).and_then(|value| value.as_f64())
    }
}

// ===== NUMERIC ARRAYS =====

/// Flat, row-major numeric payload returned by an array source.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum NumericArray {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! map_values {
    ($array:expr, $values:ident => $body:expr) => {
        match $array {
            NumericArray::I8($values) => $body,
            NumericArray::U8($values) => $body,
            NumericArray::I16($values) => $body,
            NumericArray::U16($values) => $body,
            NumericArray::I32($values) => $body,
            NumericArray::U32($values) => $body,
            NumericArray::I64($values) => $body,
            NumericArray::U64($values) => $body,
            NumericArray::F32($values) => $body,
            NumericArray::F64($values) => $body,
        }
    };
}

macro_rules! rewrap_values {
    ($array:expr, $values:ident => $body:expr) => {
        match $array {
            NumericArray::I8($values) => NumericArray::I8($body),
            NumericArray::U8($values) => NumericArray::U8($body),
            NumericArray::I16($values) => NumericArray::I16($body),
            NumericArray::U16($values) => NumericArray::U16($body),
            NumericArray::I32($values) => NumericArray::I32($body),
            NumericArray::U32($values) => NumericArray::U32($body),
            NumericArray::I64($values) => NumericArray::I64($body),
            NumericArray::U64($values) => NumericArray::U64($body),
            NumericArray::F32($values) => NumericArray::F32($body),
            NumericArray::F64($values) => NumericArray::F64($body),
        }
    };
}

impl NumericArray {
    pub fn len(&self) -> usize {
        map_values!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numpy-style dtype tag, e.g. `"<f8"` or `"|u1"`.
    pub fn dtype(&self) -> &'static str {
        match self {
            NumericArray::I8(_) => "|i1",
            NumericArray::U8(_) => "|u1",
            NumericArray::I16(_) => "<i2",
            NumericArray::U16(_) => "<u2",
            NumericArray::I32(_) => "<i4",
            NumericArray::U32(_) => "<u4",
            NumericArray::I64(_) => "<i8",
            NumericArray::U64(_) => "<u8",
            NumericArray::F32(_) => "<f4",
            NumericArray::F64(_) => "<f8",
        }
    }

    /// 64-bit integer kinds cannot be represented exactly as `f64` and are downcast.
    pub fn is_wide_integer(&self) -> bool {
        matches!(self, NumericArray::I64(_) | NumericArray::U64(_))
    }

    pub fn get_f64(&self, index: usize) -> Option<f64> {
        map_values!(self, values => values.get(index).map(|value| *value as f64))
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        map_values!(self, values => values.iter().map(|value| *value as f64).collect())
    }

    /// Picks elements by flat index, keeping the element type.
    pub fn gather(&self, indices: impl IntoIterator<Item = usize>) -> NumericArray {
        let indices: Vec<usize> = indices.into_iter().collect();
        rewrap_values!(self, values => {
            indices.iter().filter_map(|&i| values.get(i).copied()).collect()
        })
    }
}

// ===== TIME TYPES =====

/// A closed time range in seconds, e.g. the visible window of a view.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    /// Bounds are normalized so that `start <= end`.
    pub fn new(start: f64, end: f64) -> Self {
        TimeRange {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn duration(self) -> f64 {
        self.end - self.start
    }

    pub fn center(self) -> f64 {
        self.start + self.duration() / 2.0
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", format_seconds(self.start), format_seconds(self.end))
    }
}

/// Human-readable seconds with a unit suited to the magnitude.
pub fn format_seconds(seconds: f64) -> String {
    let magnitude = seconds.abs();
    if !seconds.is_finite() {
        format!("{}", seconds)
    } else if magnitude >= 1.0 || magnitude == 0.0 {
        format!("{:.3}s", seconds)
    } else if magnitude >= 1e-3 {
        format!("{:.3}ms", seconds * 1e3)
    } else {
        format!("{:.3}μs", seconds * 1e6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_attr_lookup() {
        let mut attrs = Attributes::new();
        attrs.insert("conversion".to_string(), serde_json::json!(0.195));
        attrs.insert("unit".to_string(), serde_json::json!("volts"));
        let descriptor = DatasetDescriptor {
            path: "/acquisition/ElectricalSeries/data".to_string(),
            shape: vec![900_000, 32],
            dtype: "<i2".to_string(),
            attrs,
        };

        assert_eq!(descriptor.rank(), 2);
        assert_eq!(descriptor.sample_count(), 900_000);
        assert_eq!(descriptor.attr_f64("conversion"), Some(0.195));
        assert_eq!(descriptor.attr_f64("unit"), None);
        assert_eq!(descriptor.attr_f64("offset"), None);
    }

    #[test]
    fn test_numeric_array_widening() {
        let array = NumericArray::I64(vec![-3, 0, 1 << 40]);
        assert!(array.is_wide_integer());
        assert_eq!(array.dtype(), "<i8");
        assert_eq!(array.to_f64_vec(), vec![-3.0, 0.0, (1u64 << 40) as f64]);

        let small = NumericArray::U8(vec![1, 2, 255]);
        assert!(!small.is_wide_integer());
        assert_eq!(small.get_f64(2), Some(255.0));
        assert_eq!(small.get_f64(3), None);
    }

    #[test]
    fn test_numeric_array_gather_keeps_type() {
        let array = NumericArray::I16(vec![10, 11, 12, 13, 14, 15]);
        let picked = array.gather([1, 3, 5]);
        assert_eq!(picked, NumericArray::I16(vec![11, 13, 15]));
    }

    #[test]
    fn test_time_range_operations() {
        let range = TimeRange::new(3.0, 1.0);
        assert_eq!(range.start, 1.0);
        assert_eq!(range.end, 3.0);
        assert_eq!(range.duration(), 2.0);
        assert_eq!(range.center(), 2.0);
    }

    #[test]
    fn test_format_seconds_units() {
        assert_eq!(format_seconds(1.5), "1.500s");
        assert_eq!(format_seconds(0.0025), "2.500ms");
        assert_eq!(format_seconds(0.0000025), "2.500μs");
        assert_eq!(format_seconds(0.0), "0.000s");
    }
}
