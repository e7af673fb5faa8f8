use serde::{Deserialize, Serialize, Serializer};

/// Loosely typed leaf of the OCR response arrays.
///
/// The service nests bounding boxes as `[[points...], [text, confidence]]`
/// without any schema guarantees, so every element is decoded into this
/// tagged form and checked individually.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    String(String),
    Array(Vec<RawValue>),
    Other(serde_json::Value),
}

impl RawValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RawValue]> {
        match self {
            RawValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// One recognized text region, as written to the response file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrItem {
    pub text: String,
    #[serde(serialize_with = "compact_number")]
    pub confidence: f64,
    /// Polygon corners, usually four for a quadrilateral.
    #[serde(serialize_with = "compact_points")]
    pub points: Vec<[f64; 2]>,
}

// Whole numbers are written without a fractional part (`[0,0]`, `1`).
fn compact_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

fn compact_points<S: Serializer>(points: &[[f64; 2]], serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;

    struct Compact(f64);

    impl Serialize for Compact {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            compact_number(&self.0, serializer)
        }
    }

    let mut seq = serializer.serialize_seq(Some(points.len()))?;
    for [x, y] in points {
        seq.serialize_element(&[Compact(*x), Compact(*y)])?;
    }
    seq.end()
}
