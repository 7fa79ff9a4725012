use serde_json::{Number, Value};

/// String data as the source delivered it, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Text {
    Utf8(String),
    Utf16(Vec<u16>),
    Latin1(Vec<u8>),
    // Unknown encoding: decoded as UTF-8 with replacement characters.
    Bytes(Vec<u8>),
}

impl Text {
    /// Canonical UTF-8 form; invalid sequences become U+FFFD.
    pub fn to_utf8(&self) -> String {
        match self {
            Text::Utf8(s) => s.clone(),
            Text::Utf16(units) => String::from_utf16_lossy(trim_nul_u16(units)),
            Text::Latin1(bytes) => bytes.iter().map(|&b| char::from(b)).collect(),
            Text::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

// Wide strings from the management API are frequently NUL terminated.
fn trim_nul_u16(units: &[u16]) -> &[u16] {
    match units.iter().position(|&u| u == 0) {
        Some(end) => &units[..end],
        None => units,
    }
}

impl From<String> for Text {
    fn from(value: String) -> Self {
        Text::Utf8(value)
    }
}

impl From<&str> for Text {
    fn from(value: &str) -> Self {
        Text::Utf8(value.to_string())
    }
}

/// Value of a single record property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(Text),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Null,
    List(Vec<PropertyValue>),
    Object(Vec<(String, PropertyValue)>),
}

/// Why a value could not be carried into an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedValue(pub String);

impl PropertyValue {
    pub fn text(value: impl Into<Text>) -> Self {
        PropertyValue::Text(value.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Text(_) => "string",
            PropertyValue::Int(_) | PropertyValue::UInt(_) => "integer",
            PropertyValue::Float(_) => "float",
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Null => "null",
            PropertyValue::List(_) => "array",
            PropertyValue::Object(_) => "object",
        }
    }

    /// Converts to the event representation, normalizing strings to UTF-8.
    pub fn to_json(&self) -> Result<Value, UnsupportedValue> {
        Ok(match self {
            PropertyValue::Text(text) => Value::String(text.to_utf8()),
            PropertyValue::Int(v) => Value::Number(Number::from(*v)),
            PropertyValue::UInt(v) => Value::Number(Number::from(*v)),
            PropertyValue::Float(v) => Number::from_f64(*v)
                .map(Value::Number)
                .ok_or_else(|| UnsupportedValue(format!("non-finite float {v}")))?,
            PropertyValue::Bool(v) => Value::Bool(*v),
            PropertyValue::Null => Value::Null,
            PropertyValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(PropertyValue::to_json)
                    .collect::<Result<_, _>>()?,
            ),
            PropertyValue::Object(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = value
                        .to_json()
                        .map_err(|e| UnsupportedValue(format!("{key}: {}", e.0)))?;
                    map.insert(key.clone(), value);
                }
                Value::Object(map)
            }
        })
    }

    /// Maps a decoded JSON document onto property values.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropertyValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    PropertyValue::UInt(u)
                } else {
                    PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => PropertyValue::Text(Text::Utf8(s)),
            Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(PropertyValue::from_json).collect())
            }
            Value::Object(map) => PropertyValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, PropertyValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::UInt(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::text(value)
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::text(value)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(PropertyValue::Null, Into::into)
    }
}
