use serde_json::{Map, Number, Value as JsonValue};

use crate::{Dictionary, Format, FormatError, Value};

const NAME: &str = "JSON";

/// JSON encoding of the value tree. JSON has no blob type, so `Value::Data` only survives
/// deserialization in the sense that it never appears; serializing one fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Json {
    pub pretty: bool,
}

impl Json {
    pub fn new() -> Json {
        Json { pretty: false }
    }

    pub fn pretty_printed() -> Json {
        Json { pretty: true }
    }
}

fn invalid<S: Into<String>>(message: S) -> FormatError {
    FormatError::Invalid {
        format: NAME,
        message: message.into(),
    }
}

fn unsupported(what: &'static str) -> FormatError {
    FormatError::Unsupported { format: NAME, what }
}

fn from_json(value: JsonValue) -> Result<Value, FormatError> {
    Ok(match value {
        JsonValue::Null => return Err(invalid("null has no property list equivalent")),
        JsonValue::Bool(b) => Value::Boolean(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Real(f)
            } else {
                return Err(invalid(format!("number {} out of range", n)));
            }
        }
        JsonValue::String(s) => Value::String(s),
        JsonValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        JsonValue::Object(map) => {
            let mut dict = Dictionary::new();
            for (k, v) in map {
                dict.insert(k, from_json(v)?);
            }
            Value::Dictionary(dict)
        }
    })
}

fn to_json(value: &Value) -> Result<JsonValue, FormatError> {
    Ok(match value {
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Integer(i) => JsonValue::Number((*i).into()),
        Value::Real(r) => JsonValue::Number(
            Number::from_f64(*r).ok_or_else(|| unsupported("a non-finite real"))?,
        ),
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Data(_) => return Err(unsupported("data")),
        Value::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Dictionary(dict) => {
            let mut map = Map::with_capacity(dict.len());
            for (k, v) in dict.iter() {
                map.insert(k.to_owned(), to_json(v)?);
            }
            JsonValue::Object(map)
        }
    })
}

impl Format for Json {
    fn name(&self) -> &'static str {
        NAME
    }

    fn identify(&self, contents: &[u8]) -> bool {
        matches!(
            contents.iter().find(|b| !b.is_ascii_whitespace()),
            Some(b'{') | Some(b'[')
        )
    }

    fn deserialize(&self, contents: &[u8]) -> Result<Value, FormatError> {
        let parsed: JsonValue =
            serde_json::from_slice(contents).map_err(|e| invalid(e.to_string()))?;
        from_json(parsed)
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, FormatError> {
        let json = to_json(value)?;
        let result = if self.pretty {
            serde_json::to_vec_pretty(&json)
        } else {
            serde_json::to_vec(&json)
        };
        result.map_err(|e| invalid(e.to_string()))
    }
}
