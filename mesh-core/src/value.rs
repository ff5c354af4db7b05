//! Document field values: JSON-compatible tagged variant, checked at the store boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum nesting depth of lists/maps inside a single field.
pub const MAX_VALUE_DEPTH: usize = 32;

/// A document's field map.
pub type Fields = BTreeMap<String, Value>;

/// One field value. Serialized untagged, so the wire form is plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Nesting depth: scalars are 0, a list of scalars is 1.
    pub fn depth(&self) -> usize {
        match self {
            Value::List(items) => 1 + items.iter().map(Value::depth).max().unwrap_or(0),
            Value::Map(map) => 1 + map.values().map(Value::depth).max().unwrap_or(0),
            _ => 0,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v.into())
    }
}

/// Non-finite floats have no JSON form and become `Null`.
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Field map rejected at the store boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("field names must be non-empty")]
    EmptyKey,
    #[error("field `{field}` nests deeper than {max} levels")]
    TooDeep { field: String, max: usize },
}

/// Check every field name (including nested map keys) and nesting depth.
pub fn validate_fields(fields: &Fields) -> Result<(), ValueError> {
    for (key, value) in fields {
        if key.is_empty() {
            return Err(ValueError::EmptyKey);
        }
        if value.depth() > MAX_VALUE_DEPTH {
            return Err(ValueError::TooDeep {
                field: key.clone(),
                max: MAX_VALUE_DEPTH,
            });
        }
        check_nested_keys(value)?;
    }
    Ok(())
}

fn check_nested_keys(value: &Value) -> Result<(), ValueError> {
    match value {
        Value::Map(map) => {
            for (k, v) in map {
                if k.is_empty() {
                    return Err(ValueError::EmptyKey);
                }
                check_nested_keys(v)?;
            }
            Ok(())
        }
        Value::List(items) => items.iter().try_for_each(check_nested_keys),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape_is_untagged() {
        let mut fields = Fields::new();
        fields.insert("name".into(), "cam-1".into());
        fields.insert("count".into(), 3i64.into());
        fields.insert("ok".into(), true.into());
        fields.insert("none".into(), Value::Null);
        fields.insert("tags".into(), vec![Value::from("a"), Value::from("b")].into());
        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(
            json,
            r#"{"count":3,"name":"cam-1","none":null,"ok":true,"tags":["a","b"]}"#
        );
        let back: Fields = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fields);
    }

    #[test]
    fn nested_map_parses_as_map() {
        let v: Value = serde_json::from_str(r#"{"a":{"b":[1,2.5,null]}}"#).unwrap();
        let Value::Map(outer) = &v else {
            panic!("expected map");
        };
        let Value::Map(inner) = &outer["a"] else {
            panic!("expected nested map");
        };
        let Value::List(items) = &inner["b"] else {
            panic!("expected list");
        };
        assert_eq!(items[0].as_i64(), Some(1));
        assert_eq!(items[1].as_f64(), Some(2.5));
        assert!(items[2].is_null());
        assert_eq!(v.depth(), 3);
    }

    #[test]
    fn non_finite_float_becomes_null() {
        assert!(Value::from(f64::NAN).is_null());
        assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn rejects_empty_keys() {
        let mut fields = Fields::new();
        fields.insert(String::new(), Value::Null);
        assert_eq!(validate_fields(&fields), Err(ValueError::EmptyKey));

        let mut nested = BTreeMap::new();
        nested.insert(String::new(), Value::from(1i64));
        let mut fields = Fields::new();
        fields.insert("outer".into(), Value::List(vec![Value::Map(nested)]));
        assert_eq!(validate_fields(&fields), Err(ValueError::EmptyKey));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut v = Value::Null;
        for _ in 0..=MAX_VALUE_DEPTH {
            v = Value::List(vec![v]);
        }
        let mut fields = Fields::new();
        fields.insert("deep".into(), v);
        assert!(matches!(
            validate_fields(&fields),
            Err(ValueError::TooDeep { .. })
        ));
    }
}
