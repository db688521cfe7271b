use serde::{Deserialize, Serialize};

use crate::collect::sort::SortKey;

/// Значение поля. Null-ов нет — отсутствие значения кодируется отсутствием поля.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Str(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Geo { lat: f64, lon: f64 },
    Vector(Vec<f32>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I64(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Привязанные дочерние документы одного namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildBinding {
    pub namespace: String,
    pub docs: Vec<Document>,
}

/// Документ в полёте: создаётся коллектором на матче, наполняется
/// гидратором и привязкой детей, уезжает в ответ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub leaf_ord: u32,
    pub leaf_doc: u32,
    pub global_doc: u64,
    pub primary_key: String,
    pub score: f32,
    pub sort_key: SortKey,
    /// Значения return_fields в порядке объявления запроса.
    pub fields: Vec<(String, Value)>,
    pub children: Vec<ChildBinding>,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}
