use std::collections::BTreeMap;
use std::fs::File;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{EngineError, Result};

/// Скрытое поле-терм с именем namespace (прокидывается планировщиком).
pub const NAMESPACE_FIELD: &str = "_namespace";
/// Префикс обратных ссылочных термов: `_ref.<child_namespace>` → значение FK.
pub const REF_FIELD_PREFIX: &str = "_ref.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Scalar,
    List,
}

impl Default for Container {
    fn default() -> Self {
        Container::Scalar
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Str,
    I64,
    F64,
    Bool,
    Geo,
    Vector { dim: usize },
}

impl FieldKind {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::I64 | FieldKind::F64 | FieldKind::Bool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub container: Container,
    #[serde(default)]
    pub doc_values: bool,
    #[serde(default = "default_stored")]
    pub stored: bool,
}

fn default_stored() -> bool {
    true
}

/// Объявление внешнего ключа: строковое поле, значения которого —
/// первичные ключи документов одного из дочерних namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    pub field: String,
    #[serde(default)]
    pub container: Container,
    pub children: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSchema {
    pub name: String,
    pub primary_key: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
}

impl NamespaceSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn foreign_key(&self, field: &str) -> Option<&ForeignKeySpec> {
        self.foreign_keys.iter().find(|fk| fk.field == field)
    }

    /// FK, через который outer namespace достаёт документы `child`.
    /// Несколько кандидатов — ошибка валидации, молча выбирать нельзя.
    pub fn foreign_key_to(&self, child: &str) -> Result<&ForeignKeySpec> {
        let mut hits = self
            .foreign_keys
            .iter()
            .filter(|fk| fk.children.iter().any(|c| c == child));
        let first = hits.next().ok_or_else(|| {
            EngineError::invalid(
                "join",
                format!("namespace '{}' has no foreign key to '{}'", self.name, child),
            )
        })?;
        if hits.next().is_some() {
            return Err(EngineError::invalid(
                "join",
                format!(
                    "namespace '{}' has several foreign keys to '{}'",
                    self.name, child
                ),
            ));
        }
        Ok(first)
    }
}

/// Разбиение: S шардов, M микро-шардов, M кратно S.
/// Маппинг фиксирован на всё время жизни генерации индекса.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingSpec {
    pub shards: u32,
    pub micro_shards: u32,
    /// Поле-источник ключа маршрутизации (обычно primary key).
    pub route_field: String,
}

impl ShardingSpec {
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 || self.micro_shards == 0 {
            return Err(EngineError::invalid(
                "sharding",
                "shards and micro_shards must be positive",
            ));
        }
        if self.micro_shards % self.shards != 0 {
            return Err(EngineError::invalid(
                "sharding",
                format!(
                    "micro_shards {} not divisible by shards {}",
                    self.micro_shards, self.shards
                ),
            ));
        }
        Ok(())
    }

    pub fn micro_shard_of(&self, key: &str) -> u32 {
        (xxh3_64(key.as_bytes()) % self.micro_shards as u64) as u32
    }

    pub fn shard_of_micro(&self, micro: u32) -> u32 {
        micro / (self.micro_shards / self.shards)
    }

    pub fn shard_of_key(&self, key: &str) -> u32 {
        self.shard_of_micro(self.micro_shard_of(key))
    }
}

/// Статическое описание всех namespace и разбиения. Читается из catalog.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub namespaces: BTreeMap<String, NamespaceSchema>,
    pub sharding: ShardingSpec,
}

impl Catalog {
    pub fn load(path: &str) -> Result<Self> {
        let f = File::open(path)
            .map_err(|e| EngineError::IndexUnavailable(format!("catalog {path}: {e}")))?;
        let cat: Catalog = serde_json::from_reader(f)
            .map_err(|e| EngineError::IndexUnavailable(format!("catalog {path}: {e}")))?;
        cat.sharding.validate()?;
        Ok(cat)
    }

    pub fn namespace(&self, name: &str) -> Result<&NamespaceSchema> {
        self.namespaces
            .get(name)
            .ok_or_else(|| EngineError::invalid("namespace", format!("unknown namespace '{name}'")))
    }
}
