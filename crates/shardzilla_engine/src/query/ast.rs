use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::collect::facet::FacetSpec;
use crate::collect::sort::SortSpec;
use crate::model::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occur {
    Must,
    MustNot,
    Should,
    Filter,
}

/// Замкнутое фильтровое дерево. Переписывается планировщиком,
/// опускается компилятором в сегментный план.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Term {
        field: String,
        value: Value,
    },
    TermInSet {
        field: String,
        values: Vec<Value>,
    },
    PointRange {
        field: String,
        lo: Option<Value>,
        hi: Option<Value>,
    },
    GeoDistance {
        field: String,
        lat: f64,
        lon: f64,
        meters: f64,
    },
    Vector {
        field: String,
        target: Vec<f32>,
        k: usize,
        filter: Option<Box<Filter>>,
    },
    Boolean {
        clauses: Vec<(Occur, Filter)>,
        #[serde(default)]
        min_should_match: usize,
    },
    /// Материализуется в TermInSet из гидратированных inner-результатов.
    ReferenceFieldInSet {
        field: String,
        ref_namespace: String,
        ref_field: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordGroup {
    pub fields: Vec<String>,
    pub terms: Vec<String>,
    pub occur: Occur,
    #[serde(default)]
    pub min_should_match: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    pub field: String,
    pub target: Vec<f32>,
    pub k: usize,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyQuery {
    pub field: String,
    pub term: String,
    #[serde(default = "default_max_edits")]
    pub max_edits: u32,
}

fn default_max_edits() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keywords {
    #[serde(default)]
    pub groups: Vec<KeywordGroup>,
    #[serde(default)]
    pub vector_queries: Vec<VectorQuery>,
    #[serde(default)]
    pub fuzzy: Vec<FuzzyQuery>,
    /// Сырой пользовательский ввод; только для логов, ранжирование его не видит.
    #[serde(default)]
    pub client_keywords: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub inner_search_queries: Vec<SearchQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBy {
    pub field: String,
    #[serde(default = "default_group_limit")]
    pub group_limit: usize,
}

fn default_group_limit() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    MaxScore,
    FirstSeen,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dedup {
    pub policy: DedupPolicy,
}

/// L2-правило: чистая функция над (документ, контекст запроса), может менять score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reordering {
    WeightFeature { feature: String, weight: f32 },
    BoostField { field: String, value: Value, factor: f32 },
    Decay { field: String, origin: f64, scale: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub namespace: String,
    #[serde(default)]
    pub keywords: Option<Keywords>,
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub join: Option<Join>,
    #[serde(default)]
    pub group_by: Option<GroupBy>,
    #[serde(default)]
    pub facets: Vec<FacetSpec>,
    #[serde(default)]
    pub return_fields: Vec<String>,
    #[serde(default)]
    pub context_features: BTreeMap<String, f64>,
    #[serde(default)]
    pub sort_by: Vec<SortSpec>,
    #[serde(default)]
    pub dedup: Option<Dedup>,
    #[serde(default)]
    pub reorderings: Vec<Reordering>,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl SearchQuery {
    /// Минимальный запрос: всё в namespace, сортировка по умолчанию.
    pub fn all(namespace: impl Into<String>, limit: usize) -> Self {
        SearchQuery {
            namespace: namespace.into(),
            keywords: None,
            filter: None,
            join: None,
            group_by: None,
            facets: Vec::new(),
            return_fields: Vec::new(),
            context_features: BTreeMap::new(),
            sort_by: Vec::new(),
            dedup: None,
            reorderings: Vec::new(),
            limit,
            offset: 0,
        }
    }
}
