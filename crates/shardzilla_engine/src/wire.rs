// Wire-модели и кодек. FLAT_NORMALIZED: дети всех документов лежат одной
// плоской коллекцией, родители ссылаются смещениями. Сжатый вариант —
// lz4-блок с магией и исходной длиной, каждое сообщение самодостаточно.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::collect::facet::FacetResult;
use crate::collect::sort::SortKey;
use crate::error::{EngineError, Result};
use crate::exec::ShardHits;
use crate::model::{ChildBinding, Document, Value};
use crate::query::ast::SearchQuery;

pub const WIRE_VERSION: u32 = 1;
const COMPRESSED_MAGIC: &[u8; 4] = b"SZW1";
/// Смещения детей идут только назад, но на чужих байтах страхуемся от циклов.
const MAX_CHILD_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    FlatNormalized,
    FlatNormalizedCompressed,
}

impl Default for WireFormat {
    fn default() -> Self {
        WireFormat::FlatNormalized
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOffsets {
    pub namespace: String,
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    pub primary_key: String,
    pub global_doc: u64,
    pub fields: Vec<(String, Value)>,
    pub sort_by_values: SortKey,
    pub score: f32,
    #[serde(default)]
    pub child_offsets: Vec<ChildOffsets>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard: u32,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchMetrics {
    pub collect_ms: u64,
    pub io_dropped: u64,
    #[serde(default)]
    pub fanout_ms: Option<u64>,
    #[serde(default)]
    pub dedup_dropped: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    pub version: u32,
    pub documents: Vec<WireDocument>,
    pub children: Vec<WireDocument>,
    pub total_matched: u64,
    pub per_namespace: BTreeMap<String, u64>,
    pub facets: Vec<FacetResult>,
    pub facets_approximate: bool,
    pub partial: bool,
    /// Документы, выброшенные по сбоям чтения; всегда на проводе,
    /// metrics ниже — только по запросу.
    #[serde(default)]
    pub io_dropped: u64,
    #[serde(default)]
    pub shard_statuses: Vec<ShardStatus>,
    #[serde(default)]
    pub metrics: Option<SearchMetrics>,
}

/// Подсказка маршрутизации из запроса.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum Route {
    Key(String),
    MicroShards(Vec<u32>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRequest {
    pub namespace: String,
    pub query: SearchQuery,
    #[serde(default)]
    pub route: Option<Route>,
    #[serde(default)]
    pub include_metrics: bool,
    #[serde(default)]
    pub format: WireFormat,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearcherRequest {
    pub shard_id: u32,
    pub query: SearchQuery,
    #[serde(default)]
    pub include_metrics: bool,
    #[serde(default)]
    pub format: WireFormat,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Хинт плана: потолок документов на фасеты/приближённые счётчики.
    #[serde(default)]
    pub pruning_budget: Option<u64>,
}

/// Тело ошибки HTTP-слоя; kind — стабильный тег EngineError.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn of(e: &EngineError) -> Self {
        Self {
            error: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

// --- нормализация ---

fn flatten_doc(doc: &Document, children: &mut Vec<WireDocument>) -> WireDocument {
    let mut offsets = Vec::with_capacity(doc.children.len());
    for binding in &doc.children {
        let flat: Vec<WireDocument> = binding
            .docs
            .iter()
            .map(|c| flatten_doc(c, children))
            .collect();
        let start = children.len() as u32;
        let len = flat.len() as u32;
        children.extend(flat);
        offsets.push(ChildOffsets {
            namespace: binding.namespace.clone(),
            start,
            len,
        });
    }
    WireDocument {
        primary_key: doc.primary_key.clone(),
        global_doc: doc.global_doc,
        fields: doc.fields.clone(),
        sort_by_values: doc.sort_key.clone(),
        score: doc.score,
        child_offsets: offsets,
    }
}

fn unflatten_doc(
    wd: &WireDocument,
    children: &[WireDocument],
    depth: usize,
) -> Result<Document> {
    if depth > MAX_CHILD_DEPTH {
        return Err(EngineError::Decode("child nesting too deep".into()));
    }
    let mut bindings = Vec::with_capacity(wd.child_offsets.len());
    for off in &wd.child_offsets {
        let start = off.start as usize;
        let end = start + off.len as usize;
        let slice = children
            .get(start..end)
            .ok_or_else(|| EngineError::Decode("child offsets out of range".into()))?;
        let docs = slice
            .iter()
            .map(|c| unflatten_doc(c, children, depth + 1))
            .collect::<Result<Vec<_>>>()?;
        bindings.push(ChildBinding {
            namespace: off.namespace.clone(),
            docs,
        });
    }
    Ok(Document {
        leaf_ord: 0,
        leaf_doc: 0,
        global_doc: wd.global_doc,
        primary_key: wd.primary_key.clone(),
        score: wd.score,
        sort_key: wd.sort_by_values.clone(),
        fields: wd.fields.clone(),
        children: bindings,
    })
}

/// Сборка payload из результата шарда/брокера.
pub fn payload_from_docs(docs: &[Document], hits: &ShardHits) -> WirePayload {
    let mut children = Vec::new();
    let documents = docs
        .iter()
        .map(|d| flatten_doc(d, &mut children))
        .collect();
    WirePayload {
        version: WIRE_VERSION,
        documents,
        children,
        total_matched: hits.total_matched,
        per_namespace: hits.per_namespace.clone(),
        facets: hits.facets.clone(),
        facets_approximate: hits.facets_approximate,
        partial: false,
        io_dropped: hits.io_dropped,
        shard_statuses: Vec::new(),
        metrics: None,
    }
}

/// Восстановление документов с привязанными детьми.
pub fn documents_from_payload(payload: &WirePayload) -> Result<Vec<Document>> {
    payload
        .documents
        .iter()
        .map(|wd| unflatten_doc(wd, &payload.children, 0))
        .collect()
}

// --- кодек ---

pub fn encode(payload: &WirePayload, format: WireFormat) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    match format {
        WireFormat::FlatNormalized => Ok(json),
        WireFormat::FlatNormalizedCompressed => {
            let compressed = lz4::block::compress(&json, None, false)
                .map_err(|e| EngineError::Io(e.to_string()))?;
            let mut out = Vec::with_capacity(8 + compressed.len());
            out.extend_from_slice(COMPRESSED_MAGIC);
            out.extend_from_slice(&(json.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Формат определяется по магии; версия сверяется жёстко.
pub fn decode(bytes: &[u8]) -> Result<WirePayload> {
    let payload: WirePayload = if bytes.starts_with(COMPRESSED_MAGIC) {
        if bytes.len() < 8 {
            return Err(EngineError::Decode("truncated compressed payload".into()));
        }
        let orig = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let json = lz4::block::decompress(&bytes[8..], Some(orig as i32))
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        serde_json::from_slice(&json)?
    } else {
        serde_json::from_slice(bytes)?
    };
    if payload.version != WIRE_VERSION {
        return Err(EngineError::Decode(format!(
            "unsupported wire version {}",
            payload.version
        )));
    }
    Ok(payload)
}
