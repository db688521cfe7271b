// Фикстуры брокерных тестов: каталог item/store, in-process клиенты
// (реальный движок или заскриптованный ответ) и сборка шардовых индексов.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use broker::client::SearcherClient;
use broker::config::BrokerConfig;
use broker::search::Broker;
use shardzilla_engine::collect::sort::{SortCell, SortKey};
use shardzilla_engine::exec::ShardHits;
use shardzilla_engine::index::{segjson, Snapshot};
use shardzilla_engine::model::Document;
use shardzilla_engine::schema::{
    Catalog, Container, FieldKind, FieldSpec, ForeignKeySpec, NamespaceSchema, ShardingSpec,
};
use shardzilla_engine::wire::{self, SearcherRequest, WirePayload};
use shardzilla_engine::{EngineError, EngineLimits, QueryEngine, Result, Value};

pub fn catalog(shards: u32) -> Catalog {
    let mut namespaces = BTreeMap::new();
    namespaces.insert(
        "store".into(),
        NamespaceSchema {
            name: "store".into(),
            primary_key: "id".into(),
            fields: vec![
                field("id", FieldKind::Str),
                field("rating", FieldKind::I64),
                field("city", FieldKind::Str),
            ],
            foreign_keys: vec![],
        },
    );
    namespaces.insert(
        "item".into(),
        NamespaceSchema {
            name: "item".into(),
            primary_key: "id".into(),
            fields: vec![
                field("id", FieldKind::Str),
                field("popularity", FieldKind::F64),
                field("price", FieldKind::I64),
                field("store_id", FieldKind::Str),
            ],
            foreign_keys: vec![ForeignKeySpec {
                field: "store_id".into(),
                container: Container::Scalar,
                children: vec!["store".into()],
                required: false,
            }],
        },
    );
    Catalog {
        namespaces,
        sharding: ShardingSpec {
            shards,
            micro_shards: shards * 4,
            route_field: "id".into(),
        },
    }
}

fn field(name: &str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name: name.into(),
        kind,
        container: Container::Scalar,
        doc_values: true,
        stored: true,
    }
}

pub fn s(v: &str) -> Value {
    Value::Str(v.into())
}

pub fn i(v: i64) -> Value {
    Value::I64(v)
}

pub fn f(v: f64) -> Value {
    Value::F64(v)
}

pub fn doc(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn write_shard(
    shard_dir: &Path,
    cat: &Catalog,
    ns: &str,
    docs: &[BTreeMap<String, Value>],
) {
    let schema = cat.namespaces.get(ns).expect("fixture namespace");
    segjson::write_segment(schema, docs, &shard_dir.join(ns).join("seg-000")).expect("segment");
}

/// In-process клиент поверх настоящего движка одного шарда.
pub struct EngineClient {
    shard: u32,
    engine: QueryEngine,
    calls: AtomicUsize,
}

impl EngineClient {
    pub fn open(shard: u32, shard_dir: &Path, cat: &Catalog) -> Arc<Self> {
        let snapshot = Snapshot::open(shard_dir, cat).expect("open shard snapshot");
        Arc::new(Self {
            shard,
            engine: QueryEngine::new(
                Arc::new(cat.clone()),
                Arc::new(snapshot),
                EngineLimits::default(),
            ),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SearcherClient for EngineClient {
    fn shard_id(&self) -> u32 {
        self.shard
    }

    async fn search(&self, req: &SearcherRequest) -> Result<WirePayload> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let hits = self
            .engine
            .search(&req.query, CancellationToken::new())
            .await?;
        Ok(wire::payload_from_docs(&hits.docs, &hits))
    }
}

/// Заскриптованный клиент: готовый payload, ошибка по тегу или вечный сон.
pub struct ScriptedClient {
    shard: u32,
    payload: Option<WirePayload>,
    error_kind: Option<&'static str>,
    delay_ms: u64,
}

impl ScriptedClient {
    pub fn ok(shard: u32, payload: WirePayload) -> Arc<Self> {
        Arc::new(Self {
            shard,
            payload: Some(payload),
            error_kind: None,
            delay_ms: 0,
        })
    }

    pub fn failing(shard: u32, kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            shard,
            payload: None,
            error_kind: Some(kind),
            delay_ms: 0,
        })
    }

    pub fn slow(shard: u32, payload: WirePayload, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            shard,
            payload: Some(payload),
            error_kind: None,
            delay_ms,
        })
    }
}

#[async_trait]
impl SearcherClient for ScriptedClient {
    fn shard_id(&self) -> u32 {
        self.shard
    }

    async fn search(&self, _req: &SearcherRequest) -> Result<WirePayload> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if let Some(kind) = self.error_kind {
            return Err(EngineError::from_kind(kind, "scripted failure".into()));
        }
        Ok(self.payload.clone().expect("scripted payload"))
    }
}

/// Документ с дефолтным ключом сортировки score desc — под заскриптованные ответы.
pub fn scored_doc(pk: &str, global_doc: u64, score: f32) -> Document {
    Document {
        leaf_ord: 0,
        leaf_doc: global_doc as u32,
        global_doc,
        primary_key: pk.into(),
        score,
        sort_key: SortKey(vec![SortCell::from_f64(true, score as f64)]),
        fields: Vec::new(),
        children: Vec::new(),
    }
}

pub fn payload_of(docs: Vec<Document>) -> WirePayload {
    let hits = ShardHits {
        docs: Vec::new(),
        total_matched: docs.len() as u64,
        per_namespace: [("item".to_string(), docs.len() as u64)].into_iter().collect(),
        facets: Vec::new(),
        facets_approximate: false,
        io_dropped: 0,
    };
    wire::payload_from_docs(&docs, &hits)
}

pub fn broker_config() -> BrokerConfig {
    BrokerConfig {
        addr: "127.0.0.1:0".into(),
        catalog_path: String::new(),
        searchers: Vec::new(),
        deadline_ms: 2_000,
        lookahead: 32,
    }
}

pub fn broker_of(cat: &Catalog, clients: Vec<Arc<dyn SearcherClient>>) -> Broker {
    Broker::new(Arc::new(cat.clone()), clients, broker_config())
}
