// Узкий порт чтения сегментированного индекса. Ядро запросов зависит
// только от этих трейтов; поставка — JSON-сегменты (segjson).

pub mod segjson;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use croaring::Bitmap;

use crate::error::{EngineError, Result};
use crate::model::Value;
use crate::schema::Catalog;

/// Постинги одного терма: кандидаты + частоты для скоринга.
#[derive(Clone)]
pub struct Postings {
    pub docs: Bitmap,
    pub doc_freq: u32,
    pub tf: HashMap<u32, u32>,
}

impl Postings {
    pub fn empty() -> Self {
        Self {
            docs: Bitmap::new(),
            doc_freq: 0,
            tf: HashMap::new(),
        }
    }
}

/// Sorted-set колонка: ординалы на документ, словарь ординал → значение.
/// Ординальная итерация не трогает stored fields.
#[derive(Debug, Default)]
pub struct SortedSetColumn {
    pub values: Vec<String>,
    per_doc: HashMap<u32, Vec<u32>>,
}

impl SortedSetColumn {
    pub fn from_rows(rows: &[(u32, Vec<String>)]) -> Self {
        let mut values: Vec<String> = rows
            .iter()
            .flat_map(|(_, vs)| vs.iter().cloned())
            .collect();
        values.sort();
        values.dedup();
        let mut per_doc = HashMap::new();
        for (doc, vs) in rows {
            let mut ords: Vec<u32> = vs
                .iter()
                .filter_map(|v| values.binary_search(v).ok().map(|i| i as u32))
                .collect();
            ords.sort_unstable();
            ords.dedup();
            per_doc.insert(*doc, ords);
        }
        Self { values, per_doc }
    }

    pub fn ords(&self, doc: u32) -> &[u32] {
        self.per_doc.get(&doc).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn value_of(&self, ord: u32) -> Option<&str> {
        self.values.get(ord as usize).map(String::as_str)
    }

    pub fn first_value(&self, doc: u32) -> Option<&str> {
        self.ords(doc).first().and_then(|&o| self.value_of(o))
    }
}

pub trait SegmentReader: Send + Sync {
    fn doc_count(&self) -> u32;
    fn live_docs(&self) -> Bitmap;
    fn postings(&self, field: &str, term: &str) -> Option<Postings>;
    /// Terms enum поля (для fuzzy-разворачивания).
    fn terms(&self, field: &str) -> Vec<String>;
    /// Числовой диапазон, границы включительно.
    fn range(&self, field: &str, lo: Option<f64>, hi: Option<f64>) -> Bitmap;
    fn geo_within(&self, field: &str, lat: f64, lon: f64, meters: f64) -> Bitmap;
    /// Точный top-k по косинусу; ANN-бэкенд — забота хранилища.
    fn vector_top_k(
        &self,
        field: &str,
        target: &[f32],
        k: usize,
        prefilter: Option<&Bitmap>,
    ) -> Vec<(u32, f32)>;
    fn sorted_set(&self, field: &str) -> Option<Arc<SortedSetColumn>>;
    fn numeric(&self, field: &str, doc: u32) -> Option<f64>;
    fn field_len(&self, field: &str, doc: u32) -> u32;
    fn avg_field_len(&self, field: &str) -> f32;
    fn primary_key(&self, doc: u32) -> Result<String>;
    fn stored(&self, doc: u32, fields: &[String]) -> Result<Vec<(String, Value)>>;
}

pub trait IndexReader: Send + Sync {
    fn leaves(&self) -> &[Arc<dyn SegmentReader>];
    fn base_of(&self, leaf_ord: usize) -> u64;
}

/// Список сегментов со стабильными ординалами.
pub struct SegmentedIndex {
    segments: Vec<Arc<dyn SegmentReader>>,
    bases: Vec<u64>,
}

impl SegmentedIndex {
    pub fn new(segments: Vec<Arc<dyn SegmentReader>>) -> Self {
        let mut bases = Vec::with_capacity(segments.len());
        let mut base = 0u64;
        for seg in &segments {
            bases.push(base);
            base += seg.doc_count() as u64;
        }
        Self { segments, bases }
    }
}

impl IndexReader for SegmentedIndex {
    fn leaves(&self) -> &[Arc<dyn SegmentReader>] {
        &self.segments
    }

    fn base_of(&self, leaf_ord: usize) -> u64 {
        self.bases.get(leaf_ord).copied().unwrap_or(0)
    }
}

/// Неизменяемый read view шарда: namespace → его индекс.
pub struct Snapshot {
    indexes: BTreeMap<String, Arc<dyn IndexReader>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            indexes: BTreeMap::new(),
        }
    }

    pub fn from_indexes(indexes: BTreeMap<String, Arc<dyn IndexReader>>) -> Self {
        Self { indexes }
    }

    /// Открывает каталог шарда: `<dir>/<namespace>/<segment>/…`,
    /// сегменты в лексикографическом порядке имён — ординалы стабильны.
    pub fn open(dir: &Path, catalog: &Catalog) -> Result<Self> {
        let mut indexes: BTreeMap<String, Arc<dyn IndexReader>> = BTreeMap::new();
        for ns in catalog.namespaces.keys() {
            let ns_dir = dir.join(ns);
            if !ns_dir.is_dir() {
                continue;
            }
            let mut seg_dirs: Vec<_> = std::fs::read_dir(&ns_dir)
                .map_err(|e| EngineError::IndexUnavailable(format!("{}: {e}", ns_dir.display())))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.join("meta.json").is_file())
                .collect();
            seg_dirs.sort();
            let mut segments: Vec<Arc<dyn SegmentReader>> = Vec::with_capacity(seg_dirs.len());
            for sd in seg_dirs {
                segments.push(Arc::new(segjson::JsonSegment::open(&sd)?));
            }
            indexes.insert(ns.clone(), Arc::new(SegmentedIndex::new(segments)));
        }
        Ok(Self { indexes })
    }

    pub fn index(&self, namespace: &str) -> Result<&Arc<dyn IndexReader>> {
        self.indexes.get(namespace).ok_or_else(|| {
            EngineError::IndexUnavailable(format!("no index for namespace '{namespace}'"))
        })
    }
}

/// Держатель снапшота: рефреш атомарно подменяет read view,
/// запросы в полёте дорабатывают на своей копии.
pub struct SnapshotHolder {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotHolder {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn acquire(&self) -> Arc<Snapshot> {
        self.current.read().expect("snapshot lock poisoned").clone()
    }

    pub fn install(&self, snapshot: Snapshot) {
        *self.current.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
    }
}
