use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeMap, HashMap};

use tokio_util::sync::CancellationToken;

use crate::bm25::Bm25;
use crate::collect::facet::{FacetAccumulator, FacetResult, FacetSpec};
use crate::collect::matcher::eval_segment;
use crate::collect::sort::{SortCell, SortKey, SortKeyRef, SortSpec};
use crate::error::{EngineError, Result};
use crate::index::{IndexReader, SegmentReader};
use crate::model::{ChildBinding, Document};
use crate::query::ast::GroupBy;
use crate::query::compile::CompiledQuery;

/// Раз в столько документов коллектор смотрит на токен отмены.
const CANCEL_CHECK_EVERY: u32 = 512;

/// Привязка join-а на входе коллектора: дети материализуются
/// один раз на шард на запрос, не на сегмент.
pub struct ForeignKeyBound {
    pub field: String,
    pub child_namespace: String,
    pub child_by_pk: HashMap<String, Document>,
}

pub struct CollectParams<'a> {
    /// limit + offset; брокер режет дальше.
    pub cap: usize,
    pub sort_by: &'a [SortSpec],
    pub facets: &'a [FacetSpec],
    pub total_hits_threshold: u64,
    pub pure_filter: bool,
    pub context_features: &'a BTreeMap<String, f64>,
    pub ct: &'a CancellationToken,
}

pub struct Collected {
    pub docs: Vec<Document>,
    pub total_matched: u64,
    pub facets: Vec<FacetResult>,
    pub facets_approximate: bool,
    pub io_dropped: u64,
}

struct Cand {
    key: SortKey,
    global_doc: u64,
    doc: Document,
}

impl PartialEq for Cand {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.global_doc == other.global_doc
    }
}
impl Eq for Cand {}
impl PartialOrd for Cand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Cand {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.global_doc.cmp(&other.global_doc))
    }
}

/// Один проход по сегментам в порядке leaf_ord. Поддерживает ограниченную
/// min-кучу размера cap; фазовый ключ строится лениво — хвостовые фазы
/// пропускаются, когда префикс уже строго хуже худшего принятого.
pub fn collect(
    index: &dyn IndexReader,
    compiled: &CompiledQuery,
    binds: &[ForeignKeyBound],
    p: &CollectParams<'_>,
) -> Result<Collected> {
    let bm25 = Bm25::default();
    let mut heap: BinaryHeap<Cand> = BinaryHeap::with_capacity(p.cap + 1);
    let mut accs: Vec<FacetAccumulator> =
        p.facets.iter().cloned().map(FacetAccumulator::new).collect();
    let mut total_matched = 0u64;
    let mut facet_seen = 0u64;
    let mut facets_approximate = false;
    let mut io_dropped = 0u64;

    for (leaf_ord, seg) in index.leaves().iter().enumerate() {
        if p.ct.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let base = index.base_of(leaf_ord);
        let matches = eval_segment(seg.as_ref(), compiled, &bm25)?;
        total_matched += matches.docs.cardinality();

        // Кэш ординал → ребёнок, свой на сегмент.
        let mut child_cache: Vec<HashMap<u32, Option<Document>>> =
            binds.iter().map(|_| HashMap::new()).collect();

        let mut since_check = 0u32;
        for doc in matches.docs.iter() {
            since_check += 1;
            if since_check >= CANCEL_CHECK_EVERY {
                since_check = 0;
                if p.ct.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
            }

            if facet_seen < p.total_hits_threshold {
                for acc in accs.iter_mut() {
                    acc.update(seg.as_ref(), doc);
                }
                facet_seen += 1;
            } else if !accs.is_empty() {
                facets_approximate = true;
            }

            if p.cap == 0 {
                continue;
            }

            let score = if p.pure_filter {
                0.0
            } else {
                matches.score_of(doc)
            };
            let global_doc = base + doc as u64;

            let Some(key) = phased_key(seg.as_ref(), p, doc, score, global_doc, &heap) else {
                continue;
            };

            let primary_key = match seg.primary_key(doc) {
                Ok(pk) => pk,
                Err(_) => {
                    io_dropped += 1;
                    continue;
                }
            };
            let mut out = Document {
                leaf_ord: leaf_ord as u32,
                leaf_doc: doc,
                global_doc,
                primary_key,
                score,
                sort_key: key.clone(),
                fields: Vec::new(),
                children: Vec::new(),
            };
            bind_children(seg.as_ref(), doc, binds, &mut child_cache, &mut out);

            heap.push(Cand {
                key,
                global_doc,
                doc: out,
            });
            if heap.len() > p.cap {
                heap.pop();
            }
        }
    }

    let docs = heap
        .into_sorted_vec()
        .into_iter()
        .map(|c| c.doc)
        .collect();
    Ok(Collected {
        docs,
        total_matched,
        facets: accs.into_iter().map(FacetAccumulator::finish).collect(),
        facets_approximate,
        io_dropped,
    })
}

/// Строит кортеж пофазно. None — кандидат отсечён префиксом.
fn phased_key(
    seg: &dyn SegmentReader,
    p: &CollectParams<'_>,
    doc: u32,
    score: f32,
    global_doc: u64,
    heap: &BinaryHeap<Cand>,
) -> Option<SortKey> {
    let worst = if heap.len() == p.cap {
        heap.peek()
    } else {
        None
    };
    let mut cells: Vec<SortCell> = Vec::with_capacity(p.sort_by.len());
    for (i, spec) in p.sort_by.iter().enumerate() {
        cells.push(cell_for(seg, spec, doc, score, global_doc, p.context_features));
        if let Some(w) = worst {
            match cells.as_slice().cmp(&w.key.0[..=i]) {
                Ordering::Greater => return None,
                Ordering::Less => {
                    // Строго лучше худшего — добираем хвост без сравнений.
                    for rest in &p.sort_by[i + 1..] {
                        cells.push(cell_for(seg, rest, doc, score, global_doc, p.context_features));
                    }
                    return Some(SortKey(cells));
                }
                Ordering::Equal => {}
            }
        }
    }
    if let Some(w) = worst {
        // Полное равенство ключа: решает globalDocId по возрастанию.
        if global_doc >= w.global_doc {
            return None;
        }
    }
    Some(SortKey(cells))
}

fn cell_for(
    seg: &dyn SegmentReader,
    spec: &SortSpec,
    doc: u32,
    score: f32,
    global_doc: u64,
    ctx: &BTreeMap<String, f64>,
) -> SortCell {
    let desc = matches!(spec.direction, crate::collect::sort::Direction::Desc);
    match &spec.key {
        SortKeyRef::Score => SortCell::from_f64(desc, score as f64),
        SortKeyRef::DocId => SortCell::from_u64(desc, global_doc),
        SortKeyRef::ContextFeature(name) => match ctx.get(name) {
            Some(v) => SortCell::from_f64(desc, *v),
            None => SortCell::missing(desc),
        },
        SortKeyRef::Field(name) => {
            if let Some(v) = seg.numeric(name, doc) {
                SortCell::from_f64(desc, v)
            } else if let Some(col) = seg.sorted_set(name) {
                match col.first_value(doc) {
                    Some(s) => SortCell::from_str(desc, s),
                    None => SortCell::missing(desc),
                }
            } else {
                SortCell::missing(desc)
            }
        }
    }
}

fn bind_children(
    seg: &dyn SegmentReader,
    doc: u32,
    binds: &[ForeignKeyBound],
    cache: &mut [HashMap<u32, Option<Document>>],
    out: &mut Document,
) {
    for (bi, bound) in binds.iter().enumerate() {
        let Some(col) = seg.sorted_set(&bound.field) else {
            continue;
        };
        let mut docs: Vec<Document> = Vec::new();
        for &ord in col.ords(doc) {
            let resolved = cache[bi].entry(ord).or_insert_with(|| {
                col.value_of(ord)
                    .and_then(|v| bound.child_by_pk.get(v))
                    .cloned()
            });
            // Чужой шард или не прошедший inner-фильтр ребёнок — молча мимо.
            if let Some(child) = resolved {
                docs.push(child.clone());
            }
        }
        if !docs.is_empty() {
            out.children.push(ChildBinding {
                namespace: bound.child_namespace.clone(),
                docs,
            });
        }
    }
}

/// Коллапс по группе: не больше group_limit документов на значение поля,
/// порядок входа сохраняется. Документы без значения не группируются.
pub fn group_collapse(docs: Vec<Document>, group_by: Option<&GroupBy>) -> Vec<Document> {
    let Some(g) = group_by else {
        return docs;
    };
    let mut seen: HashMap<String, usize> = HashMap::new();
    docs.into_iter()
        .filter(|d| match d.field(&g.field) {
            None => true,
            Some(v) => {
                let key = serde_json::to_string(v).unwrap_or_default();
                let n = seen.entry(key).or_insert(0);
                *n += 1;
                *n <= g.group_limit
            }
        })
        .collect()
}
