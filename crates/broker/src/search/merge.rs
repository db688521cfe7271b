// Сведение шардовых ответов: dedup → k-way merge → group collapse → L2.
// Полный порядок везде добивается (sort_key, shard, global_doc), поэтому
// результат детерминирован при одинаковом наборе ответов.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};

use shardzilla_engine::collect::sort::{Direction, SortCell, SortKeyRef, SortSpec};
use shardzilla_engine::model::Document;
use shardzilla_engine::query::ast::{DedupPolicy, GroupBy, Reordering};

/// Документы одного шарда, уже в шардовом порядке сортировки.
pub struct ShardDocs {
    pub shard: u32,
    pub docs: Vec<Document>,
}

pub struct MergedDoc {
    pub shard: u32,
    pub doc: Document,
}

/// Ключ по первичному ключу outer namespace. Возвращает число выброшенных.
pub fn dedup(parts: &mut Vec<ShardDocs>, policy: DedupPolicy) -> u64 {
    if matches!(policy, DedupPolicy::None) {
        return 0;
    }
    // pk → (shard, global_doc) победителя.
    let mut winners: HashMap<String, (u32, u64)> = HashMap::new();
    let view: &[ShardDocs] = parts;
    for part in view {
        for doc in &part.docs {
            let cand = (part.shard, doc.global_doc);
            match winners.entry(doc.primary_key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(cand);
                }
                Entry::Occupied(mut slot) => {
                    let best = *slot.get();
                    let replace = match policy {
                        DedupPolicy::MaxScore => beats_by_score(view, cand, best),
                        DedupPolicy::FirstSeen => beats_by_merge_order(view, cand, best),
                        DedupPolicy::None => false,
                    };
                    if replace {
                        slot.insert(cand);
                    }
                }
            }
        }
    }
    let mut dropped = 0u64;
    for part in parts.iter_mut() {
        let shard = part.shard;
        part.docs.retain(|d| {
            let keep = winners.get(&d.primary_key) == Some(&(shard, d.global_doc));
            if !keep {
                dropped += 1;
            }
            keep
        });
    }
    dropped
}

fn find_doc<'a>(parts: &'a [ShardDocs], key: (u32, u64)) -> Option<&'a Document> {
    parts
        .iter()
        .find(|p| p.shard == key.0)?
        .docs
        .iter()
        .find(|d| d.global_doc == key.1)
}

/// MaxScore: выше score; при равенстве — меньший shard, затем меньший docid.
fn beats_by_score(parts: &[ShardDocs], cand: (u32, u64), best: (u32, u64)) -> bool {
    let (Some(c), Some(b)) = (find_doc(parts, cand), find_doc(parts, best)) else {
        return false;
    };
    match c.score.partial_cmp(&b.score) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Less) => false,
        _ => cand < best,
    }
}

/// FirstSeen: первый в merge-порядке (sort_key, shard, global_doc).
fn beats_by_merge_order(parts: &[ShardDocs], cand: (u32, u64), best: (u32, u64)) -> bool {
    let (Some(c), Some(b)) = (find_doc(parts, cand), find_doc(parts, best)) else {
        return false;
    };
    (&c.sort_key, cand.0, cand.1) < (&b.sort_key, best.0, best.1)
}

struct HeapEntry {
    shard: u32,
    part: usize,
    doc: Document,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Обратный порядок: BinaryHeap — max-куча, нам нужен минимум сверху.
        (&other.doc.sort_key, other.shard, other.doc.global_doc).cmp(&(
            &self.doc.sort_key,
            self.shard,
            self.doc.global_doc,
        ))
    }
}

/// K-way merge предсортированных шардовых списков; отдаёт ровно `take`
/// элементов либо всё, что есть.
pub fn kway_merge(parts: Vec<ShardDocs>, take: usize) -> Vec<MergedDoc> {
    let mut iters: Vec<std::vec::IntoIter<Document>> = Vec::with_capacity(parts.len());
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    for (pi, part) in parts.into_iter().enumerate() {
        let mut it = part.docs.into_iter();
        if let Some(doc) = it.next() {
            heap.push(HeapEntry {
                shard: part.shard,
                part: pi,
                doc,
            });
        }
        iters.push(it);
    }

    let mut out = Vec::with_capacity(take.min(64));
    while out.len() < take {
        let Some(top) = heap.pop() else {
            break;
        };
        if let Some(next) = iters[top.part].next() {
            heap.push(HeapEntry {
                shard: top.shard,
                part: top.part,
                doc: next,
            });
        }
        out.push(MergedDoc {
            shard: top.shard,
            doc: top.doc,
        });
    }
    out
}

/// Коллапс по группе после merge — шардовый collapse не видит соседей.
pub fn group_collapse(docs: Vec<MergedDoc>, group_by: Option<&GroupBy>) -> Vec<MergedDoc> {
    let Some(g) = group_by else {
        return docs;
    };
    let mut seen: HashMap<String, usize> = HashMap::new();
    docs.into_iter()
        .filter(|m| match m.doc.field(&g.field) {
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

/// L2: правила — чистые функции над (документ, контекст), компонуются в
/// порядке объявления и видят только страницу + lookahead.
pub fn reorder(
    docs: &mut [MergedDoc],
    rules: &[Reordering],
    sort_by: &[SortSpec],
    features: &std::collections::BTreeMap<String, f64>,
    window: usize,
) {
    if rules.is_empty() {
        return;
    }
    let upto = window.min(docs.len());
    for m in docs[..upto].iter_mut() {
        for rule in rules {
            apply_rule(&mut m.doc, rule, features);
        }
        rebuild_score_cells(&mut m.doc, sort_by);
    }
    docs[..upto].sort_by(|a, b| {
        (&a.doc.sort_key, a.shard, a.doc.global_doc).cmp(&(
            &b.doc.sort_key,
            b.shard,
            b.doc.global_doc,
        ))
    });
}

fn apply_rule(
    doc: &mut Document,
    rule: &Reordering,
    features: &std::collections::BTreeMap<String, f64>,
) {
    match rule {
        Reordering::WeightFeature { feature, weight } => {
            if let Some(v) = features.get(feature) {
                doc.score += weight * *v as f32;
            }
        }
        Reordering::BoostField {
            field,
            value,
            factor,
        } => {
            if doc.field(field) == Some(value) {
                doc.score *= factor;
            }
        }
        Reordering::Decay {
            field,
            origin,
            scale,
        } => {
            if let Some(v) = doc.field(field).and_then(|v| v.as_f64()) {
                doc.score *= (-(v - origin).abs() / scale).exp() as f32;
            }
        }
    }
}

/// После правки score пересобираются только score-фазы ключа;
/// остальные ячейки приехали с шарда и остаются как есть.
fn rebuild_score_cells(doc: &mut Document, sort_by: &[SortSpec]) {
    for (i, spec) in sort_by.iter().enumerate() {
        if matches!(spec.key, SortKeyRef::Score) {
            if let Some(cell) = doc.sort_key.0.get_mut(i) {
                *cell = SortCell::from_f64(
                    matches!(spec.direction, Direction::Desc),
                    doc.score as f64,
                );
            }
        }
    }
}
