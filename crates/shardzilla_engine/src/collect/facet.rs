use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::index::SegmentReader;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetKind {
    TermCount,
    /// Полуоткрытые корзины [bounds[i], bounds[i+1]).
    Histogram { bounds: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetSpec {
    pub field: String,
    pub kind: FacetKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetEntry {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetResult {
    pub field: String,
    pub entries: Vec<FacetEntry>,
}

/// Счётчик одной фасетной спецификации. Считает по всем документам,
/// прошедшим фильтр, а не только по top-K.
pub struct FacetAccumulator {
    spec: FacetSpec,
    counts: HashMap<String, u64>,
}

impl FacetAccumulator {
    pub fn new(spec: FacetSpec) -> Self {
        Self {
            spec,
            counts: HashMap::new(),
        }
    }

    pub fn update(&mut self, seg: &dyn SegmentReader, doc: u32) {
        match &self.spec.kind {
            FacetKind::TermCount => {
                if let Some(col) = seg.sorted_set(&self.spec.field) {
                    for &ord in col.ords(doc) {
                        if let Some(v) = col.value_of(ord) {
                            *self.counts.entry(v.to_string()).or_insert(0) += 1;
                        }
                    }
                } else if let Some(v) = seg.numeric(&self.spec.field, doc) {
                    *self.counts.entry(v.to_string()).or_insert(0) += 1;
                }
            }
            FacetKind::Histogram { bounds } => {
                if let Some(v) = seg.numeric(&self.spec.field, doc) {
                    for w in bounds.windows(2) {
                        if v >= w[0] && v < w[1] {
                            *self
                                .counts
                                .entry(bucket_key(w[0], w[1]))
                                .or_insert(0) += 1;
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn finish(self) -> FacetResult {
        let mut entries: Vec<FacetEntry> = self
            .counts
            .into_iter()
            .map(|(key, count)| FacetEntry { key, count })
            .collect();
        sort_entries(&mut entries);
        FacetResult {
            field: self.spec.field,
            entries,
        }
    }
}

fn bucket_key(lo: f64, hi: f64) -> String {
    format!("{lo}..{hi}")
}

fn sort_entries(entries: &mut [FacetEntry]) {
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
}

/// Слияние фасетов между шардами: суммы по (field, key).
pub fn merge_results(parts: impl IntoIterator<Item = FacetResult>) -> Vec<FacetResult> {
    let mut by_field: Vec<(String, HashMap<String, u64>)> = Vec::new();
    for part in parts {
        let idx = match by_field.iter().position(|(f, _)| *f == part.field) {
            Some(i) => i,
            None => {
                by_field.push((part.field.clone(), HashMap::new()));
                by_field.len() - 1
            }
        };
        let slot = &mut by_field[idx].1;
        for e in part.entries {
            *slot.entry(e.key).or_insert(0) += e.count;
        }
    }
    by_field
        .into_iter()
        .map(|(field, counts)| {
            let mut entries: Vec<FacetEntry> = counts
                .into_iter()
                .map(|(key, count)| FacetEntry { key, count })
                .collect();
            sort_entries(&mut entries);
            FacetResult { field, entries }
        })
        .collect()
}
