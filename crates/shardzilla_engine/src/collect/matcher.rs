// Исполнение скомпилированного плана над одним сегментом:
// битовая алгебра кандидатов + карта скоринговых вкладов.

use std::collections::HashMap;

use croaring::Bitmap;

use crate::bm25::Bm25;
use crate::error::Result;
use crate::index::{Postings, SegmentReader};
use crate::query::ast::Occur;
use crate::query::compile::CompiledQuery;

/// Потолок разворачивания fuzzy-терма, чтобы terms enum не взорвал план.
const MAX_FUZZY_EXPANSIONS: usize = 50;

pub struct SegmentMatches {
    pub docs: Bitmap,
    scorers: Vec<HashMap<u32, f32>>,
}

impl SegmentMatches {
    /// Сумма вкладов MUST/SHOULD клауз; FILTER и MUST_NOT сюда не попадают.
    pub fn score_of(&self, doc: u32) -> f32 {
        self.scorers
            .iter()
            .filter_map(|s| s.get(&doc))
            .sum()
    }
}

pub fn eval_segment(
    seg: &dyn SegmentReader,
    q: &CompiledQuery,
    bm25: &Bm25,
) -> Result<SegmentMatches> {
    let mut scorers = Vec::new();
    let docs = eval(seg, q, true, &mut scorers, bm25)?;
    Ok(SegmentMatches { docs, scorers })
}

fn eval(
    seg: &dyn SegmentReader,
    q: &CompiledQuery,
    scoring: bool,
    scorers: &mut Vec<HashMap<u32, f32>>,
    bm25: &Bm25,
) -> Result<Bitmap> {
    Ok(match q {
        CompiledQuery::All => seg.live_docs(),
        CompiledQuery::Term { field, term } => match seg.postings(field, term) {
            None => Bitmap::new(),
            Some(p) => {
                if scoring {
                    scorers.push(term_scores(seg, field, &p, bm25));
                }
                p.docs
            }
        },
        CompiledQuery::TermSet { field, terms } => {
            let mut bm = Bitmap::new();
            for t in terms {
                if let Some(p) = seg.postings(field, t) {
                    bm.or_inplace(&p.docs);
                }
            }
            bm
        }
        CompiledQuery::Range { field, lo, hi } => seg.range(field, *lo, *hi),
        CompiledQuery::Geo {
            field,
            lat,
            lon,
            meters,
        } => seg.geo_within(field, *lat, *lon, *meters),
        CompiledQuery::Ann {
            field,
            target,
            k,
            weight,
            prefilter,
        } => {
            let pre = match prefilter {
                Some(p) => Some(eval(seg, p, false, scorers, bm25)?),
                None => None,
            };
            let top = seg.vector_top_k(field, target, *k, pre.as_ref());
            let mut bm = Bitmap::new();
            let mut scores = HashMap::with_capacity(top.len());
            for (doc, score) in top {
                bm.add(doc);
                scores.insert(doc, score * weight);
            }
            if scoring {
                scorers.push(scores);
            }
            bm
        }
        CompiledQuery::Fuzzy {
            field,
            term,
            max_edits,
        } => {
            let mut bm = Bitmap::new();
            let mut expanded = 0usize;
            for candidate in seg.terms(field) {
                if !levenshtein_within(term, &candidate, *max_edits) {
                    continue;
                }
                if let Some(p) = seg.postings(field, &candidate) {
                    if scoring {
                        scorers.push(term_scores(seg, field, &p, bm25));
                    }
                    bm.or_inplace(&p.docs);
                }
                expanded += 1;
                if expanded >= MAX_FUZZY_EXPANSIONS {
                    break;
                }
            }
            bm
        }
        CompiledQuery::Bool {
            clauses,
            min_should_match,
        } => eval_bool(seg, clauses, *min_should_match, scoring, scorers, bm25)?,
    })
}

fn eval_bool(
    seg: &dyn SegmentReader,
    clauses: &[(Occur, CompiledQuery)],
    min_should_match: usize,
    scoring: bool,
    scorers: &mut Vec<HashMap<u32, f32>>,
    bm25: &Bm25,
) -> Result<Bitmap> {
    let mut required: Option<Bitmap> = None;
    let mut excluded = Bitmap::new();
    let mut shoulds: Vec<Bitmap> = Vec::new();

    for (occ, c) in clauses {
        match occ {
            Occur::Must => {
                let bm = eval(seg, c, scoring, scorers, bm25)?;
                required = Some(match required {
                    None => bm,
                    Some(mut acc) => {
                        acc.and_inplace(&bm);
                        acc
                    }
                });
            }
            Occur::Filter => {
                let bm = eval(seg, c, false, scorers, bm25)?;
                required = Some(match required {
                    None => bm,
                    Some(mut acc) => {
                        acc.and_inplace(&bm);
                        acc
                    }
                });
            }
            Occur::MustNot => {
                let bm = eval(seg, c, false, scorers, bm25)?;
                excluded.or_inplace(&bm);
            }
            Occur::Should => {
                shoulds.push(eval(seg, c, scoring, scorers, bm25)?);
            }
        }
    }

    // Без MUST/FILTER хотя бы одна SHOULD обязана совпасть.
    let needed = if required.is_none() && !shoulds.is_empty() {
        min_should_match.max(1)
    } else {
        min_should_match
    };

    let mut base = match required {
        Some(r) => {
            if needed > 0 {
                let mut r = r;
                r.and_inplace(&at_least(&shoulds, needed));
                r
            } else {
                r
            }
        }
        None => {
            if shoulds.is_empty() {
                seg.live_docs()
            } else {
                at_least(&shoulds, needed)
            }
        }
    };
    base.andnot_inplace(&excluded);
    Ok(base)
}

/// Документы, попавшие минимум в `n` битмапов.
fn at_least(parts: &[Bitmap], n: usize) -> Bitmap {
    if n <= 1 {
        let mut acc = Bitmap::new();
        for p in parts {
            acc.or_inplace(p);
        }
        return acc;
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for p in parts {
        for doc in p.iter() {
            *counts.entry(doc).or_insert(0) += 1;
        }
    }
    let mut acc = Bitmap::new();
    for (doc, c) in counts {
        if c >= n {
            acc.add(doc);
        }
    }
    acc
}

fn term_scores(
    seg: &dyn SegmentReader,
    field: &str,
    p: &Postings,
    bm25: &Bm25,
) -> HashMap<u32, f32> {
    let doc_count = seg.doc_count();
    let avg = seg.avg_field_len(field);
    p.tf
        .iter()
        .map(|(&doc, &tf)| {
            (
                doc,
                bm25.score(tf, p.doc_freq, doc_count, seg.field_len(field, doc), avg),
            )
        })
        .collect()
}

/// Расстояние Левенштейна с ранним отсечением по длине.
fn levenshtein_within(a: &str, b: &str, max: u32) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max as usize {
        return false;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()] <= max as usize
}
