// JSON-реализация сегмента:
// - meta.json    : SegmentMeta
// - terms.json   : { field -> { term -> [[doc, tf], ...] } }
// - dv_num.json  : { field -> [[doc, f64], ...] }
// - dv_set.json  : { field -> [[doc, [value, ...]], ...] }
// - dv_geo.json  : { field -> [[doc, [lat, lon]], ...] }
// - dv_vec.json  : { field -> [[doc, [f32, ...]], ...] }
// - docs.jsonl   : StoredRow по строке

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use croaring::Bitmap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::index::{Postings, SegmentReader, SortedSetColumn};
use crate::model::Value;
use crate::schema::{Container, FieldKind, NamespaceSchema, NAMESPACE_FIELD, REF_FIELD_PREFIX};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub version: u32,
    pub namespace: String,
    pub doc_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    doc: u32,
    primary_key: String,
    fields: BTreeMap<String, Value>,
}

type TermsFile = BTreeMap<String, BTreeMap<String, Vec<(u32, u32)>>>;

/// Токены строкового поля: lowercase, по не-буквенно-цифровым границам.
/// Полная строка индексируется отдельным точным термом, поэтому
/// exact-матчи по ключам не зависят от токенизации.
pub fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Кодировка терма для типизированного значения. Range-ы ходят
/// по числовым колонкам, так что лексикографика термов не важна.
pub fn encode_term(v: &Value) -> Option<String> {
    match v {
        Value::Str(s) => Some(s.clone()),
        Value::I64(i) => Some(i.to_string()),
        Value::F64(f) => Some(f.to_string()),
        Value::Bool(b) => Some(if *b { "true".into() } else { "false".into() }),
        _ => None,
    }
}

/// Пишет один сегмент из типизированных документов по схеме namespace.
/// Первичный ключ обязан быть уникальной строкой внутри пачки.
pub fn write_segment(
    schema: &NamespaceSchema,
    docs: &[BTreeMap<String, Value>],
    out_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(out_dir)?;

    let mut terms: TermsFile = BTreeMap::new();
    let mut dv_num: BTreeMap<String, Vec<(u32, f64)>> = BTreeMap::new();
    let mut dv_set: BTreeMap<String, Vec<(u32, Vec<String>)>> = BTreeMap::new();
    let mut dv_geo: BTreeMap<String, Vec<(u32, (f64, f64))>> = BTreeMap::new();
    let mut dv_vec: BTreeMap<String, Vec<(u32, Vec<f32>)>> = BTreeMap::new();
    let mut rows: Vec<StoredRow> = Vec::with_capacity(docs.len());
    let mut seen_pk: HashSet<String> = HashSet::new();

    fn add_term(terms: &mut TermsFile, field: &str, term: String, doc: u32) {
        let by_term = terms.entry(field.to_string()).or_default();
        let postings = by_term.entry(term).or_default();
        match postings.last_mut() {
            Some(last) if last.0 == doc => last.1 += 1,
            _ => postings.push((doc, 1)),
        }
    }

    for (doc_id, fields) in docs.iter().enumerate() {
        let doc = doc_id as u32;
        let pk = fields
            .get(&schema.primary_key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::invalid(
                    "document",
                    format!("missing string primary key '{}'", schema.primary_key),
                )
            })?
            .to_string();
        if !seen_pk.insert(pk.clone()) {
            return Err(EngineError::invalid(
                "document",
                format!("duplicate primary key '{pk}'"),
            ));
        }

        add_term(&mut terms, NAMESPACE_FIELD, schema.name.clone(), doc);

        for spec in &schema.fields {
            let Some(value) = fields.get(&spec.name) else {
                continue;
            };
            let scalars: Vec<&Value> = match (spec.container, value) {
                (Container::List, Value::List(items)) => items.iter().collect(),
                (Container::List, v) => vec![v],
                (Container::Scalar, v) => vec![v],
            };

            for v in &scalars {
                if let Some(term) = encode_term(v) {
                    if spec.kind == FieldKind::Str {
                        for tok in tokenize(&term) {
                            if tok != term {
                                add_term(&mut terms, &spec.name, tok, doc);
                            }
                        }
                    }
                    add_term(&mut terms, &spec.name, term, doc);
                }
            }

            if spec.doc_values {
                match &spec.kind {
                    FieldKind::I64 | FieldKind::F64 | FieldKind::Bool => {
                        if let Some(n) = scalars.first().and_then(|v| match v {
                            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                            v => v.as_f64(),
                        }) {
                            dv_num.entry(spec.name.clone()).or_default().push((doc, n));
                        }
                    }
                    FieldKind::Str => {
                        let vals: Vec<String> = scalars
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect();
                        if !vals.is_empty() {
                            dv_set.entry(spec.name.clone()).or_default().push((doc, vals));
                        }
                    }
                    FieldKind::Geo => {
                        if let Some(Value::Geo { lat, lon }) = scalars.first() {
                            dv_geo
                                .entry(spec.name.clone())
                                .or_default()
                                .push((doc, (*lat, *lon)));
                        }
                    }
                    FieldKind::Vector { .. } => {
                        if let Some(Value::Vector(v)) = scalars.first() {
                            dv_vec
                                .entry(spec.name.clone())
                                .or_default()
                                .push((doc, v.clone()));
                        }
                    }
                }
            }
        }

        // FK: терм уже есть через FieldSpec; добиваем sorted-set колонку
        // и обратные ссылочные термы _ref.<child>.
        for fk in &schema.foreign_keys {
            let Some(value) = fields.get(&fk.field) else {
                continue;
            };
            let vals: Vec<String> = match value {
                Value::List(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                v => v.as_str().map(str::to_string).into_iter().collect(),
            };
            if vals.is_empty() {
                continue;
            }
            dv_set
                .entry(fk.field.clone())
                .or_default()
                .push((doc, vals.clone()));
            for child in &fk.children {
                for v in &vals {
                    add_term(&mut terms, &format!("{REF_FIELD_PREFIX}{child}"), v.clone(), doc);
                }
            }
        }

        let mut stored: BTreeMap<String, Value> = BTreeMap::new();
        stored.insert(schema.primary_key.clone(), Value::Str(pk.clone()));
        for spec in &schema.fields {
            if spec.stored && spec.name != schema.primary_key {
                if let Some(v) = fields.get(&spec.name) {
                    stored.insert(spec.name.clone(), v.clone());
                }
            }
        }
        rows.push(StoredRow {
            doc,
            primary_key: pk,
            fields: stored,
        });
    }

    // dv_set может получить поле и из FieldSpec, и из FK — склеиваем дубли.
    for col in dv_set.values_mut() {
        col.sort_by_key(|(doc, _)| *doc);
        col.dedup_by_key(|(doc, _)| *doc);
    }

    write_json(&out_dir.join("terms.json"), &terms)?;
    write_json(&out_dir.join("dv_num.json"), &dv_num)?;
    write_json(&out_dir.join("dv_set.json"), &dv_set)?;
    write_json(&out_dir.join("dv_geo.json"), &dv_geo)?;
    write_json(&out_dir.join("dv_vec.json"), &dv_vec)?;

    let mut df = File::create(out_dir.join("docs.jsonl"))?;
    for row in &rows {
        serde_json::to_writer(&mut df, row)?;
        df.write_all(b"\n")?;
    }

    let meta = SegmentMeta {
        version: 1,
        namespace: schema.name.clone(),
        doc_count: rows.len() as u32,
    };
    write_json(&out_dir.join("meta.json"), &meta)?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut f = File::create(path)?;
    serde_json::to_writer_pretty(&mut f, value)?;
    Ok(())
}

pub struct JsonSegment {
    meta: SegmentMeta,
    postings: HashMap<String, HashMap<String, Postings>>,
    field_terms: HashMap<String, Vec<String>>,
    field_lens: HashMap<String, HashMap<u32, u32>>,
    avg_lens: HashMap<String, f32>,
    dv_num: HashMap<String, HashMap<u32, f64>>,
    dv_set: HashMap<String, Arc<SortedSetColumn>>,
    dv_geo: HashMap<String, HashMap<u32, (f64, f64)>>,
    dv_vec: HashMap<String, HashMap<u32, Vec<f32>>>,
    rows: Vec<StoredRow>,
}

impl JsonSegment {
    pub fn open(dir: &Path) -> Result<Self> {
        let meta: SegmentMeta = read_json(&dir.join("meta.json"))?;
        let terms: TermsFile = read_json(&dir.join("terms.json"))?;
        let dv_num_raw: BTreeMap<String, Vec<(u32, f64)>> = read_json(&dir.join("dv_num.json"))?;
        let dv_set_raw: BTreeMap<String, Vec<(u32, Vec<String>)>> =
            read_json(&dir.join("dv_set.json"))?;
        let dv_geo_raw: BTreeMap<String, Vec<(u32, (f64, f64))>> =
            read_json(&dir.join("dv_geo.json"))?;
        let dv_vec_raw: BTreeMap<String, Vec<(u32, Vec<f32>)>> =
            read_json(&dir.join("dv_vec.json"))?;

        let mut postings: HashMap<String, HashMap<String, Postings>> = HashMap::new();
        let mut field_terms: HashMap<String, Vec<String>> = HashMap::new();
        let mut field_lens: HashMap<String, HashMap<u32, u32>> = HashMap::new();
        for (field, by_term) in terms {
            field_terms.insert(field.clone(), by_term.keys().cloned().collect());
            let lens = field_lens.entry(field.clone()).or_default();
            let mut out: HashMap<String, Postings> = HashMap::with_capacity(by_term.len());
            for (term, pairs) in by_term {
                let mut p = Postings::empty();
                for (doc, tf) in pairs {
                    p.docs.add(doc);
                    p.tf.insert(doc, tf);
                    *lens.entry(doc).or_insert(0) += tf;
                }
                p.doc_freq = p.docs.cardinality() as u32;
                out.insert(term, p);
            }
            postings.insert(field, out);
        }
        let avg_lens = field_lens
            .iter()
            .map(|(f, lens)| {
                let sum: u64 = lens.values().map(|&l| l as u64).sum();
                let avg = if lens.is_empty() {
                    0.0
                } else {
                    sum as f32 / lens.len() as f32
                };
                (f.clone(), avg)
            })
            .collect();

        let dv_set = dv_set_raw
            .into_iter()
            .map(|(f, rows)| (f, Arc::new(SortedSetColumn::from_rows(&rows))))
            .collect();

        let mut rows: Vec<StoredRow> = Vec::with_capacity(meta.doc_count as usize);
        let f = File::open(dir.join("docs.jsonl"))?;
        for line in BufReader::new(f).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        if rows.len() as u32 != meta.doc_count {
            return Err(EngineError::IndexUnavailable(format!(
                "segment {}: doc_count {} but {} stored rows",
                dir.display(),
                meta.doc_count,
                rows.len()
            )));
        }

        Ok(Self {
            meta,
            postings,
            field_terms,
            field_lens,
            avg_lens,
            dv_num: dv_num_raw
                .into_iter()
                .map(|(f, v)| (f, v.into_iter().collect()))
                .collect(),
            dv_set,
            dv_geo: dv_geo_raw
                .into_iter()
                .map(|(f, v)| (f, v.into_iter().collect()))
                .collect(),
            dv_vec: dv_vec_raw
                .into_iter()
                .map(|(f, v)| (f, v.into_iter().collect()))
                .collect(),
            rows,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.meta.namespace
    }
}

const EARTH_RADIUS_M: f64 = 6_371_000.8;

fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (la1, lo1, la2, lo2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dla = la2 - la1;
    let dlo = lo2 - lo1;
    let a = (dla / 2.0).sin().powi(2) + la1.cos() * la2.cos() * (dlo / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

impl SegmentReader for JsonSegment {
    fn doc_count(&self) -> u32 {
        self.meta.doc_count
    }

    fn live_docs(&self) -> Bitmap {
        let mut bm = Bitmap::new();
        if self.meta.doc_count > 0 {
            bm.add_range(0..self.meta.doc_count);
        }
        bm
    }

    fn postings(&self, field: &str, term: &str) -> Option<Postings> {
        self.postings.get(field)?.get(term).cloned()
    }

    fn terms(&self, field: &str) -> Vec<String> {
        self.field_terms.get(field).cloned().unwrap_or_default()
    }

    fn range(&self, field: &str, lo: Option<f64>, hi: Option<f64>) -> Bitmap {
        let mut bm = Bitmap::new();
        if let Some(col) = self.dv_num.get(field) {
            for (&doc, &v) in col {
                if lo.map_or(true, |l| v >= l) && hi.map_or(true, |h| v <= h) {
                    bm.add(doc);
                }
            }
        }
        bm
    }

    fn geo_within(&self, field: &str, lat: f64, lon: f64, meters: f64) -> Bitmap {
        let mut bm = Bitmap::new();
        if let Some(col) = self.dv_geo.get(field) {
            for (&doc, &(dlat, dlon)) in col {
                if haversine_m(lat, lon, dlat, dlon) <= meters {
                    bm.add(doc);
                }
            }
        }
        bm
    }

    fn vector_top_k(
        &self,
        field: &str,
        target: &[f32],
        k: usize,
        prefilter: Option<&Bitmap>,
    ) -> Vec<(u32, f32)> {
        let Some(col) = self.dv_vec.get(field) else {
            return Vec::new();
        };
        let mut scored: Vec<(u32, f32)> = col
            .iter()
            .filter(|(doc, _)| prefilter.map_or(true, |bm| bm.contains(**doc)))
            .map(|(&doc, v)| (doc, cosine(target, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    fn sorted_set(&self, field: &str) -> Option<Arc<SortedSetColumn>> {
        self.dv_set.get(field).cloned()
    }

    fn numeric(&self, field: &str, doc: u32) -> Option<f64> {
        self.dv_num.get(field)?.get(&doc).copied()
    }

    fn field_len(&self, field: &str, doc: u32) -> u32 {
        self.field_lens
            .get(field)
            .and_then(|l| l.get(&doc).copied())
            .unwrap_or(0)
    }

    fn avg_field_len(&self, field: &str) -> f32 {
        self.avg_lens.get(field).copied().unwrap_or(0.0)
    }

    fn primary_key(&self, doc: u32) -> Result<String> {
        self.rows
            .get(doc as usize)
            .map(|r| r.primary_key.clone())
            .ok_or_else(|| EngineError::Io(format!("stored row {doc} out of bounds")))
    }

    fn stored(&self, doc: u32, fields: &[String]) -> Result<Vec<(String, Value)>> {
        let row = self
            .rows
            .get(doc as usize)
            .ok_or_else(|| EngineError::Io(format!("stored row {doc} out of bounds")))?;
        Ok(fields
            .iter()
            .filter_map(|name| row.fields.get(name).map(|v| (name.clone(), v.clone())))
            .collect())
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let f = File::open(path)
        .map_err(|e| EngineError::IndexUnavailable(format!("{}: {e}", path.display())))?;
    serde_json::from_reader(f)
        .map_err(|e| EngineError::IndexUnavailable(format!("{}: {e}", path.display())))
}
