// Опускание валидированного AST в сегментный план. Join-результаты
// приходят снаружи: компилятор только вшивает их как FILTER-клаузы.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, Result};
use crate::index::segjson::encode_term;
use crate::model::{Document, Value};
use crate::query::ast::{Filter, Occur, SearchQuery};
use crate::schema::{Catalog, NamespaceSchema};

#[derive(Debug, Clone)]
pub enum CompiledQuery {
    All,
    Term {
        field: String,
        term: String,
    },
    TermSet {
        field: String,
        terms: Vec<String>,
    },
    Range {
        field: String,
        lo: Option<f64>,
        hi: Option<f64>,
    },
    Geo {
        field: String,
        lat: f64,
        lon: f64,
        meters: f64,
    },
    Ann {
        field: String,
        target: Vec<f32>,
        k: usize,
        weight: f32,
        prefilter: Option<Box<CompiledQuery>>,
    },
    Fuzzy {
        field: String,
        term: String,
        max_edits: u32,
    },
    Bool {
        clauses: Vec<(Occur, CompiledQuery)>,
        min_should_match: usize,
    },
}

/// Результаты внутренних запросов: namespace → первичные ключи и
/// гидратированные документы для reference-проекций и привязки детей.
#[derive(Debug, Clone, Default)]
pub struct JoinProjection {
    pub inner_pks: BTreeMap<String, Vec<String>>,
    pub inner_docs: BTreeMap<String, Vec<Document>>,
}

pub fn compile(
    catalog: &Catalog,
    schema: &NamespaceSchema,
    q: &SearchQuery,
    join: &JoinProjection,
) -> Result<CompiledQuery> {
    let mut clauses: Vec<(Occur, CompiledQuery)> = Vec::new();

    if let Some(f) = &q.filter {
        clauses.push((Occur::Must, lower(catalog, f, join)?));
    }

    // Вся keyword-часть — отдельный бул под MUST: SHOULD-клаузы внутри него
    // отбирают кандидатов, а не просто подкручивают score рядом с фильтрами.
    if let Some(kw) = &q.keywords {
        let mut kw_clauses: Vec<(Occur, CompiledQuery)> = Vec::new();
        for g in &kw.groups {
            let mut terms: Vec<(Occur, CompiledQuery)> = Vec::new();
            for t in &g.terms {
                for f in &g.fields {
                    terms.push((
                        Occur::Should,
                        CompiledQuery::Term {
                            field: f.clone(),
                            term: t.clone(),
                        },
                    ));
                }
            }
            kw_clauses.push((
                g.occur,
                CompiledQuery::Bool {
                    clauses: terms,
                    min_should_match: g.min_should_match,
                },
            ));
        }
        for v in &kw.vector_queries {
            kw_clauses.push((
                Occur::Should,
                CompiledQuery::Ann {
                    field: v.field.clone(),
                    target: v.target.clone(),
                    k: v.k,
                    weight: v.weight,
                    prefilter: None,
                },
            ));
        }
        for f in &kw.fuzzy {
            kw_clauses.push((
                Occur::Should,
                CompiledQuery::Fuzzy {
                    field: f.field.clone(),
                    term: f.term.clone(),
                    max_edits: f.max_edits,
                },
            ));
        }
        if !kw_clauses.is_empty() {
            clauses.push((
                Occur::Must,
                CompiledQuery::Bool {
                    clauses: kw_clauses,
                    min_should_match: 0,
                },
            ));
        }
    }

    // FK-фильтр на каждый joined namespace: fk(outer→C) ∈ innerResults[C].
    for (ns, pks) in &join.inner_pks {
        let fk = schema.foreign_key_to(ns)?;
        clauses.push((
            Occur::Filter,
            CompiledQuery::TermSet {
                field: fk.field.clone(),
                terms: pks.clone(),
            },
        ));
    }

    if clauses.is_empty() {
        return Ok(CompiledQuery::All);
    }
    Ok(CompiledQuery::Bool {
        clauses,
        min_should_match: 0,
    })
}

fn lower(catalog: &Catalog, f: &Filter, join: &JoinProjection) -> Result<CompiledQuery> {
    Ok(match f {
        Filter::Term { field, value } => CompiledQuery::Term {
            field: field.clone(),
            term: encode_value(value)?,
        },
        Filter::TermInSet { field, values } => {
            let set: BTreeSet<String> = values
                .iter()
                .map(encode_value)
                .collect::<Result<_>>()?;
            CompiledQuery::TermSet {
                field: field.clone(),
                terms: set.into_iter().collect(),
            }
        }
        Filter::PointRange { field, lo, hi } => CompiledQuery::Range {
            field: field.clone(),
            lo: lo.as_ref().and_then(Value::as_f64),
            hi: hi.as_ref().and_then(Value::as_f64),
        },
        Filter::GeoDistance {
            field,
            lat,
            lon,
            meters,
        } => CompiledQuery::Geo {
            field: field.clone(),
            lat: *lat,
            lon: *lon,
            meters: *meters,
        },
        Filter::Vector {
            field,
            target,
            k,
            filter,
        } => CompiledQuery::Ann {
            field: field.clone(),
            target: target.clone(),
            k: *k,
            weight: 1.0,
            prefilter: match filter {
                Some(inner) => Some(Box::new(lower(catalog, inner, join)?)),
                None => None,
            },
        },
        Filter::Boolean {
            clauses,
            min_should_match,
        } => CompiledQuery::Bool {
            clauses: clauses
                .iter()
                .map(|(o, c)| Ok((*o, lower(catalog, c, join)?)))
                .collect::<Result<_>>()?,
            min_should_match: *min_should_match,
        },
        Filter::ReferenceFieldInSet {
            field,
            ref_namespace,
            ref_field,
        } => {
            let docs = join.inner_docs.get(ref_namespace).ok_or_else(|| {
                EngineError::invalid(
                    "filter",
                    format!("no inner results for namespace '{ref_namespace}'"),
                )
            })?;
            let ref_schema = catalog.namespace(ref_namespace)?;
            let mut set: BTreeSet<String> = BTreeSet::new();
            for d in docs {
                if *ref_field == ref_schema.primary_key {
                    set.insert(d.primary_key.clone());
                    continue;
                }
                if let Some(v) = d.field(ref_field) {
                    match v {
                        Value::List(items) => {
                            for item in items {
                                if let Some(t) = encode_term(item) {
                                    set.insert(t);
                                }
                            }
                        }
                        v => {
                            if let Some(t) = encode_term(v) {
                                set.insert(t);
                            }
                        }
                    }
                }
            }
            CompiledQuery::TermSet {
                field: field.clone(),
                terms: set.into_iter().collect(),
            }
        }
    })
}

fn encode_value(v: &Value) -> Result<String> {
    encode_term(v).ok_or_else(|| {
        EngineError::invalid("filter", "value is not representable as an exact term")
    })
}
