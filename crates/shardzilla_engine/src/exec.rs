// Исполнитель запроса на одном шарде: рекурсивные join-ы, коллектор,
// гидратация, привязка детей. Внутренние запросы одного уровня идут
// конкурентными задачами; слияние в родителя — барьер.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::collect::facet::FacetResult;
use crate::collect::{collect, group_collapse, CollectParams, ForeignKeyBound};
use crate::error::{EngineError, Result};
use crate::hydrate::hydrate;
use crate::index::Snapshot;
use crate::model::Document;
use crate::query::ast::SearchQuery;
use crate::query::compile::{compile, JoinProjection};
use crate::query::plan;
use crate::schema::Catalog;

#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    pub max_join_inner: usize,
    pub max_join_depth: usize,
    pub total_hits_threshold: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_join_inner: 10_000,
            max_join_depth: 4,
            total_hits_threshold: 100_000,
        }
    }
}

/// Результат шарда до кодирования в wire-формат.
#[derive(Debug, Clone, Default)]
pub struct ShardHits {
    pub docs: Vec<Document>,
    pub total_matched: u64,
    pub per_namespace: BTreeMap<String, u64>,
    pub facets: Vec<FacetResult>,
    pub facets_approximate: bool,
    pub io_dropped: u64,
}

#[derive(Clone)]
pub struct QueryEngine {
    catalog: Arc<Catalog>,
    snapshot: Arc<Snapshot>,
    limits: EngineLimits,
}

impl QueryEngine {
    pub fn new(catalog: Arc<Catalog>, snapshot: Arc<Snapshot>, limits: EngineLimits) -> Self {
        Self {
            catalog,
            snapshot,
            limits,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Валидация + переписывание + исполнение. Read-only по снапшоту.
    pub async fn search(
        &self,
        query: &SearchQuery,
        ct: CancellationToken,
    ) -> Result<ShardHits> {
        self.search_with_threshold(query, ct, self.limits.total_hits_threshold)
            .await
    }

    pub async fn search_with_threshold(
        &self,
        query: &SearchQuery,
        ct: CancellationToken,
        total_hits_threshold: u64,
    ) -> Result<ShardHits> {
        let planned = plan::plan(&self.catalog, query, self.limits.max_join_depth)?;
        self.clone()
            .run(planned, ct, 0, total_hits_threshold, false)
            .await
    }

    fn run(
        self,
        q: SearchQuery,
        ct: CancellationToken,
        depth: usize,
        threshold: u64,
        is_inner: bool,
    ) -> BoxFuture<'static, Result<ShardHits>> {
        async move {
            if ct.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut projection = JoinProjection::default();
            let mut inner_counts: BTreeMap<String, u64> = BTreeMap::new();
            if let Some(join) = q.join.clone() {
                // Общий токен уровня: первая ошибка гасит соседей.
                let level_ct = ct.child_token();
                let mut handles = Vec::with_capacity(join.inner_search_queries.len());
                for inner in join.inner_search_queries {
                    let engine = self.clone();
                    let task_ct = level_ct.child_token();
                    let ns = inner.namespace.clone();
                    handles.push((
                        ns,
                        tokio::spawn(engine.run(inner, task_ct, depth + 1, threshold, true)),
                    ));
                }
                let mut first_err: Option<EngineError> = None;
                for (ns, handle) in handles {
                    let joined = handle.await.map_err(|_| EngineError::Cancelled);
                    match joined.and_then(|r| r) {
                        Ok(hits) => {
                            if first_err.is_some() {
                                continue;
                            }
                            let mut pks: Vec<String> = Vec::with_capacity(hits.docs.len());
                            let mut seen: HashSet<&str> = HashSet::new();
                            for d in &hits.docs {
                                if seen.insert(d.primary_key.as_str()) {
                                    pks.push(d.primary_key.clone());
                                }
                            }
                            if pks.len() > self.limits.max_join_inner {
                                level_ct.cancel();
                                first_err = Some(EngineError::JoinTooLarge {
                                    got: pks.len(),
                                    cap: self.limits.max_join_inner,
                                });
                                continue;
                            }
                            for (ins, c) in &hits.per_namespace {
                                *inner_counts.entry(ins.clone()).or_insert(0) += c;
                            }
                            projection.inner_pks.insert(ns.clone(), pks);
                            projection.inner_docs.insert(ns, hits.docs);
                        }
                        Err(e) => {
                            if first_err.is_none() {
                                level_ct.cancel();
                                first_err = Some(e);
                            }
                        }
                    }
                }
                if let Some(e) = first_err {
                    return Err(e);
                }
            }

            let schema = self.catalog.namespace(&q.namespace)?;
            let index = self.snapshot.index(&q.namespace)?;
            let compiled = compile(&self.catalog, schema, &q, &projection)?;

            let mut binds: Vec<ForeignKeyBound> = Vec::with_capacity(projection.inner_docs.len());
            for (ns, docs) in &projection.inner_docs {
                let fk = schema.foreign_key_to(ns)?;
                let child_by_pk: HashMap<String, Document> = docs
                    .iter()
                    .map(|d| (d.primary_key.clone(), d.clone()))
                    .collect();
                binds.push(ForeignKeyBound {
                    field: fk.field.clone(),
                    child_namespace: ns.clone(),
                    child_by_pk,
                });
            }

            let pure_filter = plan::is_pure_filter(&q);
            // Внутренний запрос join-а ограничен ровно своим limit — это кап
            // join-результата, offset в нём не участвует. Внешний запрос отдаёт
            // limit+offset, страницу режет брокер.
            let cap = if is_inner {
                q.limit
            } else {
                q.limit.saturating_add(q.offset)
            };
            let collected = collect(
                index.as_ref(),
                &compiled,
                &binds,
                &CollectParams {
                    cap,
                    sort_by: &q.sort_by,
                    facets: &q.facets,
                    total_hits_threshold: threshold,
                    pure_filter,
                    context_features: &q.context_features,
                    ct: &ct,
                },
            )?;

            let total_matched = collected.total_matched;
            let (docs, hydrate_dropped) = hydrate(
                index.as_ref(),
                schema,
                collected.docs,
                &q.return_fields,
            );
            let docs = group_collapse(docs, q.group_by.as_ref());

            let mut per_namespace = inner_counts;
            *per_namespace.entry(q.namespace.clone()).or_insert(0) += total_matched;

            tracing::debug!(
                namespace = %q.namespace,
                matched = total_matched,
                returned = docs.len(),
                dropped = hydrate_dropped,
                "shard query done"
            );

            Ok(ShardHits {
                docs,
                total_matched,
                per_namespace,
                facets: collected.facets,
                facets_approximate: collected.facets_approximate,
                io_dropped: collected.io_dropped + hydrate_dropped,
            })
        }
        .boxed()
    }
}
