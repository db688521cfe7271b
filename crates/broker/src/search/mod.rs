pub mod fanout;
pub mod merge;
pub mod selector;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use shardzilla_engine::collect::facet;
use shardzilla_engine::exec::ShardHits;
use shardzilla_engine::query::ast::DedupPolicy;
use shardzilla_engine::query::plan;
use shardzilla_engine::schema::Catalog;
use shardzilla_engine::wire::{
    self, BrokerRequest, SearchMetrics, SearcherRequest, ShardStatus, WirePayload,
};
use shardzilla_engine::{EngineError, EngineLimits, Result};

use crate::client::SearcherClient;
use crate::config::BrokerConfig;
use merge::ShardDocs;
use selector::ShardSelector;

pub struct Broker {
    catalog: Arc<Catalog>,
    selector: ShardSelector,
    cfg: BrokerConfig,
    limits: EngineLimits,
}

impl Broker {
    pub fn new(
        catalog: Arc<Catalog>,
        clients: Vec<Arc<dyn SearcherClient>>,
        cfg: BrokerConfig,
    ) -> Self {
        let selector = ShardSelector::new(catalog.sharding.clone(), clients);
        Self {
            catalog,
            selector,
            cfg,
            limits: EngineLimits::default(),
        }
    }

    /// Scatter-gather: план → выбор шардов → разлёт → dedup → merge →
    /// фасеты → collapse → L2 → offset/limit.
    pub async fn handle(&self, req: BrokerRequest) -> Result<WirePayload> {
        let started = Instant::now();
        if req.namespace != req.query.namespace {
            return Err(EngineError::invalid(
                "namespace",
                "request namespace differs from query namespace",
            ));
        }
        // Ранняя валидация: битый запрос не должен трогать шарды.
        let planned = plan::plan(&self.catalog, &req.query, self.limits.max_join_depth)?;

        let clients = self.selector.select(req.route.as_ref())?;
        let total_shards = clients.len();
        let requests: Vec<SearcherRequest> = clients
            .iter()
            .map(|c| SearcherRequest {
                shard_id: c.shard_id(),
                query: req.query.clone(),
                include_metrics: req.include_metrics,
                format: req.format,
                deadline_ms: Some(req.deadline_ms.unwrap_or(self.cfg.deadline_ms)),
                pruning_budget: None,
            })
            .collect();

        let deadline = Duration::from_millis(req.deadline_ms.unwrap_or(self.cfg.deadline_ms));
        let ct = CancellationToken::new();
        let outcomes = fanout::run_all(clients, requests, Some(deadline), ct).await;
        let fanout_ms = started.elapsed().as_millis() as u64;

        let mut statuses: Vec<ShardStatus> = Vec::with_capacity(outcomes.len());
        let mut payloads: Vec<(u32, WirePayload)> = Vec::new();
        let mut failed = 0usize;
        for out in outcomes {
            match out.result {
                Ok(p) => {
                    statuses.push(ShardStatus {
                        shard: out.shard,
                        ok: true,
                        error: None,
                    });
                    payloads.push((out.shard, p));
                }
                // Ошибка запроса фатальна целиком, ретраев нет.
                Err(
                    e @ (EngineError::InvalidQuery { .. }
                    | EngineError::JoinTooLarge { .. }
                    | EngineError::DepthExceeded(_)),
                ) => return Err(e),
                Err(e) => {
                    tracing::warn!(shard = out.shard, error = %e, "shard failed");
                    statuses.push(ShardStatus {
                        shard: out.shard,
                        ok: false,
                        error: Some(e.kind().to_string()),
                    });
                    failed += 1;
                }
            }
        }
        if failed > total_shards / 2 {
            return Err(EngineError::PartialFailure {
                failed,
                total: total_shards,
            });
        }
        let partial = failed > 0;

        // Wire → модель, с восстановлением привязанных детей.
        let mut parts: Vec<ShardDocs> = Vec::with_capacity(payloads.len());
        let mut total_matched = 0u64;
        let mut per_namespace = std::collections::BTreeMap::new();
        let mut all_facets = Vec::new();
        let mut facets_approximate = false;
        let mut io_dropped = 0u64;
        for (shard, payload) in &payloads {
            total_matched += payload.total_matched;
            for (ns, c) in &payload.per_namespace {
                *per_namespace.entry(ns.clone()).or_insert(0) += c;
            }
            all_facets.extend(payload.facets.iter().cloned());
            facets_approximate |= payload.facets_approximate;
            io_dropped += payload.io_dropped;
            parts.push(ShardDocs {
                shard: *shard,
                docs: wire::documents_from_payload(payload)?,
            });
        }

        let policy = planned
            .dedup
            .as_ref()
            .map(|d| d.policy)
            .unwrap_or(DedupPolicy::MaxScore);
        let dedup_dropped = merge::dedup(&mut parts, policy);

        let page = planned.limit.saturating_add(planned.offset);
        let merged = merge::kway_merge(parts, page.saturating_add(self.cfg.lookahead));
        let facets = facet::merge_results(all_facets);
        let mut merged = merge::group_collapse(merged, planned.group_by.as_ref());
        merge::reorder(
            &mut merged,
            &planned.reorderings,
            &planned.sort_by,
            &planned.context_features,
            page.saturating_add(self.cfg.lookahead),
        );

        let docs: Vec<_> = merged
            .into_iter()
            .skip(planned.offset)
            .take(planned.limit)
            .map(|m| m.doc)
            .collect();

        let hits = ShardHits {
            docs: Vec::new(),
            total_matched,
            per_namespace,
            facets,
            facets_approximate,
            io_dropped,
        };
        let mut payload = wire::payload_from_docs(&docs, &hits);
        payload.partial = partial;
        payload.shard_statuses = statuses;
        if req.include_metrics {
            payload.metrics = Some(SearchMetrics {
                collect_ms: started.elapsed().as_millis() as u64,
                io_dropped,
                fanout_ms: Some(fanout_ms),
                dedup_dropped: Some(dedup_dropped),
            });
        }
        tracing::info!(
            namespace = %req.namespace,
            shards = total_shards,
            failed,
            hits = payload.documents.len(),
            took_ms = started.elapsed().as_millis() as u64,
            "broker search done"
        );
        Ok(payload)
    }
}
