use std::collections::BTreeSet;
use std::sync::Arc;

use shardzilla_engine::schema::ShardingSpec;
use shardzilla_engine::wire::Route;
use shardzilla_engine::{EngineError, Result};

use crate::client::SearcherClient;

/// Выбор шардов по подсказке маршрутизации. Для одной конфигурации
/// и одного route набор стабилен от вызова к вызову.
pub struct ShardSelector {
    sharding: ShardingSpec,
    clients: Vec<Arc<dyn SearcherClient>>,
}

impl ShardSelector {
    pub fn new(sharding: ShardingSpec, clients: Vec<Arc<dyn SearcherClient>>) -> Self {
        Self { sharding, clients }
    }

    pub fn select(&self, route: Option<&Route>) -> Result<Vec<Arc<dyn SearcherClient>>> {
        if self.clients.is_empty() {
            return Err(EngineError::IndexUnavailable("no shards configured".into()));
        }
        match route {
            // Без подсказки — scatter на все шарды.
            None => Ok(self.clients.clone()),
            Some(Route::Key(k)) => {
                let micro = self.sharding.micro_shard_of(k);
                let shard = self.sharding.shard_of_micro(micro);
                self.client_for(shard).map(|c| vec![c])
            }
            Some(Route::MicroShards(ids)) => {
                let mut shards: BTreeSet<u32> = BTreeSet::new();
                for &m in ids {
                    if m >= self.sharding.micro_shards {
                        return Err(EngineError::invalid(
                            "route",
                            format!("micro shard {m} out of range"),
                        ));
                    }
                    shards.insert(self.sharding.shard_of_micro(m));
                }
                shards.into_iter().map(|s| self.client_for(s)).collect()
            }
        }
    }

    fn client_for(&self, shard: u32) -> Result<Arc<dyn SearcherClient>> {
        self.clients
            .iter()
            .find(|c| c.shard_id() == shard)
            .cloned()
            .ok_or_else(|| EngineError::IndexUnavailable(format!("no client for shard {shard}")))
    }
}
