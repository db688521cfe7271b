// Параллельный разлёт по шардам: все RPC уходят одновременно,
// ответы собираются группой. Дедлайн — таймер, который гасит общий токен;
// детерминизм порядка восстанавливает merge ниже по конвейеру.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shardzilla_engine::wire::{SearcherRequest, WirePayload};
use shardzilla_engine::{EngineError, Result};

use crate::client::SearcherClient;

pub struct FanoutOutcome {
    pub shard: u32,
    pub result: Result<WirePayload>,
}

pub async fn run_all(
    clients: Vec<Arc<dyn SearcherClient>>,
    requests: Vec<SearcherRequest>,
    deadline: Option<Duration>,
    root_ct: CancellationToken,
) -> Vec<FanoutOutcome> {
    if clients.is_empty() {
        return Vec::new();
    }

    let merged_ct = root_ct.child_token();
    let deadline_hit = Arc::new(AtomicBool::new(false));
    if let Some(dl) = deadline {
        let ct = merged_ct.clone();
        let flag = deadline_hit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(dl).await;
            flag.store(true, Ordering::Relaxed);
            ct.cancel();
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<FanoutOutcome>();
    for (client, req) in clients.into_iter().zip(requests) {
        let txc = tx.clone();
        let task_ct = merged_ct.child_token();
        let flag = deadline_hit.clone();
        tokio::spawn(async move {
            let shard = client.shard_id();
            let result = tokio::select! {
                _ = task_ct.cancelled() => {
                    if flag.load(Ordering::Relaxed) {
                        Err(EngineError::Deadline)
                    } else {
                        Err(EngineError::Cancelled)
                    }
                }
                r = client.search(&req) => r,
            };
            let _ = txc.send(FanoutOutcome { shard, result });
        });
    }
    drop(tx); // закрытый канал — сигнал сборщику

    let mut outcomes = Vec::new();
    while let Some(out) = rx.recv().await {
        outcomes.push(out);
    }
    // Порядок прихода недетерминирован — фиксируем по shard id.
    outcomes.sort_by_key(|o| o.shard);
    outcomes
}
