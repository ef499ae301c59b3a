//! Status - ワーカーとキューの状態ビュー

use std::collections::BTreeMap;

use serde::Serialize;

use super::poll_loop::LoopStats;
use crate::domain::StoreError;
use crate::ports::{QueueDepths, QueueStore};

/// Returned once every loop has stopped cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub loops: BTreeMap<String, LoopStats>,

    /// Stale staged entries returned to pending before the loops started.
    pub recovered_on_startup: usize,

    /// Same, by the reaper while running.
    pub reaped: usize,
}

impl WorkerReport {
    pub fn totals(&self) -> LoopStats {
        self.loops.values().fold(LoopStats::default(), |acc, s| LoopStats {
            claimed: acc.claimed + s.claimed,
            acknowledged: acc.acknowledged + s.acknowledged,
            restaged: acc.restaged + s.restaged,
            dead_lettered: acc.dead_lettered + s.dead_lettered,
        })
    }
}

/// Current depths of each queue, keyed by queue name.
pub async fn queue_status(
    store: &dyn QueueStore,
    queues: &[String],
) -> Result<BTreeMap<String, QueueDepths>, StoreError> {
    let mut status = BTreeMap::new();
    for queue in queues {
        status.insert(queue.clone(), store.depths(queue).await?);
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use crate::impls::InMemoryStore;

    #[test]
    fn totals_sum_every_loop() {
        let mut report = WorkerReport::default();
        report.loops.insert(
            "a".into(),
            LoopStats { claimed: 2, acknowledged: 1, restaged: 1, dead_lettered: 0 },
        );
        report.loops.insert(
            "b".into(),
            LoopStats { claimed: 3, acknowledged: 2, restaged: 0, dead_lettered: 1 },
        );
        assert_eq!(
            report.totals(),
            LoopStats { claimed: 5, acknowledged: 3, restaged: 1, dead_lettered: 1 }
        );
    }

    #[tokio::test]
    async fn status_reports_each_queue() {
        let store = InMemoryStore::new();
        store.submit("a", Payload::new(), None).await.unwrap();
        store.submit("a", Payload::new(), None).await.unwrap();

        let status = queue_status(&store, &["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(status["a"].pending, 2);
        assert!(status["b"].is_quiescent());
    }
}
