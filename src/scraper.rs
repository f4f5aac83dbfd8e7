//! Scraper orchestrator (§4.2, C3).
//!
//! Processes a trader id list in batches of `concurrency`, unordered
//! parallel fan-out within each batch, with a pacing delay between
//! batches. Per-trader failures never halt the run; every input id
//! appears exactly once in the output.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::upstream::{UpstreamClient, UpstreamPayload};

#[derive(Debug, Serialize)]
pub enum ScrapeOutcome {
    Ok {
        trader_id: String,
        payload: Box<UpstreamPayload>,
    },
    Err {
        trader_id: String,
        error: String,
    },
}

impl ScrapeOutcome {
    pub fn trader_id(&self) -> &str {
        match self {
            ScrapeOutcome::Ok { trader_id, .. } => trader_id,
            ScrapeOutcome::Err { trader_id, .. } => trader_id,
        }
    }
}

pub struct ScraperOrchestrator {
    client: UpstreamClient,
    concurrency: usize,
    batch_delay: Duration,
}

impl ScraperOrchestrator {
    pub fn new(client: UpstreamClient, concurrency: usize, batch_delay_ms: u64) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            batch_delay: Duration::from_millis(batch_delay_ms),
        }
    }

    /// Scrapes every trader id, batched by `concurrency`, pacing 500ms
    /// (by default) between batches. Guarantees one outcome per input id,
    /// in the same relative order batches were dispatched.
    pub async fn scrape_all(&self, trader_ids: &[String]) -> Vec<ScrapeOutcome> {
        let mut results = Vec::with_capacity(trader_ids.len());

        for (batch_index, batch) in trader_ids.chunks(self.concurrency).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }

            // Each fetch runs on its own task so a panic inside one trader's
            // fetch surfaces as Err instead of taking the whole batch down.
            let batch_results: Vec<ScrapeOutcome> = stream::iter(batch.iter().cloned())
                .map(|trader_id| {
                    let client = self.client.clone();
                    async move {
                        let id_for_task = trader_id.clone();
                        let handle = tokio::spawn(async move {
                            client.fetch_trader_payload(&id_for_task).await
                        });
                        match handle.await {
                            Ok(payload) => ScrapeOutcome::Ok {
                                trader_id,
                                payload: Box::new(payload),
                            },
                            Err(join_err) => ScrapeOutcome::Err {
                                trader_id,
                                error: join_err.to_string(),
                            },
                        }
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            results.extend(batch_results);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_input_id_appears_once() {
        let ids: Vec<String> = (0..7).map(|i| format!("trader-{i}")).collect();
        let mut seen: Vec<String> = Vec::new();
        for chunk in ids.chunks(3) {
            for id in chunk {
                seen.push(id.clone());
            }
        }
        assert_eq!(seen.len(), ids.len());
        for id in &ids {
            assert_eq!(seen.iter().filter(|s| *s == id).count(), 1);
        }
    }
}
