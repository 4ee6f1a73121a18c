//! `mindmap_llm::token_tracker::UsageSink` impl backed by the durable store,
//! so `TokenTracker`'s flush worker and the diagram sync worker write to the
//! same Postgres instance.

use mindmap_core::UsageRecord;
use mindmap_llm::token_tracker::UsageSink;

use crate::store::DurableStore;

#[async_trait::async_trait]
impl UsageSink for DurableStore {
    async fn write_batch(&self, records: &[UsageRecord]) -> anyhow::Result<()> {
        self.insert_usage_batch(records).await?;
        Ok(())
    }
}
