use std::sync::Arc;

use super::Poller;
use crate::Result;
use crate::client::MemoryClient;
use crate::storage::LiveAllocationTable;
use crate::types::Session;

/// Streams live allocation events and their contexts from the in-process
/// agent into the allocation namespace.
pub struct JvmtiPoller {
    session: Session,
    client: Arc<dyn MemoryClient>,
    table: Arc<LiveAllocationTable>,
    last_timestamp: i64,
}

impl JvmtiPoller {
    #[must_use]
    pub fn new(
        session: Session,
        client: Arc<dyn MemoryClient>,
        table: Arc<LiveAllocationTable>,
    ) -> Self {
        Self {
            session,
            client,
            table,
            last_timestamp: session.start_timestamp.saturating_sub(1),
        }
    }
}

impl Poller for JvmtiPoller {
    fn name(&self) -> &'static str {
        "jvmti"
    }

    fn poll(&mut self) -> Result<usize> {
        let batch = self.client.get_jvmti_batch(&self.session, self.last_timestamp)?;
        let newest = batch.latest_event_timestamp();
        let rows = self.table.insert_batch(&self.session, &batch)?;
        if let Some(newest) = newest {
            self.last_timestamp = self.last_timestamp.max(newest);
        }
        Ok(rows)
    }
}
