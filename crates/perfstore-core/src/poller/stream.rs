use std::sync::Arc;

use super::Poller;
use crate::Result;
use crate::client::ProfilerClient;
use crate::storage::UnifiedEventTable;

/// Copies one stream's unified events into the shared event table.
pub struct UnifiedEventsPoller {
    stream_id: i64,
    client: Arc<dyn ProfilerClient>,
    table: Arc<UnifiedEventTable>,
    last_timestamp: i64,
}

impl UnifiedEventsPoller {
    #[must_use]
    pub fn new(stream_id: i64, client: Arc<dyn ProfilerClient>, table: Arc<UnifiedEventTable>) -> Self {
        Self {
            stream_id,
            client,
            table,
            last_timestamp: i64::MIN,
        }
    }
}

impl Poller for UnifiedEventsPoller {
    fn name(&self) -> &'static str {
        "unified_events"
    }

    fn poll(&mut self) -> Result<usize> {
        let events = self.client.get_events(self.stream_id, self.last_timestamp)?;
        let Some(newest) = events.iter().map(|e| e.timestamp).max() else {
            return Ok(0);
        };
        let rows = self.table.insert_events(self.stream_id, &events)?;
        self.last_timestamp = self.last_timestamp.max(newest);
        Ok(rows)
    }
}
