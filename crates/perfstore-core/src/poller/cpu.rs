use std::sync::Arc;

use super::Poller;
use crate::Result;
use crate::client::CpuClient;
use crate::storage::{CpuPollBatch, CpuTable};
use crate::types::{Session, TimeRange};

/// Pulls usage samples, thread activity, trace descriptors, and the
/// profiling state for one session.
pub struct CpuPoller {
    session: Session,
    client: Arc<dyn CpuClient>,
    table: Arc<CpuTable>,
    /// Newest usage sample already persisted
    last_timestamp: i64,
}

impl CpuPoller {
    #[must_use]
    pub fn new(session: Session, client: Arc<dyn CpuClient>, table: Arc<CpuTable>) -> Self {
        Self {
            session,
            client,
            table,
            last_timestamp: session.start_timestamp.saturating_sub(1),
        }
    }

    #[must_use]
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }
}

impl Poller for CpuPoller {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn poll(&mut self) -> Result<usize> {
        let range = TimeRange::since(self.last_timestamp);
        let usage = self.client.get_data(&self.session, range)?;
        let threads = self.client.get_threads(&self.session, range)?;
        let trace_infos = self.client.get_trace_info(&self.session, range)?;
        let profiling_state = self.client.check_app_profiling_state(&self.session)?;

        let latest = usage.iter().map(|d| d.end_timestamp).max();
        let batch = CpuPollBatch {
            usage,
            threads,
            trace_infos,
            profiling_state: Some(profiling_state),
        };
        let rows = self.table.insert_poll_batch(&self.session, &batch)?;

        if let Some(latest) = latest {
            self.last_timestamp = self.last_timestamp.max(latest);
        }
        Ok(rows)
    }
}
