use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::Poller;
use crate::Result;
use crate::client::MemoryClient;
use crate::storage::{FetchedDump, FetchedLegacyAllocations, MemoryPollBatch, MemoryStatsTable};
use crate::types::memory::{AllocationsInfo, AllocationsStatus, HeapDumpInfo};
use crate::types::{DumpStatus, Session, TimeRange};

/// Pulls memory and VM samples plus heap dump and allocation tracking
/// descriptors, and fetches the bytes of artifacts that have finished.
pub struct MemoryStatsPoller {
    session: Session,
    client: Arc<dyn MemoryClient>,
    table: Arc<MemoryStatsTable>,
    last_timestamp: i64,
    /// Dump start times whose final status is already persisted
    settled_dumps: HashSet<i64>,
    /// Legacy tracking windows whose artifacts are already persisted
    settled_legacy: HashSet<i64>,
}

impl MemoryStatsPoller {
    #[must_use]
    pub fn new(session: Session, client: Arc<dyn MemoryClient>, table: Arc<MemoryStatsTable>) -> Self {
        Self {
            session,
            client,
            table,
            last_timestamp: session.start_timestamp.saturating_sub(1),
            settled_dumps: HashSet::new(),
            settled_legacy: HashSet::new(),
        }
    }

    /// Status and bytes for a finished dump, `None` while the device is
    /// still writing it
    fn fetch_dump(&self, info: &HeapDumpInfo) -> Result<Option<FetchedDump>> {
        if !info.success {
            return Ok(Some(FetchedDump {
                start_time: info.start_time,
                status: DumpStatus::FailureUnknown,
                data: Vec::new(),
            }));
        }
        let reply = self.client.get_heap_dump(&self.session, info.start_time)?;
        Ok(match reply.status {
            DumpStatus::Success => Some(FetchedDump {
                start_time: info.start_time,
                status: DumpStatus::Success,
                data: reply.data,
            }),
            DumpStatus::NotReady => None,
            DumpStatus::NotFound | DumpStatus::FailureUnknown => Some(FetchedDump {
                start_time: info.start_time,
                status: DumpStatus::FailureUnknown,
                data: Vec::new(),
            }),
        })
    }

    /// Events and dump of a completed legacy tracking window
    fn fetch_legacy(&self, info: &AllocationsInfo) -> Result<LegacyOutcome> {
        let events = self
            .client
            .get_legacy_allocation_events(&self.session, info.start_time)?;
        let dump = self
            .client
            .get_legacy_allocation_dump(&self.session, info.start_time)?;
        Ok(match (events.status, dump.status) {
            (DumpStatus::Success, DumpStatus::Success) => {
                LegacyOutcome::Fetched(FetchedLegacyAllocations {
                    start_time: info.start_time,
                    events: Some(events.events),
                    dump: Some(dump.data),
                })
            }
            (DumpStatus::NotReady, _) | (_, DumpStatus::NotReady) => LegacyOutcome::Pending,
            _ => LegacyOutcome::Failed,
        })
    }
}

enum LegacyOutcome {
    Fetched(FetchedLegacyAllocations),
    Pending,
    Failed,
}

impl Poller for MemoryStatsPoller {
    fn name(&self) -> &'static str {
        "memory_stats"
    }

    fn poll(&mut self) -> Result<usize> {
        let mut data = self
            .client
            .get_data(&self.session, TimeRange::since(self.last_timestamp))?;

        let mut dumps = Vec::new();
        let mut newly_settled_dumps = Vec::new();
        for info in data
            .heap_dump_infos
            .iter()
            .filter(|i| i.is_complete() && !self.settled_dumps.contains(&i.start_time))
        {
            let stored = self.table.get_heap_dump_status(&self.session, info.start_time)?;
            if matches!(stored, DumpStatus::Success | DumpStatus::FailureUnknown) {
                newly_settled_dumps.push(info.start_time);
                continue;
            }
            if let Some(dump) = self.fetch_dump(info)? {
                newly_settled_dumps.push(dump.start_time);
                dumps.push(dump);
            }
        }

        let mut legacy = Vec::new();
        let mut newly_settled_legacy = Vec::new();
        for info in &mut data.allocations_infos {
            if !info.legacy
                || info.status != AllocationsStatus::Completed
                || self.settled_legacy.contains(&info.start_time)
            {
                continue;
            }
            match self.fetch_legacy(info)? {
                LegacyOutcome::Fetched(fetched) => {
                    newly_settled_legacy.push(info.start_time);
                    legacy.push(fetched);
                }
                LegacyOutcome::Pending => {}
                LegacyOutcome::Failed => {
                    debug!(
                        session_id = self.session.session_id,
                        start_time = info.start_time,
                        "legacy allocation artifacts unavailable"
                    );
                    info.status = AllocationsStatus::FailureUnknown;
                    newly_settled_legacy.push(info.start_time);
                }
            }
        }

        let latest = data.latest_sample_timestamp();
        let batch = MemoryPollBatch {
            data,
            dumps,
            legacy,
        };
        let rows = self.table.insert_poll_batch(&self.session, &batch)?;

        self.settled_dumps.extend(newly_settled_dumps);
        self.settled_legacy.extend(newly_settled_legacy);
        if let Some(latest) = latest {
            self.last_timestamp = self.last_timestamp.max(latest);
        }
        Ok(rows)
    }
}
