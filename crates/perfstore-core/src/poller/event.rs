use std::sync::Arc;

use super::Poller;
use crate::Result;
use crate::client::EventClient;
use crate::storage::EventTable;
use crate::types::{Session, TimeRange};

/// Pulls activity lifecycles and system interactions for one session.
///
/// Both kinds are descriptors that keep changing until they end, so each
/// round re-reads everything overlapping the cursor and replaces what is
/// stored.
pub struct EventPoller {
    session: Session,
    client: Arc<dyn EventClient>,
    table: Arc<EventTable>,
    last_timestamp: i64,
}

impl EventPoller {
    #[must_use]
    pub fn new(session: Session, client: Arc<dyn EventClient>, table: Arc<EventTable>) -> Self {
        Self {
            session,
            client,
            table,
            last_timestamp: session.start_timestamp.saturating_sub(1),
        }
    }
}

impl Poller for EventPoller {
    fn name(&self) -> &'static str {
        "event"
    }

    fn poll(&mut self) -> Result<usize> {
        let range = TimeRange::since(self.last_timestamp);
        let activities = self.client.get_activity_data(&self.session, range)?;
        let system = self.client.get_system_data(&self.session, range)?;

        // Only finished descriptors may move the cursor past them.
        let settled = activities
            .iter()
            .filter(|a| a.end_timestamp() != 0)
            .map(|a| a.end_timestamp())
            .chain(
                system
                    .iter()
                    .filter(|s| s.end_timestamp != 0)
                    .map(|s| s.end_timestamp),
            )
            .max();
        let oldest_open = activities
            .iter()
            .filter(|a| a.end_timestamp() == 0)
            .map(|a| a.start_timestamp())
            .chain(
                system
                    .iter()
                    .filter(|s| s.end_timestamp == 0)
                    .map(|s| s.start_timestamp),
            )
            .min();

        let rows = self
            .table
            .insert_poll_batch(&self.session, &activities, &system)?;

        if let Some(settled) = settled {
            let bound = oldest_open.map_or(settled, |open| settled.min(open.saturating_sub(1)));
            self.last_timestamp = self.last_timestamp.max(bound);
        }
        Ok(rows)
    }
}
