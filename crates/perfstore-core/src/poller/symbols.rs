use std::sync::Arc;

use tracing::trace;

use super::Poller;
use crate::Result;
use crate::storage::LiveAllocationTable;
use crate::types::Session;
use crate::types::memory::NativeFrame;

/// Frames resolved per round
pub const DEFAULT_BATCH_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedSymbol {
    pub symbol_name: String,
    pub file_name: String,
    pub line_number: i32,
}

/// Maps a module-relative address to a symbol.
///
/// Returning `None` records the frame as unresolvable; it is not retried.
pub trait NativeSymbolizer: Send + Sync {
    fn symbolize(&self, module_name: &str, module_offset: i64) -> Option<ResolvedSymbol>;
}

/// Resolves nothing; frames keep only their module and offset
#[derive(Debug, Clone, Copy, Default)]
pub struct NopSymbolizer;

impl NativeSymbolizer for NopSymbolizer {
    fn symbolize(&self, _module_name: &str, _module_offset: i64) -> Option<ResolvedSymbol> {
        None
    }
}

/// Symbolizes native frames recorded by the allocation stream.
pub struct SymbolPoller {
    session: Session,
    symbolizer: Arc<dyn NativeSymbolizer>,
    table: Arc<LiveAllocationTable>,
    batch_limit: usize,
}

impl SymbolPoller {
    #[must_use]
    pub fn new(
        session: Session,
        symbolizer: Arc<dyn NativeSymbolizer>,
        table: Arc<LiveAllocationTable>,
    ) -> Self {
        Self {
            session,
            symbolizer,
            table,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    #[must_use]
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }
}

impl Poller for SymbolPoller {
    fn name(&self) -> &'static str {
        "native_symbols"
    }

    fn poll(&mut self) -> Result<usize> {
        let pending = self
            .table
            .get_unresolved_native_frames(&self.session, self.batch_limit)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let resolved: Vec<NativeFrame> = pending
            .into_iter()
            .map(|frame| match self.symbolizer.symbolize(&frame.module_name, frame.module_offset) {
                Some(symbol) => NativeFrame {
                    symbol_name: symbol.symbol_name,
                    file_name: symbol.file_name,
                    line_number: symbol.line_number,
                    ..frame
                },
                None => frame,
            })
            .collect();
        trace!(
            session_id = self.session.session_id,
            frames = resolved.len(),
            "symbolized native frames"
        );
        Ok(self.table.update_native_symbols(&self.session, &resolved)?)
    }
}
