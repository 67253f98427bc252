//! Memory statistics, heap dumps, and allocation tracking messages.

use serde::{Deserialize, Serialize};

use super::{DumpStatus, UNSPECIFIED_END};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemorySample {
    pub timestamp: i64,
    pub java_mem: i64,
    pub native_mem: i64,
    pub stack_mem: i64,
    pub graphics_mem: i64,
    pub code_mem: i64,
    pub others_mem: i64,
    pub total_mem: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VmStatsSample {
    pub timestamp: i64,
    pub alloc_count: i64,
    pub free_count: i64,
    pub gc_count: i64,
}

/// Descriptor of one heap dump; `end_time == UNSPECIFIED_END` while dumping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDumpInfo {
    pub start_time: i64,
    pub end_time: i64,
    pub success: bool,
}

impl Default for HeapDumpInfo {
    fn default() -> Self {
        Self {
            start_time: 0,
            end_time: UNSPECIFIED_END,
            success: false,
        }
    }
}

impl HeapDumpInfo {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end_time != UNSPECIFIED_END
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AllocationsStatus {
    #[default]
    Unspecified,
    InProgress,
    Completed,
    FailureUnknown,
}

/// Descriptor of one allocation tracking window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationsInfo {
    pub start_time: i64,
    pub end_time: i64,
    pub status: AllocationsStatus,
    /// Legacy tracking produces an events blob plus a raw dump instead of a
    /// live event stream
    pub legacy: bool,
}

impl Default for AllocationsInfo {
    fn default() -> Self {
        Self {
            start_time: 0,
            end_time: UNSPECIFIED_END,
            status: AllocationsStatus::Unspecified,
            legacy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocationSamplingRateEvent {
    pub timestamp: i64,
    /// Record one allocation out of this many; 0 disables tracking
    pub sampling_num_interval: i32,
}

/// Everything the stats poller reads in one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemoryData {
    pub mem_samples: Vec<MemorySample>,
    pub vm_stats_samples: Vec<VmStatsSample>,
    pub heap_dump_infos: Vec<HeapDumpInfo>,
    pub allocations_infos: Vec<AllocationsInfo>,
}

impl MemoryData {
    /// Latest timestamp carried by any sample
    #[must_use]
    pub fn latest_sample_timestamp(&self) -> Option<i64> {
        let mem = self.mem_samples.iter().map(|s| s.timestamp);
        let vm = self.vm_stats_samples.iter().map(|s| s.timestamp);
        mem.chain(vm).max()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JvmtiDataResponse {
    pub sampling_rate_events: Vec<AllocationSamplingRateEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AllocationEventKind {
    #[default]
    Alloc,
    Free,
}

/// A single live-allocation event; `tag` identifies the object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocationEvent {
    pub kind: AllocationEventKind,
    pub tag: i32,
    pub class_tag: i32,
    pub size: i64,
    pub stack_id: i64,
    pub thread_id: i32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocatedClass {
    pub class_tag: i32,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    pub line_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocationStack {
    pub stack_id: i64,
    pub frames: Vec<StackFrame>,
}

/// A native return address and, once symbolized, its symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NativeFrame {
    pub address: i64,
    pub module_name: String,
    pub module_offset: i64,
    pub symbol_name: String,
    pub file_name: String,
    pub line_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NativeCallStack {
    pub frames: Vec<NativeFrame>,
}

/// Method id to name mapping reported alongside allocation stacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocatedMethod {
    pub method_id: i64,
    pub method_name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StackFrameInfoResponse {
    pub method_name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JniRefEventKind {
    #[default]
    CreateGlobalRef,
    DeleteGlobalRef,
}

/// Creation or deletion of one JNI global reference.
///
/// `ref_value` identifies the reference; `backtrace` holds native return
/// addresses resolvable through the native frame table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JniGlobalRefEvent {
    pub kind: JniRefEventKind,
    pub object_tag: i32,
    pub ref_value: i64,
    pub thread_id: i32,
    pub timestamp: i64,
    pub backtrace: Vec<i64>,
}

/// JNI reference events for a range, or the references alive at a point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchJniGlobalRefEvent {
    pub timestamp: i64,
    pub events: Vec<JniGlobalRefEvent>,
}

/// One round of allocation data pulled from the in-process agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JvmtiBatch {
    pub timestamp: i64,
    pub events: Vec<AllocationEvent>,
    pub classes: Vec<AllocatedClass>,
    pub stacks: Vec<AllocationStack>,
    pub methods: Vec<AllocatedMethod>,
    pub native_frames: Vec<NativeFrame>,
    pub jni_ref_events: Vec<JniGlobalRefEvent>,
    pub sampling_rate_events: Vec<AllocationSamplingRateEvent>,
}

impl JvmtiBatch {
    /// Newest event timestamp carried by the batch
    #[must_use]
    pub fn latest_event_timestamp(&self) -> Option<i64> {
        let allocs = self.events.iter().map(|e| e.timestamp);
        let refs = self.jni_ref_events.iter().map(|e| e.timestamp);
        let rates = self.sampling_rate_events.iter().map(|r| r.timestamp);
        allocs.chain(refs).chain(rates).max()
    }
}

/// Allocation events for a range, or a live-object snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchAllocationSample {
    pub timestamp: i64,
    pub events: Vec<AllocationEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocationContextsResponse {
    pub allocated_classes: Vec<AllocatedClass>,
    pub allocation_stacks: Vec<AllocationStack>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LatestAllocationTimeResponse {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TriggerHeapDumpStatus {
    #[default]
    Unspecified,
    Success,
    InProgress,
    NotProfiling,
    FailureUnknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriggerHeapDumpResponse {
    pub status: TriggerHeapDumpStatus,
    pub info: HeapDumpInfo,
}

/// Bytes of a dump-like artifact together with its readiness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DumpDataResponse {
    pub status: DumpStatus,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListHeapDumpInfosResponse {
    pub infos: Vec<HeapDumpInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrackAllocationsStatus {
    #[default]
    Unspecified,
    Success,
    InProgress,
    NotEnabled,
    NotProfiling,
    FailureUnknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackAllocationsResponse {
    pub status: TrackAllocationsStatus,
    pub info: AllocationsInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LegacyAllocationEvent {
    pub class_id: i32,
    pub stack_id: i32,
    pub thread_id: i32,
    pub size: i32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LegacyAllocationEventsResponse {
    pub status: DumpStatus,
    pub events: Vec<LegacyAllocationEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ForceGcStatus {
    #[default]
    Unspecified,
    Success,
    NotFound,
    FailureUnknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ForceGarbageCollectionResponse {
    pub status: ForceGcStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SetSamplingRateResponse {
    pub applied: bool,
}
