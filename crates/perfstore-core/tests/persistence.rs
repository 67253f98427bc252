//! On-disk namespaces surviving a restart.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{session, usage};
use perfstore_core::DataStore;
use perfstore_core::config::Config;
use perfstore_core::executor::ManualExecutor;
use perfstore_core::storage::{BackingNamespace, SqliteConnectionProvider};
use perfstore_core::types::cpu::TraceInfo;
use perfstore_core::types::memory::HeapDumpInfo;
use perfstore_core::types::profiler::{ImportSessionRequest, SessionType};
use perfstore_core::types::{DeviceId, DumpStatus, TimeRange};

const DEVICE: DeviceId = DeviceId(2);

fn open(dir: &std::path::Path) -> DataStore {
    let provider = SqliteConnectionProvider::new(dir, Duration::from_secs(1));
    DataStore::new(&Config::default(), &provider, Arc::new(ManualExecutor::new())).unwrap()
}

#[test]
fn stored_artifacts_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(1, DEVICE);

    {
        let store = open(dir.path());
        store
            .profiler()
            .import_session(&ImportSessionRequest {
                session: s,
                session_name: "imported".into(),
                start_timestamp_epoch_ms: 10,
                session_type: SessionType::MemoryCapture,
            })
            .unwrap();
        store
            .memory()
            .import_heap_dump(
                &s,
                &HeapDumpInfo {
                    start_time: 3,
                    end_time: 4,
                    success: true,
                },
                b"dump",
            )
            .unwrap();
        store
            .cpu()
            .insert_trace(&s, &TraceInfo::default(), b"trace")
            .unwrap();
        store
            .cpu()
            .table()
            .insert_cpu_data(&s, &[usage(5)])
            .unwrap();
    }

    let reopened = open(dir.path());
    assert_eq!(reopened.profiler().get_sessions().unwrap().sessions, vec![s]);
    let dump = reopened.memory().get_heap_dump(&s, 3).unwrap();
    assert_eq!(dump.status, DumpStatus::Success);
    assert_eq!(dump.data, b"dump");
    assert_eq!(reopened.cpu().get_trace(&s, 0).unwrap().data, b"trace");
    assert_eq!(
        reopened
            .cpu()
            .get_data(&s, TimeRange::new(0, 10))
            .unwrap()
            .data,
        vec![usage(5)]
    );
}

#[test]
fn each_namespace_gets_its_own_file() {
    let dir = tempfile::tempdir().unwrap();
    let provider = SqliteConnectionProvider::new(dir.path(), Duration::from_secs(1));
    let store = DataStore::new(
        &Config::default(),
        &provider,
        Arc::new(ManualExecutor::new()),
    )
    .unwrap();

    for namespace in store.namespaces() {
        assert!(provider.database_path(&namespace).exists(), "{namespace}");
    }
    assert!(
        provider
            .database_path(&BackingNamespace::LIVE_ALLOCATIONS)
            .exists()
    );
}

#[test]
fn opening_twice_over_the_same_directory_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let first = open(dir.path());
    first
        .cpu()
        .table()
        .insert_cpu_data(&session(1, DEVICE), &[usage(1)])
        .unwrap();
    drop(first);

    let second = open(dir.path());
    let third = open(dir.path());
    assert_eq!(
        third
            .cpu()
            .get_data(&session(1, DEVICE), TimeRange::new(0, 2))
            .unwrap()
            .data
            .len(),
        1
    );
    drop(second);
}
