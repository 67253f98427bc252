//! Response caching on the `get_data` paths.

mod common;

use common::{TestStore, session, usage};
use perfstore_core::config::Config;
use perfstore_core::types::memory::MemorySample;
use perfstore_core::types::{DeviceId, TimeRange};

const DEVICE: DeviceId = DeviceId(3);

fn populated() -> TestStore {
    let harness = TestStore::new();
    let agent = harness.connect(DEVICE);
    {
        let mut state = agent.state();
        state.cpu_usage.extend([usage(10), usage(20), usage(30)]);
        state.memory.mem_samples.push(MemorySample {
            timestamp: 10,
            java_mem: 512,
            total_mem: 2048,
            ..MemorySample::default()
        });
    }
    let s = session(1, DEVICE);
    harness.store.cpu().start_monitoring_app(&s).unwrap();
    harness.store.memory().start_monitoring_app(&s).unwrap();
    harness.tick();
    harness
}

#[test]
fn identical_request_is_served_without_touching_the_table() {
    let harness = populated();
    let cpu = harness.store.cpu();
    let s = session(1, DEVICE);
    let range = TimeRange::new(0, 25);

    let first = cpu.get_data(&s, range).unwrap();
    let queries = cpu.table().query_count();
    let second = cpu.get_data(&s, range).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.data, vec![usage(10), usage(20)]);
    assert_eq!(cpu.table().query_count(), queries);
    assert_eq!(cpu.response_cache().hits(), 1);
}

#[test]
fn different_range_goes_back_to_the_table() {
    let harness = populated();
    let cpu = harness.store.cpu();
    let s = session(1, DEVICE);

    cpu.get_data(&s, TimeRange::new(0, 25)).unwrap();
    let queries = cpu.table().query_count();
    let wider = cpu.get_data(&s, TimeRange::new(0, 35)).unwrap();

    assert_eq!(wider.data.len(), 3);
    assert_eq!(cpu.table().query_count(), queries + 1);
    assert_eq!(cpu.response_cache().misses(), 2);
}

#[test]
fn different_session_is_a_different_key() {
    let harness = populated();
    let cpu = harness.store.cpu();
    let range = TimeRange::new(0, 25);

    cpu.get_data(&session(1, DEVICE), range).unwrap();
    let other = cpu.get_data(&session(2, DEVICE), range).unwrap();

    assert!(other.data.is_empty());
    assert_eq!(cpu.response_cache().misses(), 2);
    assert_eq!(cpu.response_cache().hits(), 0);
}

#[test]
fn default_cache_remembers_only_the_last_request() {
    let harness = populated();
    let memory = harness.store.memory();
    let s = session(1, DEVICE);
    let a = TimeRange::new(0, 15);
    let b = TimeRange::new(15, 30);

    memory.get_data(&s, a).unwrap();
    memory.get_data(&s, b).unwrap();
    let queries = memory.stats_table().query_count();
    let again = memory.get_data(&s, a).unwrap();

    assert_eq!(again.mem_samples.len(), 1);
    assert!(memory.stats_table().query_count() > queries);
    assert_eq!(memory.response_cache().len(), 1);
}

#[test]
fn larger_capacity_keeps_alternating_ranges() {
    let config = Config::from_toml("[cache]\nresponse_cache_capacity = 4\n").unwrap();
    let harness = TestStore::with_config(&config);
    harness.connect(DEVICE);
    let event = harness.store.event();
    let s = session(1, DEVICE);
    let a = TimeRange::new(0, 15);
    let b = TimeRange::new(15, 30);

    event.get_activity_data(&s, a).unwrap();
    event.get_activity_data(&s, b).unwrap();
    let queries = event.table().query_count();
    event.get_activity_data(&s, a).unwrap();
    event.get_activity_data(&s, b).unwrap();

    assert_eq!(event.table().query_count(), queries);
    assert_eq!(event.response_cache().hits(), 2);
}
