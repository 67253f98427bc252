//! Unified event streams: polling, command routing, and grouped reads.

mod common;

use std::sync::Arc;

use common::{FakeAgent, TestStore};
use perfstore_core::client::ProfilerClient;
use perfstore_core::types::DeviceId;
use perfstore_core::types::profiler::ConfigureStartupAgentRequest;
use perfstore_core::types::stream::{
    Command, CommandKind, EventKind, EventPayload, GetEventGroupsRequest, Stream, UnifiedEvent,
};

const DEVICE: DeviceId = DeviceId(21);
const STREAM: Stream = Stream {
    stream_id: 42,
    device_id: 21,
};

fn session_event(group_id: i64, timestamp: i64, is_ended: bool) -> UnifiedEvent {
    UnifiedEvent {
        kind: EventKind::Session,
        pid: 300,
        group_id,
        timestamp,
        is_ended,
        payload: EventPayload::Text("app".into()),
    }
}

fn stream_events(harness: &TestStore) -> Vec<UnifiedEvent> {
    let groups = harness
        .store
        .profiler()
        .get_event_groups(&GetEventGroupsRequest {
            kind: EventKind::Stream,
            group_id: Some(STREAM.stream_id),
            ..GetEventGroupsRequest::default()
        })
        .unwrap()
        .groups;
    groups.into_iter().flat_map(|g| g.events).collect()
}

fn client(agent: &Arc<FakeAgent>) -> Arc<dyn ProfilerClient> {
    Arc::clone(agent) as Arc<dyn ProfilerClient>
}

#[test]
fn connected_stream_is_polled_until_it_disconnects() {
    let harness = TestStore::new();
    let agent = FakeAgent::new(DEVICE);
    agent.state().unified_events = vec![session_event(5, 10, false), session_event(5, 20, true)];

    assert!(harness.store.on_stream_connected(STREAM, client(&agent)).unwrap());
    assert!(!harness.store.on_stream_connected(STREAM, client(&agent)).unwrap());
    assert!(harness.store.profiler().is_polling_stream(STREAM.stream_id));
    assert_eq!(harness.tick(), 1);
    harness.tick();

    let groups = harness
        .store
        .profiler()
        .get_event_groups(&GetEventGroupsRequest {
            kind: EventKind::Session,
            ..GetEventGroupsRequest::default()
        })
        .unwrap()
        .groups;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group_id, 5);
    assert_eq!(groups[0].events.len(), 2);

    assert_eq!(harness.store.on_stream_disconnected(STREAM.stream_id).unwrap(), 1);
    assert_eq!(harness.store.on_stream_disconnected(STREAM.stream_id).unwrap(), 0);
    assert!(!harness.store.profiler().is_polling_stream(STREAM.stream_id));
    assert_eq!(harness.tick(), 0);

    let events = stream_events(&harness);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload, EventPayload::StreamConnected(STREAM));
    assert_eq!(events[1].payload, EventPayload::StreamDisconnected(STREAM));
    assert!(events[0].timestamp < events[1].timestamp);
    assert!(!events[0].is_ended);
    assert!(events[1].is_ended);
}

#[test]
fn reserved_stream_id_is_refused() {
    let harness = TestStore::new();
    let agent = FakeAgent::new(DEVICE);
    let reserved = Stream {
        stream_id: 0,
        device_id: DEVICE.0,
    };
    assert!(!harness.store.on_stream_connected(reserved, client(&agent)).unwrap());
    assert_eq!(harness.executor.pending(), 0);
}

#[test]
fn commands_are_routed_to_their_stream() {
    let harness = TestStore::new();
    let agent = FakeAgent::new(DEVICE);
    harness.store.on_stream_connected(STREAM, client(&agent)).unwrap();

    let command = Command {
        stream_id: STREAM.stream_id,
        pid: 300,
        kind: CommandKind::Echo,
        payload: "ping".into(),
    };
    let profiler = harness.store.profiler();
    assert!(profiler.execute(&command).unwrap().accepted);
    let elsewhere = Command {
        stream_id: 9,
        ..command.clone()
    };
    assert!(!profiler.execute(&elsewhere).unwrap().accepted);
    assert_eq!(agent.state().executed, vec![command.clone()]);

    harness.store.on_stream_disconnected(STREAM.stream_id).unwrap();
    assert!(!profiler.execute(&command).unwrap().accepted);
}

#[test]
fn startup_agent_goes_to_the_stream_or_the_device() {
    let harness = TestStore::new();
    let request = |device_id| ConfigureStartupAgentRequest {
        device_id,
        app_package_name: "com.example.app".into(),
        agent_lib_file_name: "libperfa.so".into(),
    };
    let profiler = harness.store.profiler();
    assert_eq!(profiler.configure_startup_agent(&request(DEVICE.0)).unwrap().agent_args, "");

    let device_agent = harness.connect(DEVICE);
    device_agent.state().startup_agent_args = "device-args".into();
    let stream_agent = FakeAgent::new(DEVICE);
    stream_agent.state().startup_agent_args = "stream-args".into();
    stream_agent.state().time_ns = 77;
    harness.store.on_stream_connected(STREAM, client(&stream_agent)).unwrap();

    assert_eq!(
        profiler.configure_startup_agent(&request(DEVICE.0)).unwrap().agent_args,
        "device-args"
    );
    assert_eq!(
        profiler
            .configure_startup_agent(&request(STREAM.stream_id))
            .unwrap()
            .agent_args,
        "stream-args"
    );
    assert_eq!(
        profiler
            .get_current_time(DeviceId(STREAM.stream_id))
            .unwrap()
            .timestamp_ns,
        77
    );
}

#[test]
fn device_disconnect_closes_its_streams() {
    let harness = TestStore::new();
    let agent = harness.connect(DEVICE);
    harness.store.on_stream_connected(STREAM, client(&agent)).unwrap();

    // stream poller plus device poller
    assert_eq!(harness.store.on_device_disconnected(DEVICE), 2);
    assert!(!harness.store.profiler().is_polling_stream(STREAM.stream_id));
    assert_eq!(harness.executor.pending(), 0);
    let events = stream_events(&harness);
    assert_eq!(events.last().map(|e| e.is_ended), Some(true));
}
