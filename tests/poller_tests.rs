use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use wmipoll::daemon::connector::{Connector, Endpoint};
use wmipoll::daemon::poller::{PollState, Poller, PollerSettings};
use wmipoll::daemon::sink::{EventSink, event_queue};
use wmipoll::daemon::stop::StopSignal;
use wmipoll::daemon::testing::{CollectingSink, Reply, ScriptedTransport, StaticResolver};
use wmipoll_core::{Decorate, Event, FieldDecorator, NoDecoration, PropertyValue, Record, Text};

fn connector(transport: &ScriptedTransport) -> Connector {
    let resolver = StaticResolver::new("WKS-01").with_alias("srv", "srv.corp.example");
    Connector::new(Arc::new(transport.clone()), Arc::new(resolver))
}

fn spawn_poller(
    transport: &ScriptedTransport,
    endpoint: Endpoint,
    decorator: Arc<dyn Decorate>,
    sink: Arc<dyn EventSink>,
    interval: Duration,
) -> (StopSignal, thread::JoinHandle<Poller>) {
    let stop = StopSignal::new();
    let mut poller = Poller::new(
        PollerSettings::new("it", "select * from Foo", interval),
        endpoint,
        connector(transport),
        decorator,
        sink,
        stop.clone(),
    );
    let handle = thread::spawn(move || {
        poller.run();
        poller
    });
    (stop, handle)
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn immediate_cancel_terminates_quickly() {
    let rows: Vec<Record> = (0..10_000).map(|i| Record::new().with("Index", i as i64)).collect();
    let transport = ScriptedTransport::new(Vec::new()).otherwise(Reply::Rows(rows));
    let sink = Arc::new(CollectingSink::new());
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(NoDecoration),
        sink.clone(),
        Duration::from_secs(30),
    );

    let started = Instant::now();
    stop.stop();
    let poller = handle.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(transport.executions() <= 1);
    assert!(sink.len() <= 10_000);
    assert_eq!(poller.stats().state(), PollState::Stopped);
}

#[test]
fn always_failing_session_stays_cancellable() {
    let transport = ScriptedTransport::new(Vec::new()).otherwise(Reply::Fail("invalid class".into()));
    let sink = Arc::new(CollectingSink::new());
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(NoDecoration),
        sink.clone(),
        Duration::from_millis(20),
    );

    wait_for(|| transport.executions() >= 3);
    stop.stop();
    let poller = handle.join().unwrap();
    let executions = transport.executions();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(transport.executions(), executions, "retried after stop");
    assert!(sink.is_empty());

    let stats = poller.stats().snapshot();
    assert!(stats.errors >= 3);
    assert_eq!(stats.cycles, 0);
    assert!(stats.last_error.unwrap().contains("invalid class"));
}

#[test]
fn cancel_during_backoff_is_observed_before_the_interval_ends() {
    let transport = ScriptedTransport::new(Vec::new()).otherwise(Reply::Fail("rpc unavailable".into()));
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(NoDecoration),
        Arc::new(CollectingSink::new()),
        Duration::from_secs(60),
    );

    wait_for(|| transport.executions() == 1);
    let started = Instant::now();
    stop.stop();
    handle.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(transport.executions(), 1);
}

#[test]
fn property_named_host_overrides_resolved_host() {
    let transport = ScriptedTransport::new(vec![Reply::Rows(vec![
        Record::new().with("Name", "a"),
        Record::new().with("host", "reported-by-provider").with("Name", "b"),
    ])]);
    let sink = Arc::new(CollectingSink::new());
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(NoDecoration),
        sink.clone(),
        Duration::from_secs(30),
    );

    wait_for(|| sink.len() == 2);
    stop.stop();
    handle.join().unwrap();

    let events = sink.events();
    assert_eq!(events[0].host(), Some("WKS-01"));
    assert_eq!(events[1].host(), Some("reported-by-provider"));
}

#[test]
fn decoration_runs_once_per_event_before_properties() {
    let calls = Arc::new(AtomicUsize::new(0));
    let decorator = {
        let calls = Arc::clone(&calls);
        move |event: &mut Event| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(event.host().is_some(), "host is set before decoration");
            event.set("Status", "decorated");
            event.set("source", "wmi");
        }
    };
    let transport = ScriptedTransport::new(vec![Reply::Rows(vec![
        Record::new().with("Status", "OK"),
        Record::new().with("Status", "Degraded"),
        Record::new().with("Name", "no-status"),
    ])]);
    let sink = Arc::new(CollectingSink::new());
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(decorator),
        sink.clone(),
        Duration::from_secs(30),
    );

    wait_for(|| sink.len() == 3);
    stop.stop();
    handle.join().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let events = sink.events();
    assert_eq!(events[0].get("Status"), Some(&json!("OK")));
    assert_eq!(events[1].get("Status"), Some(&json!("Degraded")));
    assert_eq!(events[2].get("Status"), Some(&json!("decorated")));
    assert!(events.iter().all(|e| e.get("source") == Some(&json!("wmi"))));
}

#[test]
fn failed_first_query_recovers_on_next_cycle_after_one_interval() {
    let interval = Duration::from_millis(200);
    let transport = ScriptedTransport::new(vec![
        Reply::Fail("WBEM_E_INVALID_QUERY".into()),
        Reply::Rows(vec![Record::new().with("Name", "a").with("Value", 1i64)]),
    ]);
    let sink = Arc::new(CollectingSink::new());
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(NoDecoration),
        sink.clone(),
        interval,
    );

    wait_for(|| transport.executions() == 1);
    assert!(sink.is_empty());
    wait_for(|| sink.len() == 1);
    stop.stop();
    let poller = handle.join().unwrap();

    let times = transport.execution_times();
    assert!(times[1].duration_since(times[0]) >= interval);
    assert_eq!(poller.stats().snapshot().errors, 1);
    assert_eq!(sink.events()[0].get("Value"), Some(&json!(1)));
}

#[test]
fn non_utf8_strings_are_normalized_and_other_values_untouched() {
    let record = Record::new()
        .with("Caption", PropertyValue::Text(Text::Latin1(b"Caf\xe9".to_vec())))
        .with(
            "Description",
            PropertyValue::Text(Text::Utf16("Disk 0".encode_utf16().chain([0, 0]).collect())),
        )
        .with("Size", 512_110_190_592u64)
        .with("Healthy", true)
        .with("Load", 0.25);
    let transport = ScriptedTransport::new(vec![Reply::Rows(vec![record])]);
    let sink = Arc::new(CollectingSink::new());
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(NoDecoration),
        sink.clone(),
        Duration::from_secs(30),
    );

    wait_for(|| sink.len() == 1);
    stop.stop();
    handle.join().unwrap();

    let event = &sink.events()[0];
    assert_eq!(event.get("Caption"), Some(&json!("Café")));
    assert_eq!(event.get("Description"), Some(&json!("Disk 0")));
    assert_eq!(event.get("Size"), Some(&json!(512_110_190_592u64)));
    assert_eq!(event.get("Healthy"), Some(&json!(true)));
    assert_eq!(event.get("Load"), Some(&json!(0.25)));
}

#[test]
fn remote_endpoint_is_honored_and_labels_events_with_canonical_name() {
    let transport = ScriptedTransport::new(vec![Reply::Rows(vec![
        Record::new().with("Name", "vm01"),
    ])]);
    let sink = Arc::new(CollectingSink::new());
    let endpoint = Endpoint::remote("srv")
        .with_namespace("root\\virtualization\\v2")
        .with_credentials("CORP\\svc-monitor", "secret");
    let (stop, handle) = spawn_poller(
        &transport,
        endpoint,
        Arc::new(FieldDecorator::new().with_type(Some("hyperv".into()))),
        sink.clone(),
        Duration::from_secs(30),
    );

    wait_for(|| sink.len() == 1);
    stop.stop();
    handle.join().unwrap();

    assert_eq!(
        transport.opened(),
        vec!["remote:srv.corp.example:root\\virtualization\\v2:CORP\\svc-monitor".to_string()]
    );
    let event = &sink.events()[0];
    assert_eq!(event.host(), Some("srv.corp.example"));
    assert_eq!(event.get("type"), Some(&json!("hyperv")));
}

#[test]
fn queue_backpressure_does_not_block_cancellation() {
    let rows: Vec<Record> = (0..50).map(|i| Record::new().with("Index", i as i64)).collect();
    let transport = ScriptedTransport::new(vec![Reply::Rows(rows)]);
    let (sink, rx) = event_queue(2);
    let (stop, handle) = spawn_poller(
        &transport,
        Endpoint::default(),
        Arc::new(NoDecoration),
        Arc::new(sink),
        Duration::from_secs(30),
    );

    wait_for(|| rx.is_full());
    let started = Instant::now();
    stop.stop();
    handle.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    let drained: Vec<Event> = rx.try_iter().collect();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].get("Index"), Some(&json!(0)));
}
