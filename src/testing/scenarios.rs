//! End-to-end runs of a session against recorded collaborators.

use super::{fixtures, init_tracing, Captured, TestSession};
use crate::confmon::{ConfigEvent, ConfigListener, ProviderKind};
use crate::config::{BootstrapConfig, RetryConfig};
use crate::durability::{
    encode_response, DurabilityCommand, DurabilityOptions, DurabilityResult, ObserveRequest,
    ObserveResult, ObserveStatus, SetId,
};
use crate::error::{Error, NetworkError};
use crate::transport::KvResponse;
use crate::types::{KvStatus, Opcode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RevisionLog {
    seen: Mutex<Vec<(Option<u64>, ProviderKind)>>,
}

impl ConfigListener for RevisionLog {
    fn on_event(&self, event: &ConfigEvent) {
        if let ConfigEvent::GotNewConfig { config, origin } = event {
            self.seen.lock().push((config.revision(), *origin));
        }
    }
}

fn respond_all(t: &mut TestSession, observes: &[ObserveRequest], status: ObserveStatus) {
    for request in observes {
        let results: Vec<ObserveResult> = request
            .keys()
            .unwrap()
            .into_iter()
            .map(|(vbucket, key)| ObserveResult {
                vbucket,
                key,
                status,
                cas: 1,
            })
            .collect();
        t.session
            .on_observe_response(request.set, request.server, &encode_response(&results))
            .unwrap();
        t.session.on_observe_done(request.set, request.server, None);
    }
}

fn durability_request(t: &mut TestSession, options: DurabilityOptions) -> (SetId, Captured<DurabilityResult>) {
    let done = Captured::new();
    let set = t
        .session
        .durability_poll(vec![DurabilityCommand::new(&b"foo"[..], None, done.sink())], options)
        .unwrap();
    (set, done)
}

#[test]
fn test_not_my_vbucket_with_config_reroutes() {
    init_tracing();
    let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(5, 0));
    let log = Arc::new(RevisionLog::default());
    t.session.add_listener(log.clone());

    // "foo" hashes to vbucket 115, mastered by server 1 at revision 5.
    let (id, done) = t.get("foo");
    let first = t.scheduler.last_request().unwrap();
    assert_eq!((first.vbucket, first.server, first.attempt), (115, 1, 0));

    // Server 1 rejects and attaches revision 6, where server 2 owns vbucket 115.
    t.session.on_kv_response(
        id,
        KvResponse::status(KvStatus::NotMyVbucket).with_config(fixtures::three_node_json(6, 1)),
    );
    assert_eq!(t.session.router().revision(), Some(6));
    assert_eq!(log.seen.lock().as_slice(), &[(Some(6), ProviderKind::Push)]);

    // Re-sent without waiting for the retry backoff.
    let resent = t.scheduler.last_request().unwrap();
    assert_eq!((resent.id, resent.vbucket, resent.server, resent.attempt), (id, 115, 2, 1));
    assert_eq!(t.session.retry_queue_len(), 0);

    t.session.on_kv_response(id, KvResponse::success(99));
    let response = done.single().unwrap().unwrap();
    assert_eq!((response.server, response.retries, response.cas), (2, 1, 99));

    let snapshot = t.session.metrics().snapshot();
    assert_eq!(snapshot.configs_adopted, 2);
    assert_eq!(snapshot.operations_retried, 1);
    assert_eq!(snapshot.inflight_operations, 0);
}

#[test]
fn test_stale_config_in_response_is_ignored() {
    let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(5, 0));
    let (id, _done) = t.get("foo");
    t.session.on_kv_response(
        id,
        KvResponse::status(KvStatus::NotMyVbucket).with_config(fixtures::three_node_json(4, 1)),
    );
    assert_eq!(t.session.router().revision(), Some(5));
    assert_eq!(t.session.retry_queue_len(), 1);
}

#[test]
fn test_durability_persist_two_replicate_one() {
    init_tracing();
    let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
    let (set, done) = durability_request(&mut t, DurabilityOptions::new(2, 1));

    // First sweep: master 1 and replica 2 only hold the key in memory.
    let observes = t.scheduler.take_observes();
    let servers: Vec<_> = observes.iter().map(|r| r.server).collect();
    assert_eq!(servers, vec![1, 2]);
    respond_all(&mut t, &observes, ObserveStatus::Found);
    assert!(done.is_empty());

    // Second sweep after the poll interval: both have persisted it.
    t.advance(Duration::from_millis(100));
    let observes = t.scheduler.take_observes();
    assert_eq!(observes.len(), 2);
    respond_all(&mut t, &observes, ObserveStatus::Persisted);

    let result = done.single().unwrap();
    assert_eq!(result.result, Ok(()));
    assert!(result.counts.persisted_master);
    assert_eq!((result.counts.npersisted, result.counts.nreplicated), (2, 1));
    assert!(t.session.durability().set(set).is_none());
    assert_eq!(t.session.metrics().snapshot().durability_completed, 1);
}

#[test]
fn test_durability_timeout() {
    let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
    let (set, done) = durability_request(
        &mut t,
        DurabilityOptions::new(1, 1).with_timeout(Duration::from_millis(50)),
    );
    let observes = t.scheduler.take_observes();
    assert_eq!(observes.len(), 2);

    t.advance(Duration::from_millis(60));
    let result = done.single().unwrap();
    assert_eq!(result.result, Err(Error::Timeout));
    assert_eq!(t.session.metrics().snapshot().durability_failed, 1);

    // Held until the outstanding sweep answers.
    assert!(t.session.durability().set(set).is_some());
    for request in &observes {
        t.session.on_observe_done(set, request.server, None);
    }
    assert!(t.session.durability().set(set).is_none());
    assert_eq!(done.len(), 1);
}

#[test]
fn test_durability_rejects_impossible_request() {
    let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
    let done: Captured<DurabilityResult> = Captured::new();
    let err = t
        .session
        .durability_poll(
            vec![DurabilityCommand::new(&b"foo"[..], None, done.sink())],
            DurabilityOptions::new(0, 2),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Durability(_)));
    assert!(t.scheduler.observes().is_empty());
    assert!(done.is_empty());
}

#[test]
fn test_empty_host_list_fails_bootstrap_once() {
    init_tracing();
    let mut t = TestSession::with_kv_hosts(0);
    let done = t.bootstrap();
    assert!(done.is_empty());

    t.advance(Duration::from_secs(5));
    let error = done.single().unwrap().unwrap_err();
    assert_eq!(error, Error::BootstrapTimeout);

    t.advance(Duration::from_secs(30));
    assert_eq!(done.len(), 1);
    assert_eq!(t.session.bootstrap_status(), Err(error));
    assert!(t.transport.fetches().is_empty());
}

#[test]
fn test_unreachable_hosts_fail_bootstrap_once() {
    let mut t = TestSession::with_kv_hosts(2);
    t.transport.refuse(fixtures::kv_host(0));
    t.transport.refuse(fixtures::kv_host(1));

    let done = t.bootstrap();
    assert!(done.is_empty());

    t.advance(Duration::from_secs(5));
    let error = done.single().unwrap().unwrap_err();
    assert!(matches!(error, Error::Network(NetworkError::ConnectionRefused { .. })));

    t.advance(Duration::from_secs(30));
    assert_eq!(done.len(), 1);
    assert!(t.transport.fetches().is_empty());
}

#[test]
fn test_fail_fast_bootstrap() {
    let mut settings = TestSession::settings(1);
    settings.bootstrap = BootstrapConfig::default().with_fail_fast(true);
    let mut t = TestSession::new(settings);
    t.transport.refuse(fixtures::kv_host(0));

    let done = t.bootstrap();
    let error = done.single().unwrap().unwrap_err();
    assert!(matches!(error, Error::Network(NetworkError::ConnectionRefused { .. })));
}

#[test]
fn test_node_failure_retries_read_on_new_map() {
    let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
    let (id, done) = t.get("foo");
    let (_, write_done) = t.schedule(Opcode::Set, "foo");

    t.session.on_server_failure(
        1,
        NetworkError::ConnectionReset { addr: fixtures::kv_host(1).to_string() }.into(),
    );
    // The unconditional write cannot be re-sent safely.
    assert!(matches!(
        write_done.single().unwrap(),
        Err(Error::Network(NetworkError::ConnectionReset { .. }))
    ));
    assert_eq!(t.session.retry_queue_len(), 1);

    // The cluster fails the node over; the read goes to the new master.
    t.advance(Duration::from_millis(5));
    t.session
        .on_config_pushed(&fixtures::kv_host(0), fixtures::three_node_json(2, 1).as_bytes());
    t.advance(Duration::from_millis(20));

    let resent = t.scheduler.last_request().unwrap();
    assert_eq!((resent.id, resent.server), (id, 2));
    t.session.on_kv_response(id, KvResponse::success(3));
    assert_eq!(done.single().unwrap().unwrap().server, 2);
}

#[test]
fn test_missing_owner_waits_for_config() {
    let mut settings = TestSession::settings(2);
    settings.retry = RetryConfig::default().with_retry_on_missing_node(true);
    let mut t = TestSession::new(settings);
    t.bootstrap();
    // Every vbucket unassigned.
    t.deliver_config(0, &fixtures::vbucket_config_json(1, 2, 64, 0, |_| vec![-1]));

    let (id, done) = t.get("foo");
    assert_eq!(t.session.retry_queue_len(), 1);
    assert!(t.scheduler.requests().is_empty());

    t.session.on_config_pushed(
        &fixtures::kv_host(0),
        fixtures::vbucket_config_json(2, 2, 64, 0, |_| vec![1]).as_bytes(),
    );
    t.advance(Duration::from_millis(50));
    let sent = t.scheduler.last_request().unwrap();
    assert_eq!((sent.id, sent.server), (id, 1));
    assert!(done.is_empty());
}
