//! Coordinators against the in-memory hub.

use std::sync::{Arc, Mutex};
use tidesync_codec::Value;
use tidesync_core::store::{client_id_value, EventFilter, EventKind};
use tidesync_core::DoneFn;
use tidesync_engine::{
    HubTransport, SessionState, SyncConfig, SyncCoordinator, SyncError, SyncResult,
};
use tidesync_protocol::{
    ErrorCode, ErrorPayload, HubEvent, InitializeResponse, Outgoing, RequestMessage,
    TableSnapshot, TransactionMessage,
};
use tidesync_testkit::{company, contact, crm_schema, init_tracing, HubConfig, MemoryHub};

/// One client's link to a shared [`MemoryHub`].
struct HubLink {
    hub: MemoryHub,
    client: &'static str,
}

impl HubTransport for HubLink {
    fn initialize(&self, area: &str, module_id: &str) -> SyncResult<InitializeResponse> {
        self.hub
            .initialize(self.client, area, module_id)
            .map_err(SyncError::from_payload)
    }

    fn load_table(&self, table: &str) -> SyncResult<TableSnapshot> {
        self.hub
            .load_table(self.client, table)
            .map_err(SyncError::from_payload)
    }

    fn execute_request(&self, request: &RequestMessage) -> SyncResult<()> {
        self.hub
            .execute(self.client, &Outgoing::Request(request.clone()))
            .map_err(SyncError::from_payload)
    }

    fn execute_transaction(&self, transaction: &TransactionMessage) -> SyncResult<()> {
        self.hub
            .execute(self.client, &Outgoing::Transaction(transaction.clone()))
            .map_err(SyncError::from_payload)
    }

    fn poll_events(&self) -> SyncResult<Vec<HubEvent>> {
        self.hub
            .poll_events(self.client)
            .map_err(SyncError::from_payload)
    }

    fn is_connected(&self) -> bool {
        self.hub.is_connected(self.client)
    }

    fn close(&self) -> SyncResult<()> {
        self.hub.disconnect(self.client);
        Ok(())
    }
}

type Coordinator = SyncCoordinator<HubLink>;

fn connect(hub: &MemoryHub, client: &'static str) -> Coordinator {
    init_tracing();
    let link = HubLink {
        hub: hub.clone(),
        client,
    };
    let config = SyncConfig::new("crm", "contacts").with_load_batch_rows(2);
    let mut coordinator = SyncCoordinator::new(config, link).unwrap();
    coordinator.start().unwrap();
    settle(&mut coordinator);
    assert_eq!(coordinator.state(), SessionState::Running);
    coordinator
}

/// Polls until nothing is left to send or receive.
fn settle(coordinator: &mut Coordinator) {
    for _ in 0..20 {
        coordinator.poll().unwrap();
    }
}

fn reconnect(hub: &MemoryHub, coordinator: &mut Coordinator, client: &str) {
    hub.reconnect(client);
    coordinator.heartbeat().unwrap();
    assert_eq!(coordinator.state(), SessionState::Synchronizing);
    settle(coordinator);
    assert_eq!(coordinator.state(), SessionState::Running);
}

type Outcomes = Arc<Mutex<Vec<Result<(), ErrorPayload>>>>;

fn recorder() -> (Outcomes, impl Fn() -> Option<DoneFn>) {
    let outcomes: Outcomes = Arc::default();
    let shared = Arc::clone(&outcomes);
    let make = move || -> Option<DoneFn> {
        let shared = Arc::clone(&shared);
        let done: DoneFn = Box::new(move |outcome| shared.lock().unwrap().push(outcome));
        Some(done)
    };
    (outcomes, make)
}

fn count_events(coordinator: &mut Coordinator, kind: EventKind) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0));
    let shared = Arc::clone(&count);
    coordinator.add_event_listener(
        EventFilter::new(kind),
        Box::new(move |_| *shared.lock().unwrap() += 1),
    );
    count
}

#[test]
fn changes_reach_the_other_session() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    hub.insert("Company", company("Initech", None));
    let mut alice = connect(&hub, "alice");
    let mut bob = connect(&hub, "bob");
    assert_eq!(bob.database().live_rows("Company").len(), 1);

    alice.begin_transaction(Some("Onboarding".into()), true);
    let acme = alice.add("Company", company("Acme", None), None).unwrap();
    alice
        .add("Contact", contact("ann@acme", "Ann", Some(acme.id)), None)
        .unwrap();
    alice.end_transaction().unwrap();
    alice.commit().unwrap();
    settle(&mut alice);
    settle(&mut bob);

    assert!(alice.pipeline().is_idle());
    let companies = bob.database().live_rows("Company");
    assert_eq!(companies.len(), 2);
    let bob_acme = companies
        .iter()
        .find(|c| c.values[0] == Value::from("Acme"))
        .unwrap();
    let bob_ann = &bob.database().live_rows("Contact")[0];
    assert_eq!(bob_ann.values[2], client_id_value(bob_acme.id));
    assert_eq!(bob.stats().notifications, 1);
    assert_eq!(alice.stats().groups_acknowledged, 1);
}

#[test]
fn offline_mutations_are_replayed_after_reconnect() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = connect(&hub, "alice");
    let loads = count_events(&mut alice, EventKind::Load);

    hub.disconnect("alice");
    alice.heartbeat().unwrap();
    assert_eq!(alice.state(), SessionState::ReadyToSynchronize);

    let (outcomes, done) = recorder();
    let acme = alice.add("Company", company("Acme", None), done()).unwrap();
    alice
        .add("Contact", contact("ann@acme", "Ann", Some(acme.id)), done())
        .unwrap();
    alice.commit().unwrap();
    assert!(hub.live_records("Company").is_empty());

    reconnect(&hub, &mut alice, "alice");

    assert_eq!(*outcomes.lock().unwrap(), vec![Ok(()), Ok(())]);
    let company_id = hub.live_records("Company")[0].id.unwrap();
    assert_eq!(
        hub.live_records("Contact")[0].values[2],
        Value::Integer(company_id)
    );
    assert!(alice.pipeline().is_idle());
    assert_eq!(*loads.lock().unwrap(), 3);
    assert_eq!(alice.stats().resynchronizations, 1);
    assert_eq!(alice.stats().groups_replayed, 2);
}

#[test]
fn processed_requests_are_not_sent_twice() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = connect(&hub, "alice");

    let (outcomes, done) = recorder();
    let acme = alice.add("Company", company("Acme", None), done()).unwrap();
    alice.commit().unwrap();
    // The hub processed the request, the reply is lost with the session.
    hub.disconnect("alice");
    alice.heartbeat().unwrap();

    let current = alice.database().get_row_by_id("Company", acme.id).unwrap();
    alice
        .update("Company", &current, company("Acme", Some("Rome")), done())
        .unwrap();
    alice.commit().unwrap();

    reconnect(&hub, &mut alice, "alice");

    assert_eq!(*outcomes.lock().unwrap(), vec![Ok(()), Ok(())]);
    let companies = hub.live_records("Company");
    assert_eq!(companies.len(), 1);
    assert_eq!(companies[0].values, company("Acme", Some("Rome")));
    assert_eq!(hub.last_sequence_id("alice"), 3);
    assert_eq!(alice.database().live_rows("Company").len(), 1);
}

#[test]
fn stale_replay_is_discarded() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let id = hub.insert("Company", company("Acme", None)).unwrap();
    let mut alice = connect(&hub, "alice");
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&errors);
    alice.add_event_listener(
        EventFilter::new(EventKind::Error),
        Box::new(move |event| seen.lock().unwrap().push(event.errors.clone())),
    );

    hub.disconnect("alice");
    alice.heartbeat().unwrap();
    let client_id = alice.database().client_id_for_server_id("Company", id).unwrap();
    let current = alice.database().get_row_by_id("Company", client_id).unwrap();
    let (outcomes, done) = recorder();
    alice
        .update("Company", &current, company("Acme", Some("Rome")), done())
        .unwrap();
    alice.commit().unwrap();
    hub.update("Company", id, company("Acme", Some("Oslo")));

    reconnect(&hub, &mut alice, "alice");

    let outcomes = outcomes.lock().unwrap();
    let [Err(refused)] = outcomes.as_slice() else {
        panic!("expected one failure, got {outcomes:?}");
    };
    assert!(refused.has_code(&ErrorCode::RecordDifferent));
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(
        alice.database().live_rows("Company")[0].values,
        company("Acme", Some("Oslo"))
    );
    assert_eq!(alice.stats().groups_failed, 1);
}

#[test]
fn open_transaction_survives_resynchronization() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = connect(&hub, "alice");

    alice.begin_transaction(None, true);
    alice.begin_transaction(None, true);
    alice.add("Company", company("Acme", None), None).unwrap();
    hub.disconnect("alice");
    alice.heartbeat().unwrap();
    reconnect(&hub, &mut alice, "alice");

    assert!(alice.pipeline().in_transaction());
    assert_eq!(alice.end_transaction().unwrap(), 1);
    let acme = alice.database().live_rows("Company")[0].clone();
    alice
        .add("Contact", contact("ann@acme", "Ann", Some(acme.id)), None)
        .unwrap();
    assert_eq!(alice.end_transaction().unwrap(), 0);
    alice.commit().unwrap();
    settle(&mut alice);

    assert_eq!(hub.live_records("Company").len(), 1);
    assert_eq!(hub.live_records("Contact").len(), 1);
    assert!(alice.pipeline().is_idle());
}

#[test]
fn schema_change_stops_the_session() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = connect(&hub, "alice");
    let errors = count_events(&mut alice, EventKind::Error);

    hub.disconnect("alice");
    alice.heartbeat().unwrap();
    let mut schema = crm_schema();
    schema.tables.pop();
    hub.set_schema(schema);
    hub.reconnect("alice");

    let error = alice.heartbeat().unwrap_err();
    assert!(matches!(error, SyncError::SchemaMismatch));
    assert_eq!(error.code(), ErrorCode::UnableSynchronization);
    assert_eq!(alice.state(), SessionState::Error);
    assert_eq!(*errors.lock().unwrap(), 1);
}

#[test]
fn echoed_notification_merges_with_the_pending_row() {
    let hub = MemoryHub::new(
        crm_schema(),
        HubConfig::default().with_echo_notifications(true),
    );
    let mut alice = connect(&hub, "alice");

    let acme = alice.add("Company", company("Acme", None), None).unwrap();
    alice.commit().unwrap();
    settle(&mut alice);

    let rows = alice.database().live_rows("Company");
    assert_eq!(rows.len(), 1);
    let id = hub.live_records("Company")[0].id.unwrap();
    let holder = alice.database().client_id_for_server_id("Company", id).unwrap();
    assert_eq!(rows[0].id, holder);
    assert_ne!(holder, acme.id);
    assert!(alice.database().get_row_by_id("Company", acme.id).unwrap().deleted);
    assert!(alice.pipeline().is_idle());
}

#[test]
fn close_keeps_buffering() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = connect(&hub, "alice");

    alice.close().unwrap();
    assert_eq!(alice.state(), SessionState::ReadyToSynchronize);
    alice.add("Company", company("Acme", None), None).unwrap();
    alice.commit().unwrap();
    assert!(hub.live_records("Company").is_empty());

    reconnect(&hub, &mut alice, "alice");
    assert_eq!(hub.live_records("Company").len(), 1);
}
