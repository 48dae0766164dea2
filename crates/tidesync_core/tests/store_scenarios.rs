//! Table store scenarios: identity races, merges, staleness and rollback.

use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use tidesync_codec::Value;
use tidesync_core::store::EventKind;
use tidesync_core::{CollectingSink, Database, EventFilter};
use tidesync_protocol::{ErrorCode, Identity, Record, ServerId};
use tidesync_testkit::{company, company_push_strategy, contact, crm_schema, init_tracing};

fn database() -> Database {
    init_tracing();
    Database::new(crm_schema()).unwrap()
}

fn server_row(id: ServerId, values: Vec<Value>, tick: u64) -> Record {
    Record::new(Some(id), values, tick)
}

fn identity(db: &Database, table: &str, client_id: u64) -> Identity {
    let t = db.get_table(table).unwrap();
    t.identity(t.find_client(client_id).unwrap()).unwrap().clone()
}

fn count_events(db: &mut Database) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0));
    for kind in [EventKind::Create, EventKind::Update, EventKind::Delete] {
        let seen = Arc::clone(&count);
        db.add_event_listener(
            EventFilter::new(kind),
            Box::new(move |_| *seen.lock().unwrap() += 1),
        );
    }
    count
}

#[test]
fn creation_race_resolves_deferred_reference() {
    let mut db = database();
    let mut sink = CollectingSink::default();
    for i in 0..6 {
        db.add_from_client(&mut sink, "Company", company(&format!("Filler {i}"), None))
            .unwrap();
    }
    let acme = db
        .add_from_client(&mut sink, "Company", company("Acme", None))
        .unwrap();
    assert_eq!(acme.id, 7);

    // Another client's contact references Acme by its server id before
    // this client has heard back about Acme.
    let contact_id = db
        .update_from_server(
            "Contact",
            server_row(500, contact("bo@acme", "Bo", Some(101)), 1),
            None,
        )
        .unwrap();
    assert_eq!(db.get_row_by_id("Contact", contact_id).unwrap().values[2], Value::Null);
    assert_eq!(db.deferred_len(), 1);

    let ack = identity(&db, "Company", acme.id);
    db.update_from_server("Company", server_row(101, company("Acme", None), 1), Some(&ack));

    let resolved = db.get_row_by_id("Contact", contact_id).unwrap();
    assert_eq!(resolved.values[2], Value::Integer(7));
    assert_eq!(db.deferred_len(), 0);
    assert_eq!(
        db.get_index("Contact", "ContactCompany", &[Value::Integer(7)])
            .len(),
        1
    );
}

#[test]
fn duplicate_row_merge_keeps_pushed_row() {
    let mut db = database();
    let mut sink = CollectingSink::default();
    let acme = db
        .add_from_client(&mut sink, "Company", company("Acme", None))
        .unwrap();
    let ann = db
        .add_from_client(&mut sink, "Contact", contact("ann@acme", "Ann", Some(acme.id)))
        .unwrap();

    // The push for server id 101 arrives before the reply to our create.
    let pushed = db
        .update_from_server("Company", server_row(101, company("Acme", None), 1), None)
        .unwrap();
    assert_ne!(pushed, acme.id);

    let ack = identity(&db, "Company", acme.id);
    let canonical =
        db.update_from_server("Company", server_row(101, company("Acme", None), 1), Some(&ack));
    assert_eq!(canonical, Some(pushed));

    assert!(db.get_row_by_id("Company", acme.id).unwrap().deleted);
    assert!(!db.get_row_by_id("Company", pushed).unwrap().deleted);
    assert_eq!(db.live_rows("Company").len(), 1);
    assert_eq!(db.client_id_for_server_id("Company", 101), Some(pushed));

    let ann = db.get_row_by_id("Contact", ann.id).unwrap();
    assert_eq!(ann.values[2], Value::Integer(i64::try_from(pushed).unwrap()));
    let table = db.get_table("Contact").unwrap();
    let row = table.row(table.find_client(ann.id).unwrap()).unwrap();
    assert_eq!(row.values[2], Value::Integer(101));
}

#[test]
fn stale_update_is_dropped_without_event() {
    let mut db = database();
    let id = db
        .update_from_server("Company", server_row(101, company("Acme", Some("Oslo")), 7), None)
        .unwrap();
    let before = db.get_row_by_id("Company", id).unwrap();
    let events = count_events(&mut db);

    db.update_from_server("Company", server_row(101, company("Acme", Some("Rome")), 5), None);
    db.update_from_server("Company", server_row(101, company("Acme", Some("Rome")), 7), None);

    assert_eq!(db.get_row_by_id("Company", id).unwrap(), before);
    assert_eq!(*events.lock().unwrap(), 0);
}

#[test]
fn rollback_restores_exactly() {
    let mut db = database();
    let mut sink = CollectingSink::default();
    let id = db
        .update_from_server("Company", server_row(101, company("Acme", None), 3), None)
        .unwrap();
    let before = db.get_row_by_id("Company", id).unwrap();

    let updated = db
        .update_from_client(&mut sink, "Company", &before, company("Acme", Some("Lima")))
        .unwrap();
    assert!(db.rollback(&sink.requests.pop().unwrap()));
    assert_eq!(db.get_row_by_id("Company", id).unwrap(), before);

    db.delete_from_client(&mut sink, "Company", &before).unwrap();
    assert!(db.rollback(&sink.requests.pop().unwrap()));
    assert_eq!(db.get_row_by_id("Company", id).unwrap(), before);

    // A server change in between makes the undo a no-op.
    db.update_from_client(&mut sink, "Company", &before, updated.values.clone())
        .unwrap();
    db.update_from_server("Company", server_row(101, company("Acme", Some("Kyiv")), 4), None);
    assert!(!db.rollback(&sink.requests.pop().unwrap()));
    assert_eq!(
        db.get_row_by_id("Company", id).unwrap().values,
        company("Acme", Some("Kyiv"))
    );
}

#[test]
fn rollback_of_create_tombstones_row() {
    let mut db = database();
    let mut sink = CollectingSink::default();
    let acme = db
        .add_from_client(&mut sink, "Company", company("Acme", None))
        .unwrap();
    assert!(db.rollback(&sink.requests.pop().unwrap()));
    assert!(db.get_row_by_id("Company", acme.id).unwrap().deleted);
    assert!(db.live_rows("Company").is_empty());

    // The name is free again.
    db.add_from_client(&mut sink, "Company", company("Acme", None))
        .unwrap();
}

#[test]
fn uniqueness_uses_declared_code_and_changes_nothing() {
    let mut db = database();
    let mut sink = CollectingSink::default();
    db.add_from_client(&mut sink, "Contact", contact("ann@acme", "Ann", None))
        .unwrap();
    let rows = db.live_rows("Contact");

    let errors = db
        .add_from_client(&mut sink, "Contact", contact("ann@acme", "Another Ann", None))
        .unwrap_err();
    assert_eq!(
        errors.field_codes("Email"),
        vec![&ErrorCode::Custom("ERR_CONTACT_EMAIL_TAKEN".into())]
    );
    assert_eq!(db.live_rows("Contact"), rows);
    assert_eq!(sink.requests.len(), 1);
    assert_eq!(db.get_table("Contact").unwrap().peek_client_id(), 2);

    let errors = db
        .add_from_client(&mut sink, "Company", company("Acme", None))
        .and_then(|_| db.add_from_client(&mut sink, "Company", company("Acme", None)))
        .unwrap_err();
    assert!(errors.has_code(&ErrorCode::FieldUnique));
}

#[test]
fn client_operations_validate_before_applying() {
    let mut db = database();
    let mut sink = CollectingSink::default();

    let errors = db
        .add_from_client(&mut sink, "Contact", contact("a@x", "", Some(42)))
        .unwrap_err();
    assert_eq!(errors.field_codes("Name"), vec![&ErrorCode::FieldRequired]);
    assert_eq!(errors.field_codes("CompanyId"), vec![&ErrorCode::FieldBadFormat]);

    let errors = db
        .add_from_client(&mut sink, "Company", vec![Value::from("Acme")])
        .unwrap_err();
    assert!(errors.has_code(&ErrorCode::FieldBadFormat));

    let acme = db
        .add_from_client(&mut sink, "Company", company("Acme", None))
        .unwrap();
    let stale = acme.clone();
    db.update_from_client(&mut sink, "Company", &acme, company("Acme", Some("Bern")))
        .unwrap();
    let current = db.get_row_by_id("Company", acme.id).unwrap();
    assert_ne!(current, stale);
    // The tick is unchanged locally, the values are not.
    let errors = db
        .update_from_client(&mut sink, "Company", &stale, company("Acme", None))
        .unwrap_err();
    assert!(errors.has_code(&ErrorCode::RecordDifferent));

    db.delete_from_client(&mut sink, "Company", &current).unwrap();
    let deleted = db.get_row_by_id("Company", acme.id).unwrap();
    let errors = db
        .delete_from_client(&mut sink, "Company", &deleted)
        .unwrap_err();
    assert!(errors.has_code(&ErrorCode::RecordDeleted));

    sink.refuse = Some(ErrorCode::OutOfMemory);
    let errors = db
        .add_from_client(&mut sink, "Company", company("Globex", None))
        .unwrap_err();
    assert!(errors.has_code(&ErrorCode::OutOfMemory));
    assert!(db.get_values("Company", "Name").is_empty());
}

#[test]
fn identity_round_trip_after_acknowledgment() {
    let mut db = database();
    let mut sink = CollectingSink::default();
    let acme = db
        .add_from_client(&mut sink, "Company", company("Acme", None))
        .unwrap();
    let ann = db
        .add_from_client(&mut sink, "Contact", contact("ann@acme", "Ann", Some(acme.id)))
        .unwrap();
    let stored = |db: &Database| {
        let t = db.get_table("Contact").unwrap();
        t.row(t.find_client(ann.id).unwrap()).unwrap().values[2].clone()
    };
    assert_eq!(stored(&db), Value::Null);

    let ack = identity(&db, "Company", acme.id);
    db.update_from_server("Company", server_row(230, company("Acme", None), 1), Some(&ack));

    assert_eq!(db.client_id_for_server_id("Company", 230), Some(acme.id));
    assert_eq!(db.server_id_for_client_id("Company", acme.id), Some(230));
    assert_eq!(stored(&db), Value::Integer(230));
    assert_eq!(
        db.get_row_by_id("Contact", ann.id).unwrap().values[2],
        Value::Integer(i64::try_from(acme.id).unwrap())
    );

    let ack = identity(&db, "Contact", ann.id);
    let record = server_row(231, contact("ann@acme", "Ann", Some(230)), 1);
    db.update_from_server("Contact", record, Some(&ack));
    assert_eq!(db.client_id_for_server_id("Contact", 231), Some(ann.id));
    assert_eq!(db.deferred_len(), 0);
}

#[test]
fn notifications_are_framed() {
    let mut db = database();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::BeginNotification,
        EventKind::Create,
        EventKind::EndNotification,
    ] {
        let seen = Arc::clone(&kinds);
        db.add_event_listener(
            EventFilter::new(kind),
            Box::new(move |event| seen.lock().unwrap().push(event.kind)),
        );
    }
    db.apply_notification(
        Some("Import".into()),
        vec![tidesync_protocol::ServerRecord::new(
            "Company",
            server_row(101, company("Acme", None), 1),
        )],
    );
    assert_eq!(
        *kinds.lock().unwrap(),
        vec![
            EventKind::BeginNotification,
            EventKind::Create,
            EventKind::EndNotification
        ]
    );
}

#[test]
fn load_is_silent_until_marked() {
    let mut db = database();
    let events = count_events(&mut db);
    let loads = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&loads);
    db.add_event_listener(
        EventFilter::new(EventKind::Load),
        Box::new(move |event| seen.lock().unwrap().push(event.table.clone())),
    );

    let applied = db.load_rows(
        "Contact",
        vec![server_row(7, contact("a@x", "A", Some(3)), 1)],
    );
    db.load_rows("Company", vec![server_row(3, company("Acme", None), 1)]);
    db.mark_loaded("Company");

    assert_eq!(applied, 1);
    assert_eq!(*events.lock().unwrap(), 0);
    assert_eq!(*loads.lock().unwrap(), vec![Some("Company".to_string())]);
    let company_id = db.client_id_for_server_id("Company", 3).unwrap();
    assert_eq!(
        db.get_values("Contact", "CompanyId"),
        vec![Value::Integer(i64::try_from(company_id).unwrap())]
    );
}

proptest! {
    #[test]
    fn applying_twice_equals_applying_once(pushes in company_push_strategy(24)) {
        let mut once = Database::new(crm_schema()).unwrap();
        let mut twice = Database::new(crm_schema()).unwrap();
        for push in &pushes {
            once.update_from_server(&push.table, push.record.clone(), None);
            twice.update_from_server(&push.table, push.record.clone(), None);
            twice.update_from_server(&push.table, push.record.clone(), None);
        }
        let state = |db: &Database| -> Vec<(Record, Identity)> {
            db.get_table("Company")
                .unwrap()
                .rows()
                .map(|(r, i)| (r.clone(), i.clone()))
                .collect()
        };
        prop_assert_eq!(state(&once), state(&twice));
    }
}
