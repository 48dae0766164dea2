//! Table store and request pipeline against the in-memory hub.

use std::sync::{Arc, Mutex};
use tidesync_core::store::EventKind;
use tidesync_core::{Database, DoneFn, EventFilter, PipelineConfig, RequestPipeline, WithDone};
use tidesync_protocol::{ErrorCode, ErrorPayload, HubEvent};
use tidesync_testkit::{company, contact, crm_schema, init_tracing, HubConfig, MemoryHub};

struct Client {
    name: &'static str,
    hub: MemoryHub,
    db: Database,
    pipeline: RequestPipeline,
}

impl Client {
    fn connect(hub: &MemoryHub, name: &'static str) -> Self {
        init_tracing();
        let session = hub.initialize(name, "crm", "contacts").unwrap();
        Self {
            name,
            hub: hub.clone(),
            db: Database::new(session.schema).unwrap(),
            pipeline: RequestPipeline::new(PipelineConfig::new()),
        }
    }

    /// Commits, transmits and handles every event until the hub is quiet.
    fn sync(&mut self) {
        self.pipeline.commit();
        for message in self.pipeline.untransmitted(self.db.schema()).unwrap() {
            let id = message.request_id().unwrap();
            self.hub.execute(self.name, &message).unwrap();
            self.pipeline.mark_transmitted(id);
        }
        for event in self.hub.poll_events(self.name).unwrap() {
            match event {
                HubEvent::Reply(reply) => match reply.outcome {
                    Ok(records) => {
                        if let Some(mut group) = self.pipeline.acknowledge(reply.request_id) {
                            self.db.apply_reply(records);
                            for request in &mut group.requests {
                                request.complete(Ok(()));
                            }
                        }
                    }
                    Err(errors) => {
                        self.pipeline.fail(reply.request_id, &errors, &mut self.db);
                    }
                },
                HubEvent::Notification(notification) => self
                    .db
                    .apply_notification(notification.label, notification.records),
            }
        }
    }
}

type Outcomes = Arc<Mutex<Vec<Result<(), ErrorPayload>>>>;

fn recorder() -> (Outcomes, impl Fn() -> DoneFn) {
    let outcomes: Outcomes = Arc::default();
    let shared = Arc::clone(&outcomes);
    let make = move || -> DoneFn {
        let shared = Arc::clone(&shared);
        Box::new(move |outcome| shared.lock().unwrap().push(outcome))
    };
    (outcomes, make)
}

#[test]
fn transaction_is_acknowledged_and_ids_bound() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = Client::connect(&hub, "alice");
    let (outcomes, done) = recorder();

    alice.pipeline.begin_transaction(Some("Onboarding".into()), true);
    let acme = {
        let mut sink = WithDone::new(&mut alice.pipeline, Some(done()));
        alice
            .db
            .add_from_client(&mut sink, "Company", company("Acme", None))
            .unwrap()
    };
    let ann = alice
        .db
        .add_from_client(
            &mut alice.pipeline,
            "Contact",
            contact("ann@acme", "Ann", Some(acme.id)),
        )
        .unwrap();
    alice.pipeline.end_transaction().unwrap();
    alice.sync();

    assert!(alice.pipeline.is_idle());
    assert_eq!(alice.pipeline.size(), 0);
    assert_eq!(*outcomes.lock().unwrap(), vec![Ok(())]);

    let company_id = alice.db.server_id_for_client_id("Company", acme.id).unwrap();
    let contact_id = alice.db.server_id_for_client_id("Contact", ann.id).unwrap();
    let stored = hub.record("Contact", contact_id).unwrap();
    assert_eq!(stored.values[2], tidesync_codec::Value::Integer(company_id));
    assert_eq!(alice.db.get_row_by_id("Company", acme.id).unwrap().tick, 1);
}

#[test]
fn referencing_table_declared_first_keeps_request_order() {
    let mut schema = crm_schema();
    schema.tables.reverse();
    let hub = MemoryHub::new(schema, HubConfig::default());
    let mut alice = Client::connect(&hub, "alice");
    let (outcomes, done) = recorder();

    alice.pipeline.begin_transaction(None, true);
    let acme = {
        let mut sink = WithDone::new(&mut alice.pipeline, Some(done()));
        alice
            .db
            .add_from_client(&mut sink, "Company", company("Acme", None))
            .unwrap()
    };
    alice
        .db
        .add_from_client(
            &mut alice.pipeline,
            "Contact",
            contact("ann@acme", "Ann", Some(acme.id)),
        )
        .unwrap();
    alice.pipeline.end_transaction().unwrap();
    alice.sync();

    assert_eq!(*outcomes.lock().unwrap(), vec![Ok(())]);
    assert_eq!(hub.live_records("Company").len(), 1);
    let company_id = hub.live_records("Company")[0].id.unwrap();
    assert_eq!(
        hub.live_records("Contact")[0].values[2],
        tidesync_codec::Value::Integer(company_id)
    );
    assert_eq!(alice.db.live_rows("Contact").len(), 1);
}

#[test]
fn refused_request_rolls_back_only_itself() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = Client::connect(&hub, "alice");
    let mut bob = Client::connect(&hub, "bob");

    bob.db
        .add_from_client(&mut bob.pipeline, "Contact", contact("sam@x", "Sam", None))
        .unwrap();
    bob.sync();

    let errors_seen = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&errors_seen);
    alice.db.add_event_listener(
        EventFilter::new(EventKind::Error),
        Box::new(move |event| seen.lock().unwrap().push(event.errors.clone())),
    );
    let (outcomes, done) = recorder();
    let taken = {
        let mut sink = WithDone::new(&mut alice.pipeline, Some(done()));
        alice
            .db
            .add_from_client(&mut sink, "Contact", contact("sam@x", "Other Sam", None))
            .unwrap()
    };
    let kept = alice
        .db
        .add_from_client(&mut alice.pipeline, "Contact", contact("kim@x", "Kim", None))
        .unwrap();
    alice.sync();

    assert!(alice.db.get_row_by_id("Contact", taken.id).unwrap().deleted);
    assert!(!alice.db.get_row_by_id("Contact", kept.id).unwrap().deleted);
    assert!(alice.db.server_id_for_client_id("Contact", kept.id).is_some());

    let outcomes = outcomes.lock().unwrap();
    let [Err(errors)] = outcomes.as_slice() else {
        panic!("expected one failure, got {outcomes:?}");
    };
    assert!(errors.has_code(&ErrorCode::Custom("ERR_CONTACT_EMAIL_TAKEN".into())));
    assert_eq!(errors_seen.lock().unwrap().len(), 1);

    // Bob's contact was pushed to Alice under a row of her own.
    let mut emails = alice.db.get_values("Contact", "Email");
    emails.sort_by(|a, b| a.as_text().cmp(&b.as_text()));
    assert_eq!(
        emails,
        vec![tidesync_codec::Value::from("kim@x"), tidesync_codec::Value::from("sam@x")]
    );
}

#[test]
fn consecutive_unacknowledged_updates_all_land() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = Client::connect(&hub, "alice");
    let acme = alice
        .db
        .add_from_client(&mut alice.pipeline, "Company", company("Acme", None))
        .unwrap();
    let first = alice
        .db
        .update_from_client(&mut alice.pipeline, "Company", &acme, company("Acme", Some("Rome")))
        .unwrap();
    alice
        .db
        .update_from_client(&mut alice.pipeline, "Company", &first, company("Acme", Some("Oslo")))
        .unwrap();
    alice.sync();

    let row = alice.db.get_row_by_id("Company", acme.id).unwrap();
    assert_eq!(row.values, company("Acme", Some("Oslo")));
    assert_eq!(row.tick, 3);
    let id = alice.db.server_id_for_client_id("Company", acme.id).unwrap();
    assert_eq!(hub.record("Company", id).unwrap().values, company("Acme", Some("Oslo")));
}

#[test]
fn full_buffer_refuses_new_mutations() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = Client::connect(&hub, "alice");
    alice.pipeline = RequestPipeline::new(PipelineConfig::new().with_max_size(300));

    let mut refused = None;
    for i in 0..10 {
        match alice.db.add_from_client(
            &mut alice.pipeline,
            "Company",
            company(&format!("Company {i}"), Some("Somewhere")),
        ) {
            Ok(_) => {}
            Err(errors) => {
                refused = Some((i, errors));
                break;
            }
        }
    }
    let (accepted, errors) = refused.expect("buffer never filled");
    assert!(errors.has_code(&ErrorCode::OutOfMemory));
    assert_eq!(alice.db.live_rows("Company").len(), accepted);
    assert!(alice.pipeline.size() <= 300);

    // Acknowledgment frees the space again.
    alice.sync();
    assert_eq!(alice.pipeline.size(), 0);
    alice
        .db
        .add_from_client(&mut alice.pipeline, "Company", company("Late", None))
        .unwrap();
}

#[test]
fn rollback_unwinds_the_unsent_buffer() {
    let hub = MemoryHub::new(crm_schema(), HubConfig::default());
    let mut alice = Client::connect(&hub, "alice");
    let acme = alice
        .db
        .add_from_client(&mut alice.pipeline, "Company", company("Acme", None))
        .unwrap();
    alice.sync();
    let acme = alice.db.get_row_by_id("Company", acme.id).unwrap();

    let renamed = alice
        .db
        .update_from_client(&mut alice.pipeline, "Company", &acme, company("Acme Corp", None))
        .unwrap();
    alice
        .db
        .add_from_client(&mut alice.pipeline, "Contact", contact("a@x", "A", Some(acme.id)))
        .unwrap();
    alice
        .db
        .delete_from_client(&mut alice.pipeline, "Company", &renamed)
        .unwrap();

    assert_eq!(alice.pipeline.rollback(&mut alice.db), 3);
    assert_eq!(alice.db.get_row_by_id("Company", acme.id).unwrap(), acme);
    assert!(alice.db.live_rows("Contact").is_empty());
    alice.sync();
    assert_eq!(hub.live_records("Company")[0].values, company("Acme", None));
}
