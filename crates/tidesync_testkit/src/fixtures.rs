//! Test fixtures: a small CRM schema and row builders.
//!
//! The schema is declared in JSON, the same form hub configurations use.

use std::sync::Once;
use tidesync_codec::Value;
use tidesync_protocol::{ClientId, Schema};
use tracing_subscriber::EnvFilter;

/// JSON source of [`crm_schema`].
pub const CRM_SCHEMA_JSON: &str = r#"{
  "tables": [
    {
      "name": "Company",
      "columns": [
        { "name": "Name", "type": "text" },
        { "name": "City", "type": "text", "nullable": true }
      ],
      "constraints": [
        { "name": "CompanyName", "columns": ["Name"], "unique": true }
      ]
    },
    {
      "name": "Contact",
      "columns": [
        { "name": "Email", "type": "text" },
        { "name": "Name", "type": "text" },
        { "name": "CompanyId", "type": "integer", "nullable": true, "references": "Company" }
      ],
      "constraints": [
        { "name": "ContactEmail", "columns": ["Email"], "unique": true, "error": "ERR_CONTACT_EMAIL_TAKEN" },
        { "name": "ContactCompany", "columns": ["CompanyId"] }
      ]
    },
    {
      "name": "Note",
      "columns": [
        { "name": "ContactId", "type": "integer", "references": "Contact" },
        { "name": "Body", "type": "text" }
      ],
      "lot_size": 1
    }
  ]
}"#;

/// Error code declared by the `ContactEmail` constraint.
pub const CONTACT_EMAIL_TAKEN: &str = "ERR_CONTACT_EMAIL_TAKEN";

/// Company, Contact and Note tables.
///
/// # Panics
///
/// Panics if the embedded JSON is invalid.
pub fn crm_schema() -> Schema {
    serde_json::from_str(CRM_SCHEMA_JSON).expect("Invalid CRM schema fixture")
}

/// Values of a Company row.
pub fn company(name: &str, city: Option<&str>) -> Vec<Value> {
    vec![Value::from(name), city.map_or(Value::Null, Value::from)]
}

/// Values of a Contact row; `company` is a client id or a server id
/// depending on which side the row is handed to.
pub fn contact(email: &str, name: &str, company: Option<u64>) -> Vec<Value> {
    vec![
        Value::from(email),
        Value::from(name),
        company.map_or(Value::Null, id_value),
    ]
}

/// Values of a Note row.
pub fn note(contact: u64, body: &str) -> Vec<Value> {
    vec![id_value(contact), Value::from(body)]
}

#[allow(clippy::cast_possible_wrap)]
fn id_value(id: ClientId) -> Value {
    Value::Integer(id as i64)
}

static TRACING: Once = Once::new();

/// Installs a `tracing` subscriber writing to the test output, filtered by
/// `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
