//! Property-based test generators using proptest.
//!
//! Strategies produce rows of the [`crm_schema`](crate::crm_schema)
//! tables so generated data passes the default field adapter.

use proptest::prelude::*;
use tidesync_codec::Value;
use tidesync_protocol::{Record, ServerId, ServerRecord, Tick};

/// Strategy for short non-empty names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{1,11}").expect("Invalid regex")
}

/// Strategy for ticks the hub could assign.
pub fn tick_strategy() -> impl Strategy<Value = Tick> {
    1u64..64
}

/// Strategy for Company values.
pub fn company_values_strategy() -> impl Strategy<Value = Vec<Value>> {
    (name_strategy(), prop::option::of(name_strategy())).prop_map(|(name, city)| {
        vec![Value::from(name), city.map_or(Value::Null, Value::from)]
    })
}

/// Strategy for Company records as the hub pushes them, with server ids
/// in `ids`.
pub fn company_record_strategy(
    ids: std::ops::Range<ServerId>,
) -> impl Strategy<Value = ServerRecord> {
    (ids, company_values_strategy(), tick_strategy(), any::<bool>()).prop_map(
        |(id, values, tick, deleted)| {
            let mut record = Record::new(Some(id), values, tick);
            record.deleted = deleted;
            ServerRecord::new("Company", record)
        },
    )
}

/// Strategy for a sequence of pushed Company records, duplicates and
/// out-of-order ticks included.
pub fn company_push_strategy(max: usize) -> impl Strategy<Value = Vec<ServerRecord>> {
    prop::collection::vec(company_record_strategy(1..8), 1..max)
}
