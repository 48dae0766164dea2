//! Lot compression of transaction requests.
//!
//! A transaction is sent as a list of [`CompressedRequest`]s. Each one
//! carries consecutive requests of one table and one action, stored column
//! by column. Lots are numbered in request order: the number moves on at
//! every change of table or action, and a table whose lot size is 1 gets a
//! lot of its own for each request. A lot is split into sub-lots of at most
//! the table's lot size.
//!
//! [`uncompress`] expands the lots back into single requests, so
//! `uncompress(compress(r)) == r` for any request list.

use crate::change::{Change, RequestMessage};
use crate::schema::Schema;
use crate::types::{
    client_id_from_wire, client_id_to_wire, server_id_from_wire, tick_to_wire, Action, Identity,
    Record, Tick, UNKNOWN_SERVER_ID,
};
use tidesync_codec::{CodecError, CodecResult, Fields, Value, WireDecode, WireEncode};

/// Per-table compression parameters.
pub trait LotPolicy {
    /// Maximum requests per sub-lot; 0 is unbounded, 1 forces ordering.
    fn lot_size(&self, table: &str) -> usize;

    /// Ordering position of the table inside a lot.
    fn table_index(&self, table: &str) -> usize;
}

impl LotPolicy for Schema {
    fn lot_size(&self, table: &str) -> usize {
        self.table(table).map_or(0, |t| t.lot_size)
    }

    fn table_index(&self, table: &str) -> usize {
        self.table_index(table).unwrap_or(usize::MAX)
    }
}

/// Records of one lot stored column by column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnBlock {
    /// Server ids, `-1` when unknown.
    pub ids: Vec<i64>,
    /// One vector per column, each holding that column for every record.
    pub columns: Vec<Vec<Value>>,
    /// Record ticks.
    pub ticks: Vec<Tick>,
    /// Soft-delete flags.
    pub deleted: Vec<bool>,
}

impl ColumnBlock {
    fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> CodecResult<Self> {
        let mut block = ColumnBlock::default();
        for record in records {
            if block.ids.is_empty() {
                block.columns = vec![Vec::new(); record.values.len()];
            } else if record.values.len() != block.columns.len() {
                return Err(CodecError::invalid_structure(
                    "records of one lot differ in arity",
                ));
            }
            block.ids.push(record.id.unwrap_or(UNKNOWN_SERVER_ID));
            for (column, value) in block.columns.iter_mut().zip(&record.values) {
                column.push(value.clone());
            }
            block.ticks.push(record.tick);
            block.deleted.push(record.deleted);
        }
        Ok(block)
    }

    /// Number of records in the block.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true for an empty block.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn record(&self, i: usize) -> Record {
        Record {
            id: server_id_from_wire(self.ids[i]),
            values: self.columns.iter().map(|c| c[i].clone()).collect(),
            tick: self.ticks[i],
            deleted: self.deleted[i],
        }
    }

    fn check(&self, expected: usize) -> CodecResult<()> {
        let consistent = self.ids.len() == expected
            && self.ticks.len() == expected
            && self.deleted.len() == expected
            && self.columns.iter().all(|c| c.len() == expected);
        if consistent {
            Ok(())
        } else {
            Err(CodecError::invalid_structure("ragged record block"))
        }
    }
}

impl WireEncode for ColumnBlock {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("ids", Value::Array(self.ids.iter().map(|&id| Value::Integer(id)).collect())),
            (
                "columns",
                Value::Array(self.columns.iter().map(|c| Value::Array(c.clone())).collect()),
            ),
            (
                "ticks",
                Value::Array(self.ticks.iter().map(|&t| Value::Integer(tick_to_wire(t))).collect()),
            ),
            (
                "deleted",
                Value::Array(self.deleted.iter().map(|&d| Value::Bool(d)).collect()),
            ),
        ])
    }
}

impl WireDecode for ColumnBlock {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            ids: integers(fields.array("ids")?, "ids")?,
            columns: fields
                .array("columns")?
                .iter()
                .map(|c| {
                    c.as_array()
                        .map(<[Value]>::to_vec)
                        .ok_or_else(|| CodecError::wrong_type("columns", "array"))
                })
                .collect::<CodecResult<_>>()?,
            ticks: integers(fields.array("ticks")?, "ticks")?
                .into_iter()
                .map(|t| u64::try_from(t).map_err(|_| CodecError::wrong_type("ticks", "tick")))
                .collect::<CodecResult<_>>()?,
            deleted: fields
                .array("deleted")?
                .iter()
                .map(|d| d.as_bool().ok_or_else(|| CodecError::wrong_type("deleted", "bool")))
                .collect::<CodecResult<_>>()?,
        })
    }
}

/// Identities of one lot stored column by column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityBlock {
    /// Row indexes.
    pub row_indexes: Vec<usize>,
    /// Client keys.
    pub client_ids: Vec<u64>,
    /// One vector per foreign-key slot.
    pub foreign: Vec<Vec<Option<u64>>>,
}

impl IdentityBlock {
    fn from_identities<'a>(identities: impl IntoIterator<Item = &'a Identity>) -> CodecResult<Self> {
        let mut block = IdentityBlock::default();
        for identity in identities {
            if block.client_ids.is_empty() {
                block.foreign = vec![Vec::new(); identity.foreign.len()];
            } else if identity.foreign.len() != block.foreign.len() {
                return Err(CodecError::invalid_structure(
                    "identities of one lot differ in foreign slots",
                ));
            }
            block.row_indexes.push(identity.row_index);
            block.client_ids.push(identity.client_id);
            for (slot, value) in block.foreign.iter_mut().zip(&identity.foreign) {
                slot.push(*value);
            }
        }
        Ok(block)
    }

    fn identity(&self, i: usize) -> Identity {
        Identity {
            row_index: self.row_indexes[i],
            client_id: self.client_ids[i],
            foreign: self.foreign.iter().map(|slot| slot[i]).collect(),
        }
    }

    fn check(&self, expected: usize) -> CodecResult<()> {
        let consistent = self.row_indexes.len() == expected
            && self.client_ids.len() == expected
            && self.foreign.iter().all(|s| s.len() == expected);
        if consistent {
            Ok(())
        } else {
            Err(CodecError::invalid_structure("ragged identity block"))
        }
    }
}

impl WireEncode for IdentityBlock {
    #[allow(clippy::cast_possible_wrap)]
    fn to_value(&self) -> Value {
        Value::text_map([
            (
                "rowIndexes",
                Value::Array(self.row_indexes.iter().map(|&r| Value::Integer(r as i64)).collect()),
            ),
            (
                "clientKeyIds",
                Value::Array(self.client_ids.iter().map(|&c| Value::Integer(c as i64)).collect()),
            ),
            (
                "foreign",
                Value::Array(
                    self.foreign
                        .iter()
                        .map(|slot| Value::Array(slot.iter().map(|f| client_id_to_wire(*f)).collect()))
                        .collect(),
                ),
            ),
        ])
    }
}

impl WireDecode for IdentityBlock {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            row_indexes: integers(fields.array("rowIndexes")?, "rowIndexes")?
                .into_iter()
                .map(|r| usize::try_from(r).map_err(|_| CodecError::wrong_type("rowIndexes", "index")))
                .collect::<CodecResult<_>>()?,
            client_ids: integers(fields.array("clientKeyIds")?, "clientKeyIds")?
                .into_iter()
                .map(|c| u64::try_from(c).map_err(|_| CodecError::wrong_type("clientKeyIds", "client id")))
                .collect::<CodecResult<_>>()?,
            foreign: fields
                .array("foreign")?
                .iter()
                .map(|slot| {
                    slot.as_array()
                        .ok_or_else(|| CodecError::wrong_type("foreign", "array"))?
                        .iter()
                        .map(|v| client_id_from_wire("foreign", v))
                        .collect::<CodecResult<Vec<_>>>()
                })
                .collect::<CodecResult<_>>()?,
        })
    }
}

fn integers(values: &[Value], field: &str) -> CodecResult<Vec<i64>> {
    values
        .iter()
        .map(|v| v.as_integer().ok_or_else(|| CodecError::wrong_type(field, "integer")))
        .collect()
}

/// Requests of one table and one action inside one sub-lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedRequest {
    /// Target table.
    pub table: String,
    /// Shared action.
    pub action: Action,
    /// Lot number.
    pub lot: u32,
    /// Sub-lot number inside the lot for this table.
    pub sub_lot: u32,
    /// Request ticks.
    pub ticks: Vec<Tick>,
    /// Records as the hub should store them (`New` for updates).
    pub records: ColumnBlock,
    /// Previous records, updates only.
    pub previous: Option<ColumnBlock>,
    /// Current identities.
    pub identities: IdentityBlock,
    /// Previous identities, updates only.
    pub previous_identities: Option<IdentityBlock>,
}

impl CompressedRequest {
    /// Number of requests packed in this lot.
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// Returns true when the lot holds no request.
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Expands the lot back into single requests.
    pub fn expand(&self) -> CodecResult<Vec<RequestMessage>> {
        let n = self.len();
        self.records.check(n)?;
        self.identities.check(n)?;
        let changes: Vec<Change> = match self.action {
            Action::Create => (0..n)
                .map(|i| Change::Create {
                    record: self.records.record(i),
                    identity: self.identities.identity(i),
                })
                .collect(),
            Action::Delete => (0..n)
                .map(|i| Change::Delete {
                    record: self.records.record(i),
                    identity: self.identities.identity(i),
                })
                .collect(),
            Action::Update => {
                let (Some(old), Some(old_identities)) = (&self.previous, &self.previous_identities)
                else {
                    return Err(CodecError::invalid_structure("update lot without previous state"));
                };
                old.check(n)?;
                old_identities.check(n)?;
                (0..n)
                    .map(|i| Change::Update {
                        old: old.record(i),
                        new: self.records.record(i),
                        old_identity: old_identities.identity(i),
                        new_identity: self.identities.identity(i),
                    })
                    .collect()
            }
        };
        Ok(changes
            .into_iter()
            .zip(&self.ticks)
            .map(|(change, &tick)| RequestMessage::new(self.table.clone(), change, tick))
            .collect())
    }

    fn sort_key(&self, policy: &impl LotPolicy) -> (u32, usize, u32) {
        (self.lot, policy.table_index(&self.table), self.sub_lot)
    }
}

impl WireEncode for CompressedRequest {
    fn to_value(&self) -> Value {
        let mut pairs = vec![
            ("table", Value::from(self.table.as_str())),
            ("action", Value::from(self.action.as_str())),
            ("lot", Value::Integer(i64::from(self.lot))),
            ("subLot", Value::Integer(i64::from(self.sub_lot))),
            (
                "ticks",
                Value::Array(self.ticks.iter().map(|&t| Value::Integer(tick_to_wire(t))).collect()),
            ),
            ("records", self.records.to_value()),
            ("identities", self.identities.to_value()),
        ];
        if let Some(previous) = &self.previous {
            pairs.push(("previous", previous.to_value()));
        }
        if let Some(previous) = &self.previous_identities {
            pairs.push(("previousIdentities", previous.to_value()));
        }
        Value::text_map(pairs)
    }
}

impl WireDecode for CompressedRequest {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        let small = |name: &str| -> CodecResult<u32> {
            u32::try_from(fields.unsigned(name)?).map_err(|_| CodecError::wrong_type(name, "u32"))
        };
        Ok(Self {
            table: fields.text("table")?.to_string(),
            action: fields.text("action")?.parse()?,
            lot: small("lot")?,
            sub_lot: small("subLot")?,
            ticks: integers(fields.array("ticks")?, "ticks")?
                .into_iter()
                .map(|t| u64::try_from(t).map_err(|_| CodecError::wrong_type("ticks", "tick")))
                .collect::<CodecResult<_>>()?,
            records: ColumnBlock::from_value(fields.require("records")?)?,
            previous: fields
                .get("previous")
                .map(ColumnBlock::from_value)
                .transpose()?,
            identities: IdentityBlock::from_value(fields.require("identities")?)?,
            previous_identities: fields
                .get("previousIdentities")
                .map(IdentityBlock::from_value)
                .transpose()?,
        })
    }
}

/// Packs requests into lots.
///
/// Fails only when requests of one table disagree on their arity.
pub fn compress(
    requests: &[RequestMessage],
    policy: &impl LotPolicy,
) -> CodecResult<Vec<CompressedRequest>> {
    let tagged = lot_order(requests, policy);

    let mut out = Vec::new();
    for run in tagged.chunk_by(|a, b| a.0 == b.0) {
        let (lot, first) = run[0];
        let size = match policy.lot_size(&first.table) {
            0 => run.len(),
            n => n,
        };
        for (sub_lot, chunk) in run.chunks(size).enumerate() {
            let chunk: Vec<&RequestMessage> = chunk.iter().map(|(_, r)| *r).collect();
            out.push(pack(lot, sub_lot as u32, &chunk)?);
        }
    }
    Ok(out)
}

/// Requests tagged with their lot number, in request order.
fn lot_order<'a>(
    requests: &'a [RequestMessage],
    policy: &impl LotPolicy,
) -> Vec<(u32, &'a RequestMessage)> {
    let mut lot = 0u32;
    let mut previous: Option<&RequestMessage> = None;
    requests
        .iter()
        .map(|request| {
            if let Some(before) = previous {
                let boundary = before.table != request.table
                    || before.action() != request.action()
                    || policy.lot_size(&request.table) == 1;
                if boundary {
                    lot += 1;
                }
            }
            previous = Some(request);
            (lot, request)
        })
        .collect()
}

fn pack(lot: u32, sub_lot: u32, requests: &[&RequestMessage]) -> CodecResult<CompressedRequest> {
    let first = requests[0];
    let action = first.action();
    let (previous, previous_identities) = if action == Action::Update {
        let olds = requests.iter().filter_map(|r| match &r.change {
            Change::Update { old, .. } => Some(old),
            _ => None,
        });
        let old_identities = requests.iter().filter_map(|r| match &r.change {
            Change::Update { old_identity, .. } => Some(old_identity),
            _ => None,
        });
        (
            Some(ColumnBlock::from_records(olds)?),
            Some(IdentityBlock::from_identities(old_identities)?),
        )
    } else {
        (None, None)
    };
    Ok(CompressedRequest {
        table: first.table.clone(),
        action,
        lot,
        sub_lot,
        ticks: requests.iter().map(|r| r.tick).collect(),
        records: ColumnBlock::from_records(requests.iter().map(|r| r.change.record()))?,
        previous,
        identities: IdentityBlock::from_identities(requests.iter().map(|r| r.change.identity()))?,
        previous_identities,
    })
}

/// Expands lots into single requests in the order they were compressed.
pub fn uncompress(
    lots: &[CompressedRequest],
    policy: &impl LotPolicy,
) -> CodecResult<Vec<RequestMessage>> {
    let mut sorted: Vec<&CompressedRequest> = lots.iter().collect();
    sorted.sort_by_key(|lot| lot.sort_key(policy));
    let mut out = Vec::with_capacity(lots.iter().map(CompressedRequest::len).sum());
    for lot in sorted {
        out.extend(lot.expand()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType, TableSchema};
    use proptest::prelude::*;

    fn schema() -> Schema {
        Schema::new(vec![
            TableSchema::new("Company", vec![ColumnSchema::new("Name", ColumnType::Text)]),
            TableSchema::new(
                "Contact",
                vec![
                    ColumnSchema::new("Name", ColumnType::Text),
                    ColumnSchema::reference("CompanyId", "Company").nullable(),
                ],
            )
            .with_lot_size(2),
            TableSchema::new("Ledger", vec![ColumnSchema::new("Entry", ColumnType::Text)])
                .with_lot_size(1),
        ])
    }

    fn create(table: &str, client_id: u64) -> RequestMessage {
        let (values, foreign) = if table == "Contact" {
            (vec![Value::from("c"), Value::Null], vec![Some(1)])
        } else {
            (vec![Value::from("x")], vec![])
        };
        RequestMessage::new(
            table,
            Change::Create {
                record: Record::new(None, values, 0),
                identity: Identity::new(client_id as usize, client_id, foreign),
            },
            0,
        )
    }

    fn update(table: &str, client_id: u64, tick: Tick) -> RequestMessage {
        let record = Record::new(Some(client_id as i64 + 100), vec![Value::from("old")], tick);
        let identity = Identity::new(0, client_id, vec![]);
        RequestMessage::new(
            table,
            Change::Update {
                new: Record {
                    values: vec![Value::from("new")],
                    ..record.clone()
                },
                old: record,
                old_identity: identity.clone(),
                new_identity: identity,
            },
            tick,
        )
    }

    #[test]
    fn same_table_same_action_share_a_lot() {
        let requests = vec![create("Company", 1), create("Company", 2), create("Company", 3)];
        let lots = compress(&requests, &schema()).unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].len(), 3);
        assert_eq!(lots[0].records.columns.len(), 1);
        assert_eq!(uncompress(&lots, &schema()).unwrap(), requests);
    }

    #[test]
    fn lot_size_splits_into_sub_lots() {
        let requests: Vec<_> = (1..=5).map(|i| create("Contact", i)).collect();
        let lots = compress(&requests, &schema()).unwrap();
        let shape: Vec<(u32, u32, usize)> = lots.iter().map(|l| (l.lot, l.sub_lot, l.len())).collect();
        assert_eq!(shape, vec![(0, 0, 2), (0, 1, 2), (0, 2, 1)]);
    }

    #[test]
    fn action_change_opens_a_new_lot() {
        let requests = vec![create("Company", 1), update("Company", 1, 1), create("Company", 2)];
        let lots = compress(&requests, &schema()).unwrap();
        let lots_seen: Vec<u32> = lots.iter().map(|l| l.lot).collect();
        assert_eq!(lots_seen, vec![0, 1, 2]);
        assert!(lots[1].previous.is_some());
        assert_eq!(uncompress(&lots, &schema()).unwrap(), requests);
    }

    #[test]
    fn table_change_opens_a_new_lot() {
        let requests = vec![create("Contact", 10), create("Company", 1), create("Contact", 11)];
        let lots = compress(&requests, &schema()).unwrap();
        let shape: Vec<(&str, u32)> = lots.iter().map(|l| (l.table.as_str(), l.lot)).collect();
        assert_eq!(shape, vec![("Contact", 0), ("Company", 1), ("Contact", 2)]);
        assert_eq!(uncompress(&lots, &schema()).unwrap(), requests);
    }

    #[test]
    fn lots_arriving_out_of_order_expand_in_request_order() {
        let requests = vec![create("Company", 1), create("Contact", 10), create("Contact", 11)];
        let mut lots = compress(&requests, &schema()).unwrap();
        lots.reverse();
        assert_eq!(uncompress(&lots, &schema()).unwrap(), requests);
    }

    #[test]
    fn ordered_table_keeps_its_position() {
        let requests = vec![create("Contact", 10), create("Ledger", 1), create("Company", 1)];
        let expanded = uncompress(&compress(&requests, &schema()).unwrap(), &schema()).unwrap();
        assert_eq!(expanded, requests);
    }

    #[test]
    fn wire_form_decodes_back() {
        let requests = vec![update("Company", 1, 3), update("Company", 2, 4)];
        let lots = compress(&requests, &schema()).unwrap();
        let decoded = CompressedRequest::decode(&lots[0].encode()).unwrap();
        assert_eq!(decoded, lots[0]);
    }

    #[test]
    fn ragged_block_is_rejected() {
        let mut lots = compress(&[create("Company", 1)], &schema()).unwrap();
        lots[0].ticks.push(9);
        assert!(uncompress(&lots, &schema()).is_err());
    }

    fn request_strategy() -> impl Strategy<Value = RequestMessage> {
        (0usize..3, 1u64..50, any::<bool>()).prop_map(|(table, id, is_update)| {
            let table = ["Company", "Contact", "Ledger"][table];
            if is_update && table != "Contact" {
                update(table, id, id)
            } else {
                create(table, id)
            }
        })
    }

    proptest! {
        #[test]
        fn uncompress_inverts_compress(requests in prop::collection::vec(request_strategy(), 0..40)) {
            let schema = schema();
            let lots = compress(&requests, &schema).unwrap();
            prop_assert_eq!(uncompress(&lots, &schema).unwrap(), requests);
        }
    }
}
