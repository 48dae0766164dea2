//! Schema description shared by the hub and its clients.
//!
//! The hub sends the schema in its handshake; clients build their tables
//! from it and compare it against the previous session's schema before
//! replaying buffered mutations. Schemas can also be written as JSON,
//! which is how test fixtures declare them.

use serde::{Deserialize, Serialize};
use tidesync_codec::{CodecError, CodecResult, Fields, Value, WireDecode, WireEncode};

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 64-bit signed integer. Foreign keys are integer columns.
    Integer,
    /// UTF-8 text.
    Text,
    /// Boolean.
    Boolean,
    /// Opaque bytes.
    Bytes,
}

impl ColumnType {
    /// Wire and JSON name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Bytes => "bytes",
        }
    }

    fn parse(name: &str) -> CodecResult<Self> {
        match name {
            "integer" => Ok(ColumnType::Integer),
            "text" => Ok(ColumnType::Text),
            "boolean" => Ok(ColumnType::Boolean),
            "bytes" => Ok(ColumnType::Bytes),
            other => Err(CodecError::invalid_structure(format!(
                "unknown column type `{other}`"
            ))),
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name, also the field name in error payloads.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Whether `Null` is accepted.
    #[serde(default)]
    pub nullable: bool,
    /// Name of the referenced table for foreign-key columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

impl ColumnSchema {
    /// A required column.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            references: None,
        }
    }

    /// A required foreign key to `table`.
    pub fn reference(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            references: Some(table.into()),
            ..Self::new(name, ColumnType::Integer)
        }
    }

    /// Marks the column nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A unique or non-unique index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSchema {
    /// Constraint name, used by `getIndex`.
    pub name: String,
    /// Indexed column names.
    pub columns: Vec<String>,
    /// Whether two live rows may share a key.
    #[serde(default)]
    pub unique: bool,
    /// Error code reported on violation; `ERR_FIELD_UNIQUE` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConstraintSchema {
    /// A unique constraint.
    pub fn unique(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: true,
            error: None,
        }
    }

    /// A non-unique index.
    pub fn index(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            unique: false,
            ..Self::unique(name, columns)
        }
    }

    /// Sets the declared error code.
    pub fn with_error(mut self, code: impl Into<String>) -> Self {
        self.error = Some(code.into());
        self
    }
}

/// One table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in storage order.
    pub columns: Vec<ColumnSchema>,
    /// Secondary indices.
    #[serde(default)]
    pub constraints: Vec<ConstraintSchema>,
    /// Maximum requests per compressed lot; 0 means unbounded and 1 marks
    /// a table whose requests must keep their relative order across tables.
    #[serde(default)]
    pub lot_size: usize,
}

impl TableSchema {
    /// Creates a table without constraints and with unbounded lots.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            constraints: Vec::new(),
            lot_size: 0,
        }
    }

    /// Adds a constraint.
    pub fn with_constraint(mut self, constraint: ConstraintSchema) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Sets the lot size.
    pub fn with_lot_size(mut self, lot_size: usize) -> Self {
        self.lot_size = lot_size;
        self
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Foreign-key columns as `(column index, referenced table)`, in
    /// declaration order. The position in this list is the identity's
    /// foreign slot.
    pub fn foreign_keys(&self) -> Vec<(usize, &str)> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.references.as_deref().map(|t| (i, t)))
            .collect()
    }

    /// Whether the table's requests are strongly ordered.
    pub fn is_ordered(&self) -> bool {
        self.lot_size == 1
    }

    /// Structural equality ignoring constraints and lot sizes, which only
    /// affect local bookkeeping.
    pub fn compatible_with(&self, other: &TableSchema) -> bool {
        self.name == other.name && self.columns == other.columns
    }
}

/// The whole schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Tables in declaration order.
    pub tables: Vec<TableSchema>,
}

impl Schema {
    /// Creates a schema.
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    /// Looks up a table.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Position of a table.
    pub fn table_index(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == name)
    }

    /// Whether buffered mutations of a session built on `self` can be
    /// replayed onto a session built on `other`.
    pub fn compatible_with(&self, other: &Schema) -> bool {
        self.tables.len() == other.tables.len()
            && self
                .tables
                .iter()
                .zip(&other.tables)
                .all(|(a, b)| a.compatible_with(b))
    }

    /// Checks that every foreign key names a declared table and every
    /// constraint names declared columns.
    pub fn validate(&self) -> Result<(), String> {
        for table in &self.tables {
            for (_, target) in table.foreign_keys() {
                if self.table(target).is_none() {
                    return Err(format!(
                        "table `{}` references unknown table `{target}`",
                        table.name
                    ));
                }
            }
            for constraint in &table.constraints {
                if let Some(missing) = constraint
                    .columns
                    .iter()
                    .find(|c| table.column_index(c).is_none())
                {
                    return Err(format!(
                        "constraint `{}` on `{}` names unknown column `{missing}`",
                        constraint.name, table.name
                    ));
                }
            }
        }
        Ok(())
    }
}

impl WireEncode for Schema {
    fn to_value(&self) -> Value {
        let tables = self
            .tables
            .iter()
            .map(|t| {
                let columns = t
                    .columns
                    .iter()
                    .map(|c| {
                        Value::text_map([
                            ("name", Value::from(c.name.as_str())),
                            ("type", Value::from(c.ty.as_str())),
                            ("nullable", Value::Bool(c.nullable)),
                            ("references", Value::from(c.references.clone())),
                        ])
                    })
                    .collect();
                let constraints = t
                    .constraints
                    .iter()
                    .map(|k| {
                        Value::text_map([
                            ("name", Value::from(k.name.as_str())),
                            (
                                "columns",
                                Value::Array(k.columns.iter().map(|c| Value::from(c.as_str())).collect()),
                            ),
                            ("unique", Value::Bool(k.unique)),
                            ("error", Value::from(k.error.clone())),
                        ])
                    })
                    .collect();
                Value::text_map([
                    ("name", Value::from(t.name.as_str())),
                    ("columns", Value::Array(columns)),
                    ("constraints", Value::Array(constraints)),
                    ("lotSize", Value::Integer(t.lot_size as i64)),
                ])
            })
            .collect();
        Value::text_map([("tables", Value::Array(tables))])
    }
}

impl WireDecode for Schema {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        let mut tables = Vec::new();
        for table in fields.array("tables")? {
            let t = Fields::new(table)?;
            let mut columns = Vec::new();
            for column in t.array("columns")? {
                let c = Fields::new(column)?;
                columns.push(ColumnSchema {
                    name: c.text("name")?.to_string(),
                    ty: ColumnType::parse(c.text("type")?)?,
                    nullable: c.boolean("nullable")?,
                    references: c.opt_text("references")?.map(str::to_string),
                });
            }
            let mut constraints = Vec::new();
            for constraint in t.array("constraints")? {
                let k = Fields::new(constraint)?;
                constraints.push(ConstraintSchema {
                    name: k.text("name")?.to_string(),
                    columns: k
                        .array("columns")?
                        .iter()
                        .map(|c| {
                            c.as_text()
                                .map(str::to_string)
                                .ok_or_else(|| CodecError::wrong_type("columns", "text"))
                        })
                        .collect::<CodecResult<_>>()?,
                    unique: k.boolean("unique")?,
                    error: k.opt_text("error")?.map(str::to_string),
                });
            }
            tables.push(TableSchema {
                name: t.text("name")?.to_string(),
                columns,
                constraints,
                lot_size: usize::try_from(t.unsigned("lotSize")?)
                    .map_err(|_| CodecError::wrong_type("lotSize", "size"))?,
            });
        }
        Ok(Schema { tables })
    }
}
