//! Table schemas, column ids, and client-input validation.

use serde::{Deserialize, Serialize};

use crate::config::MasterConfig;
use crate::error::{MasterError, MasterErrorCode, MasterResult};

pub type ColumnId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UnixtimeMicros,
    Float,
    Double,
    String,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingType {
    Auto,
    Plain,
    Prefix,
    RunLength,
    BitShuffle,
    Dictionary,
}

/// Whether `encoding` is valid for a column of type `ty`.
pub fn encoding_supported(ty: DataType, encoding: EncodingType) -> bool {
    use DataType::*;
    use EncodingType::*;
    match encoding {
        Auto | Plain => true,
        Prefix | Dictionary => matches!(ty, String | Binary),
        RunLength => matches!(ty, Bool | Int8 | Int16 | Int32 | Int64 | UnixtimeMicros),
        BitShuffle => matches!(
            ty,
            Int8 | Int16 | Int32 | Int64 | UnixtimeMicros | Float | Double
        ),
    }
}

/// One column of a table schema.
///
/// Defaults are carried as loosely-typed JSON values; the data plane is
/// responsible for coercing them into the column's physical representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    pub is_key: bool,
    pub is_nullable: bool,
    pub encoding: EncodingType,
    pub read_default: Option<serde_json::Value>,
    pub write_default: Option<serde_json::Value>,
}

impl ColumnSchema {
    pub fn new_key(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_key: true,
            is_nullable: false,
            encoding: EncodingType::Auto,
            read_default: None,
            write_default: None,
        }
    }

    pub fn new(name: impl Into<String>, data_type: DataType, is_nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_key: false,
            is_nullable,
            encoding: EncodingType::Auto,
            read_default: None,
            write_default: None,
        }
    }
}

/// A full table schema with assigned column ids.
///
/// Key columns come first; `column_ids` is parallel to `columns` and is empty
/// only in client-supplied schemas that have not been through
/// [`SchemaBuilder::from_client_schema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnSchema>,
    pub column_ids: Vec<ColumnId>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self {
            columns,
            column_ids: Vec::new(),
        }
    }

    pub fn num_key_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_key).count()
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column_ids(&self) -> bool {
        !self.column_ids.is_empty()
    }
}

/// Reject identifiers that are empty, too long, not UTF-8 clean, or contain
/// a NUL rune.
pub fn validate_identifier(kind: &str, id: &str, cfg: &MasterConfig) -> MasterResult<()> {
    if id.is_empty() {
        return Err(MasterError::invalid_schema(format!("{kind} name is empty")));
    }
    if id.len() > cfg.max_identifier_length {
        return Err(MasterError::invalid_schema(format!(
            "{kind} name '{id}' exceeds the maximum length of {} bytes",
            cfg.max_identifier_length
        )));
    }
    if id.chars().any(|c| c == '\0') {
        return Err(MasterError::invalid_schema(format!(
            "{kind} name contains a NUL character"
        )));
    }
    Ok(())
}

/// Validate a client-supplied schema for table creation.
///
/// Checks column count, identifier shape, key-column restrictions, encoding
/// compatibility, and read/write default coherence. Promotes a read-only
/// default to a read+write pair in place.
pub fn validate_client_schema(schema: &mut Schema, cfg: &MasterConfig) -> MasterResult<()> {
    if schema.columns.is_empty() {
        return Err(MasterError::invalid_schema("schema has no columns"));
    }
    if schema.columns.len() > cfg.max_num_columns {
        return Err(MasterError::invalid_schema(format!(
            "schema has {} columns, maximum is {}",
            schema.columns.len(),
            cfg.max_num_columns
        )));
    }
    if schema.has_column_ids() {
        return Err(MasterError::invalid_schema(
            "client schema must not include column ids",
        ));
    }
    if schema.num_key_columns() == 0 {
        return Err(MasterError::invalid_schema(
            "schema must have at least one key column",
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for column in &mut schema.columns {
        validate_identifier("column", &column.name, cfg)?;
        if !seen.insert(column.name.clone()) {
            return Err(MasterError::invalid_schema(format!(
                "duplicate column name '{}'",
                column.name
            )));
        }
        if column.is_key {
            if matches!(
                column.data_type,
                DataType::Bool | DataType::Float | DataType::Double
            ) {
                return Err(MasterError::invalid_schema(format!(
                    "key column '{}' may not have type {:?}",
                    column.name, column.data_type
                )));
            }
            if column.is_nullable {
                return Err(MasterError::invalid_schema(format!(
                    "key column '{}' may not be nullable",
                    column.name
                )));
            }
        }
        if !encoding_supported(column.data_type, column.encoding) {
            return Err(MasterError::invalid_schema(format!(
                "encoding {:?} is not supported for column '{}' of type {:?}",
                column.encoding, column.name, column.data_type
            )));
        }
        validate_column_defaults(column)?;
    }
    Ok(())
}

fn validate_column_defaults(column: &mut ColumnSchema) -> MasterResult<()> {
    match (&column.read_default, &column.write_default) {
        (Some(read), Some(write)) if read != write => Err(MasterError::invalid_schema(format!(
            "column '{}' has mismatched read and write defaults",
            column.name
        ))),
        (None, Some(_)) => Err(MasterError::invalid_schema(format!(
            "column '{}' has a write default without a read default",
            column.name
        ))),
        (Some(read), None) => {
            column.write_default = Some(read.clone());
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Builds schemas with server-assigned column ids, used by table creation and
/// schema alteration.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    column_ids: Vec<ColumnId>,
    next_column_id: ColumnId,
}

impl SchemaBuilder {
    /// Assign fresh ids (starting at 0) to every column of a validated
    /// client schema.
    pub fn from_client_schema(schema: &Schema) -> Self {
        let column_ids = (0..schema.columns.len() as ColumnId).collect::<Vec<_>>();
        Self {
            columns: schema.columns.clone(),
            next_column_id: schema.columns.len() as ColumnId,
            column_ids,
        }
    }

    /// Start from a previously built schema, continuing its id sequence.
    pub fn from_schema(schema: &Schema, next_column_id: ColumnId) -> Self {
        debug_assert_eq!(schema.columns.len(), schema.column_ids.len());
        Self {
            columns: schema.columns.clone(),
            column_ids: schema.column_ids.clone(),
            next_column_id,
        }
    }

    pub fn next_column_id(&self) -> ColumnId {
        self.next_column_id
    }

    pub fn add_column(&mut self, column: ColumnSchema) -> MasterResult<()> {
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(MasterError::invalid_schema(format!(
                "column '{}' already exists",
                column.name
            )));
        }
        if column.is_key {
            return Err(MasterError::invalid_schema(
                "key columns may not be added to an existing table",
            ));
        }
        if !column.is_nullable && column.read_default.is_none() {
            return Err(MasterError::invalid_schema(format!(
                "column '{}' is NOT NULL and must have a default",
                column.name
            )));
        }
        self.columns.push(column);
        self.column_ids.push(self.next_column_id);
        self.next_column_id += 1;
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> MasterResult<()> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                MasterError::invalid_schema(format!("column '{name}' not found"))
            })?;
        if self.columns[idx].is_key {
            return Err(MasterError::invalid_schema(format!(
                "key column '{name}' may not be dropped"
            )));
        }
        self.columns.remove(idx);
        self.column_ids.remove(idx);
        Ok(())
    }

    pub fn rename_column(&mut self, old_name: &str, new_name: &str) -> MasterResult<()> {
        if self.columns.iter().any(|c| c.name == new_name) {
            return Err(MasterError::invalid_schema(format!(
                "column '{new_name}' already exists"
            )));
        }
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.name == old_name)
            .ok_or_else(|| {
                MasterError::invalid_schema(format!("column '{old_name}' not found"))
            })?;
        column.name = new_name.to_string();
        Ok(())
    }

    pub fn build(self) -> Schema {
        Schema {
            columns: self.columns,
            column_ids: self.column_ids,
        }
    }
}

/// Enforce the replication-factor rules for table creation.
pub fn validate_replication_factor(num_replicas: u32, cfg: &MasterConfig) -> MasterResult<()> {
    if num_replicas == 0 || num_replicas > cfg.max_num_replicas {
        return Err(MasterError::new(
            MasterErrorCode::IllegalReplicationFactor,
            format!(
                "illegal replication factor {num_replicas} (must be in [1, {}])",
                cfg.max_num_replicas
            ),
        ));
    }
    if num_replicas % 2 == 0 && !cfg.allow_unsafe_replication_factor {
        return Err(MasterError::new(
            MasterErrorCode::EvenReplicationFactor,
            format!("illegal replication factor {num_replicas}: even replication factors are not supported"),
        ));
    }
    Ok(())
}
