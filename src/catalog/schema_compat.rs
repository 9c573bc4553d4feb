//! Schema compatibility for incremental loads.
//!
//! Rule: a file extending a table must carry the same columns, with the same
//! names, in the same order. Types must match, with two exceptions:
//!
//! - a table column typed `text` accepts any file type; the file's column is
//!   stored as text;
//! - a file column with no observed values in the inference sample takes the
//!   table's type (its cells are parsed against that type at encode time).
//!
//! Anything else is a conflict naming the offending column.

use thiserror::Error;

use crate::{
    error::LoaderError,
    schema::{ColumnDef, ColumnSchema, ColumnType},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaCompatError {
    #[error("is missing from the file (table position {position})")]
    MissingColumn { column: String, position: usize },

    #[error("is not in the table (file position {position})")]
    ExtraColumn { column: String, position: usize },

    #[error("replaces table column '{table_column}' at position {position}")]
    RenamedColumn {
        column: String,
        table_column: String,
        position: usize,
    },

    #[error("changed type from {table_type} to {file_type}")]
    TypeMismatch {
        column: String,
        table_type: ColumnType,
        file_type: ColumnType,
    },
}

impl SchemaCompatError {
    pub fn column(&self) -> &str {
        match self {
            SchemaCompatError::MissingColumn { column, .. }
            | SchemaCompatError::ExtraColumn { column, .. }
            | SchemaCompatError::RenamedColumn { column, .. }
            | SchemaCompatError::TypeMismatch { column, .. } => column,
        }
    }

    pub fn into_conflict(self, table: &str) -> LoaderError {
        LoaderError::CatalogConflict {
            table: table.to_string(),
            column: self.column().to_string(),
            reason: self.to_string(),
        }
    }
}

/// Returns the schema the file must be encoded with to extend `table`.
///
/// `observed` holds the number of non-null sampled values per file column;
/// pass `None` when the file schema is already final (for example after
/// encoding).
pub fn align_to_table(
    table: &ColumnSchema,
    file: &ColumnSchema,
    observed: Option<&[usize]>,
) -> Result<ColumnSchema, SchemaCompatError> {
    let mut aligned = Vec::with_capacity(file.len());
    for (position, (table_col, file_col)) in table.columns.iter().zip(&file.columns).enumerate() {
        if table_col.name != file_col.name {
            return Err(SchemaCompatError::RenamedColumn {
                column: file_col.name.clone(),
                table_column: table_col.name.clone(),
                position: position + 1,
            });
        }
        let unobserved = observed
            .and_then(|counts| counts.get(position))
            .is_some_and(|count| *count == 0);
        let data_type = if table_col.data_type == file_col.data_type
            || table_col.data_type == ColumnType::Text
            || unobserved
        {
            table_col.data_type
        } else {
            return Err(SchemaCompatError::TypeMismatch {
                column: file_col.name.clone(),
                table_type: table_col.data_type,
                file_type: file_col.data_type,
            });
        };
        // A file column of the table's own type keeps its date order; an
        // adopted type brings the table's.
        let date_order = if data_type == file_col.data_type {
            file_col.date_order
        } else if data_type == ColumnType::Text {
            None
        } else {
            table_col.date_order
        };
        aligned.push(ColumnDef {
            name: file_col.name.clone(),
            data_type,
            nullable: data_type != ColumnType::Text,
            source_name: file_col.source_name.clone(),
            date_order,
        });
    }

    if let Some(missing) = table.columns.get(file.len()) {
        return Err(SchemaCompatError::MissingColumn {
            column: missing.name.clone(),
            position: file.len() + 1,
        });
    }
    if let Some(extra) = file.columns.get(table.len()) {
        return Err(SchemaCompatError::ExtraColumn {
            column: extra.name.clone(),
            position: table.len() + 1,
        });
    }
    Ok(ColumnSchema::new(aligned))
}

/// True when both schemas have the same names and types in the same order.
pub fn same_shape(left: &ColumnSchema, right: &ColumnSchema) -> bool {
    left.len() == right.len()
        && left
            .columns
            .iter()
            .zip(&right.columns)
            .all(|(l, r)| l.name == r.name && l.data_type == r.data_type)
}
