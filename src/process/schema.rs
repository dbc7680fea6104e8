use anyhow::{bail, Result};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};

use super::Chunk;

/// Column types this loader declares. Every column is text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    Nullable,
}

/// One column of the destination table, serialized the way the warehouse
/// expects it inside a load job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub mode: FieldMode,
}

/// The destination schema for a run: derived once from the header row and
/// checked against every chunk rather than re-derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    /// Declare every column as a nullable STRING.
    ///
    /// Fails on an empty column list, on names that sanitized down to
    /// nothing, and on names that collide once case is ignored (the
    /// warehouse treats column names case-insensitively).
    pub fn all_strings<S: AsRef<str>>(columns: &[S]) -> Result<Self> {
        if columns.is_empty() {
            bail!("no columns to parse from file");
        }

        let mut seen: HashMap<String, usize> = HashMap::with_capacity(columns.len());
        let mut fields = Vec::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            let name = name.as_ref();
            if name.is_empty() {
                bail!("column {} has an empty name after sanitizing", idx);
            }
            if let Some(first) = seen.insert(name.to_lowercase(), idx) {
                bail!(
                    "columns {} and {} both map to {:?} after sanitizing",
                    first,
                    idx,
                    name
                );
            }
            fields.push(SchemaField {
                name: name.to_string(),
                field_type: FieldType::String,
                mode: FieldMode::Nullable,
            });
        }
        Ok(Self { fields })
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Every row in `chunk` must have exactly one value per schema column.
    pub fn ensure_matches(&self, chunk: &Chunk) -> Result<()> {
        if let Some((offset, row)) = chunk
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.width())
        {
            bail!(
                "chunk {} row {} has {} values but the table schema has {} columns",
                chunk.index,
                offset,
                row.len(),
                self.width()
            );
        }
        Ok(())
    }

    /// Arrow view of the schema: one nullable Utf8 field per column.
    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .names()
            .map(|n| Field::new(n, DataType::Utf8, true))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_column_is_a_nullable_string() -> Result<()> {
        let schema = TableSchema::all_strings(&["Revenue$", "Date", "Count"])?;
        assert_eq!(schema.width(), 3);
        assert!(schema
            .fields
            .iter()
            .all(|f| f.field_type == FieldType::String && f.mode == FieldMode::Nullable));
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["Revenue$", "Date", "Count"]);

        let arrow = schema.to_arrow();
        assert!(arrow.fields().iter().all(|f| f.data_type() == &DataType::Utf8));
        Ok(())
    }

    #[test]
    fn serializes_as_warehouse_schema_json() -> Result<()> {
        let schema = TableSchema::all_strings(&["id", "amount"])?;
        assert_eq!(
            serde_json::to_value(&schema)?,
            json!({
                "fields": [
                    {"name": "id", "type": "STRING", "mode": "NULLABLE"},
                    {"name": "amount", "type": "STRING", "mode": "NULLABLE"}
                ]
            })
        );
        Ok(())
    }

    #[test]
    fn rejects_empty_and_colliding_names() {
        let none: [&str; 0] = [];
        assert!(TableSchema::all_strings(&none).is_err());

        let err = TableSchema::all_strings(&["ok", ""]).unwrap_err();
        assert!(err.to_string().contains("empty name"));

        let err = TableSchema::all_strings(&["Amount", "amount"]).unwrap_err();
        assert!(err.to_string().contains("columns 0 and 1"), "{err}");
    }

    #[test]
    fn chunk_width_is_asserted() -> Result<()> {
        let schema = TableSchema::all_strings(&["a", "b"])?;
        let good = Chunk {
            index: 0,
            rows: vec![vec![Some("1".into()), None]],
        };
        schema.ensure_matches(&good)?;

        let bad = Chunk {
            index: 4,
            rows: vec![vec![Some("1".into()), None], vec![Some("1".into())]],
        };
        let err = schema.ensure_matches(&bad).unwrap_err();
        assert!(err.to_string().contains("chunk 4 row 1 has 1 values"), "{err}");
        Ok(())
    }
}
