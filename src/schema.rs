//! Database schema model
//!
//! Holds table and column names in the Spider layout (column 0 is the `*`
//! placeholder), loads `tables.json` catalogs and introspects SQLite files.

use crate::error::{Nl2SqlError, Result};
use crate::linking::tokenize::tokenize_identifier;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Time,
    Boolean,
    Others,
}

impl ColumnType {
    /// Classify a declared column type (`VARCHAR(20)`, `number`, `DATETIME`...).
    pub fn classify(declared: &str) -> Self {
        let upper = declared.trim().to_uppercase();
        if upper.is_empty() || upper == "TEXT" {
            return ColumnType::Text;
        }
        if upper == "OTHERS" {
            return ColumnType::Others;
        }
        if upper.contains("BOOL") {
            return ColumnType::Boolean;
        }
        if upper.contains("DATE") || upper.contains("TIME") || upper.contains("YEAR") {
            return ColumnType::Time;
        }
        if upper.contains("INT")
            || upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUM")
            || upper.contains("DEC")
        {
            return ColumnType::Number;
        }
        if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            return ColumnType::Text;
        }
        ColumnType::Others
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Time => "time",
            ColumnType::Boolean => "boolean",
            ColumnType::Others => "others",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaColumn {
    /// `None` only for the `*` placeholder.
    pub table_index: Option<usize>,
    /// Name as stored in the database.
    pub name: String,
    /// Human-readable name used for linking ("customer id").
    pub natural_name: String,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub db_id: String,
    pub table_names: Vec<String>,
    pub table_natural_names: Vec<String>,
    pub columns: Vec<SchemaColumn>,
    pub primary_keys: Vec<usize>,
    /// (column, referenced column)
    pub foreign_keys: Vec<(usize, usize)>,
}

impl DatabaseSchema {
    pub fn new(db_id: impl Into<String>) -> Self {
        Self {
            db_id: db_id.into(),
            table_names: Vec::new(),
            table_natural_names: Vec::new(),
            columns: vec![SchemaColumn {
                table_index: None,
                name: "*".to_string(),
                natural_name: "*".to_string(),
                column_type: ColumnType::Text,
            }],
            primary_keys: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Append a table with `(name, declared type)` columns. Returns the table index.
    pub fn add_table(&mut self, name: &str, columns: &[(&str, &str)]) -> usize {
        let table_index = self.table_names.len();
        self.table_names.push(name.to_string());
        self.table_natural_names.push(natural_name(name));
        for (column, declared) in columns {
            self.columns.push(SchemaColumn {
                table_index: Some(table_index),
                name: column.to_string(),
                natural_name: natural_name(column),
                column_type: ColumnType::classify(declared),
            });
        }
        table_index
    }

    pub fn column_index(&self, table: &str, column: &str) -> Option<usize> {
        let table_index = self.table_index(table)?;
        self.columns.iter().position(|c| {
            c.table_index == Some(table_index) && c.name.eq_ignore_ascii_case(column)
        })
    }

    pub fn table_index(&self, table: &str) -> Option<usize> {
        self.table_names
            .iter()
            .position(|t| t.eq_ignore_ascii_case(table))
    }

    pub fn set_primary_key(&mut self, table: &str, column: &str) -> Result<()> {
        let index = self.column_index(table, column).ok_or_else(|| {
            Nl2SqlError::Schema(format!("Unknown primary key column {}.{}", table, column))
        })?;
        if !self.primary_keys.contains(&index) {
            self.primary_keys.push(index);
        }
        Ok(())
    }

    pub fn add_foreign_key(
        &mut self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<()> {
        let from = self.column_index(table, column).ok_or_else(|| {
            Nl2SqlError::Schema(format!("Unknown foreign key column {}.{}", table, column))
        })?;
        let to = self.column_index(ref_table, ref_column).ok_or_else(|| {
            Nl2SqlError::Schema(format!(
                "Unknown referenced column {}.{}",
                ref_table, ref_column
            ))
        })?;
        self.foreign_keys.push((from, to));
        Ok(())
    }

    /// Columns belonging to a table, with their global indexes.
    pub fn columns_of(&self, table_index: usize) -> impl Iterator<Item = (usize, &SchemaColumn)> {
        self.columns
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.table_index == Some(table_index))
    }

    /// Word tokens of every column name, index-aligned with `columns`.
    pub fn column_tokens(&self) -> Vec<Vec<String>> {
        self.columns
            .iter()
            .map(|c| tokenize_identifier(&c.natural_name))
            .collect()
    }

    pub fn table_tokens(&self) -> Vec<Vec<String>> {
        self.table_natural_names
            .iter()
            .map(|t| tokenize_identifier(t))
            .collect()
    }

    /// Lowercased table and column names, used to recognise identifiers in SQL.
    pub fn identifier_names(&self) -> Vec<String> {
        self.table_names
            .iter()
            .chain(self.columns.iter().skip(1).map(|c| &c.name))
            .map(|n| n.to_lowercase())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_names.len() != self.table_natural_names.len() {
            return Err(Nl2SqlError::Schema(format!(
                "{}: {} table names but {} natural names",
                self.db_id,
                self.table_names.len(),
                self.table_natural_names.len()
            )));
        }
        match self.columns.first() {
            Some(c) if c.table_index.is_none() => {}
            _ => {
                return Err(Nl2SqlError::Schema(format!(
                    "{}: column 0 must be the '*' placeholder",
                    self.db_id
                )))
            }
        }
        for (index, column) in self.columns.iter().enumerate().skip(1) {
            match column.table_index {
                Some(t) if t < self.table_names.len() => {}
                Some(t) => {
                    return Err(Nl2SqlError::Schema(format!(
                        "{}: column {} references missing table {}",
                        self.db_id, index, t
                    )))
                }
                None => {
                    return Err(Nl2SqlError::Schema(format!(
                        "{}: column {} has no table",
                        self.db_id, index
                    )))
                }
            }
        }
        for pk in &self.primary_keys {
            if *pk == 0 || *pk >= self.columns.len() {
                return Err(Nl2SqlError::Schema(format!(
                    "{}: primary key {} is not a declared column",
                    self.db_id, pk
                )));
            }
        }
        for (from, to) in &self.foreign_keys {
            for index in [from, to] {
                if *index == 0 || *index >= self.columns.len() {
                    return Err(Nl2SqlError::Schema(format!(
                        "{}: foreign key column {} is not a declared column",
                        self.db_id, index
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Quote an identifier for SQLite, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn natural_name(name: &str) -> String {
    tokenize_identifier(name).join(" ")
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyRef {
    Single(usize),
    Composite(Vec<usize>),
}

#[derive(Debug, Deserialize)]
struct SpiderTableEntry {
    db_id: String,
    table_names_original: Vec<String>,
    #[serde(default)]
    table_names: Vec<String>,
    column_names_original: Vec<(i64, String)>,
    #[serde(default)]
    column_names: Vec<(i64, String)>,
    column_types: Vec<String>,
    #[serde(default)]
    primary_keys: Vec<KeyRef>,
    #[serde(default)]
    foreign_keys: Vec<(usize, usize)>,
}

impl SpiderTableEntry {
    fn into_schema(self) -> Result<DatabaseSchema> {
        if self.column_types.len() != self.column_names_original.len() {
            return Err(Nl2SqlError::Schema(format!(
                "{}: {} column types for {} columns",
                self.db_id,
                self.column_types.len(),
                self.column_names_original.len()
            )));
        }
        let table_natural_names = if self.table_names.len() == self.table_names_original.len() {
            self.table_names
        } else {
            self.table_names_original.iter().map(|t| natural_name(t)).collect()
        };
        let use_natural = self.column_names.len() == self.column_names_original.len();

        let mut columns = Vec::with_capacity(self.column_names_original.len());
        for (index, ((table, name), declared)) in self
            .column_names_original
            .iter()
            .zip(self.column_types.iter())
            .enumerate()
        {
            let table_index = usize::try_from(*table).ok();
            let natural = if use_natural {
                self.column_names[index].1.clone()
            } else {
                natural_name(name)
            };
            columns.push(SchemaColumn {
                table_index,
                name: name.clone(),
                natural_name: natural,
                column_type: ColumnType::classify(declared),
            });
        }

        let primary_keys = self
            .primary_keys
            .into_iter()
            .flat_map(|k| match k {
                KeyRef::Single(i) => vec![i],
                KeyRef::Composite(v) => v,
            })
            .collect();

        Ok(DatabaseSchema {
            db_id: self.db_id,
            table_names: self.table_names_original,
            table_natural_names,
            columns,
            primary_keys,
            foreign_keys: self.foreign_keys,
        })
    }
}

/// Schemas by `db_id`.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: HashMap<String, Arc<DatabaseSchema>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a Spider-style `tables.json` list.
    pub fn load_tables_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Nl2SqlError::Schema(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let entries: Vec<SpiderTableEntry> = serde_json::from_str(&content).map_err(|e| {
            Nl2SqlError::Schema(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        let mut catalog = Self::new();
        for entry in entries {
            catalog.insert(entry.into_schema()?);
        }
        info!("Loaded {} schemas from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Read table and column definitions from a SQLite file.
    pub fn introspect_sqlite(db_id: &str, path: impl AsRef<Path>) -> Result<DatabaseSchema> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            Nl2SqlError::ProbeConnection(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
        )?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut schema = DatabaseSchema::new(db_id);
        let mut pending_fks = Vec::new();
        for table in &tables {
            let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
            let rows: Vec<(String, String, i64)> = info
                .query_map([], |row| Ok((row.get(1)?, row.get(2)?, row.get(5)?)))?
                .collect::<std::result::Result<_, _>>()?;
            let columns: Vec<(&str, &str)> = rows
                .iter()
                .map(|(name, declared, _)| (name.as_str(), declared.as_str()))
                .collect();
            schema.add_table(table, &columns);
            for (name, _, pk) in &rows {
                if *pk > 0 {
                    schema.set_primary_key(table, name)?;
                }
            }

            let mut fk = conn.prepare(&format!(
                "PRAGMA foreign_key_list({})",
                quote_identifier(table)
            ))?;
            let links: Vec<(String, String, Option<String>)> = fk
                .query_map([], |row| Ok((row.get(2)?, row.get(3)?, row.get(4)?)))?
                .collect::<std::result::Result<_, _>>()?;
            for (ref_table, from, to) in links {
                pending_fks.push((table.clone(), from, ref_table, to));
            }
        }

        for (table, from, ref_table, to) in pending_fks {
            let to = match to {
                Some(column) => column,
                None => {
                    let Some(ref_index) = schema.table_index(&ref_table) else {
                        continue;
                    };
                    match schema
                        .primary_keys
                        .iter()
                        .find(|pk| schema.columns[**pk].table_index == Some(ref_index))
                    {
                        Some(pk) => schema.columns[*pk].name.clone(),
                        None => continue,
                    }
                }
            };
            if let Err(e) = schema.add_foreign_key(&table, &from, &ref_table, &to) {
                debug!("Skipping foreign key on {}: {}", db_id, e);
            }
        }

        debug!(
            "Introspected {}: {} tables, {} columns",
            db_id,
            schema.table_names.len(),
            schema.columns.len() - 1
        );
        Ok(schema)
    }

    /// Introspect every `<dir>/<db_id>/<db_id>.sqlite` under a directory.
    pub fn introspect_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut catalog = Self::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let db_id = entry.file_name().to_string_lossy().to_string();
            let path: PathBuf = entry.path().join(format!("{}.sqlite", db_id));
            if path.exists() {
                catalog.insert(Self::introspect_sqlite(&db_id, &path)?);
            }
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, schema: DatabaseSchema) {
        self.schemas.insert(schema.db_id.clone(), Arc::new(schema));
    }

    pub fn get(&self, db_id: &str) -> Option<Arc<DatabaseSchema>> {
        self.schemas.get(db_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
