//! Cell-value linking: find question tokens that occur as stored values.

use super::schema_linker::LinkKey;
use super::tokenize::{is_punctuation, is_stopword};
use crate::error::{Nl2SqlError, Result};
use crate::schema::{quote_identifier, ColumnType, DatabaseSchema};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumDateTag {
    #[serde(rename = "NUMBER")]
    Number,
    #[serde(rename = "TIME")]
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellMatch {
    #[serde(rename = "EXACTMATCH")]
    Exact,
    #[serde(rename = "PARTIALMATCH")]
    Partial,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellValueLinkResult {
    #[serde(default)]
    pub num_date_match: BTreeMap<LinkKey, NumDateTag>,
    #[serde(default)]
    pub cell_match: BTreeMap<LinkKey, CellMatch>,
}

impl CellValueLinkResult {
    pub fn is_empty(&self) -> bool {
        self.num_date_match.is_empty() && self.cell_match.is_empty()
    }
}

/// Read-only value lookups against one live database.
pub trait ValueProbe: Send {
    /// True when `word` appears as a whole word inside some value of the column.
    fn partial_match(&self, table: &str, column: &str, word: &str) -> Result<bool>;

    /// True when some value equals `words`, ignoring one surrounding space.
    fn exact_match(&self, table: &str, column: &str, words: &str) -> Result<bool>;
}

/// Opens probes by `db_id`. Connection failures surface as `ProbeConnection`.
pub trait ValueProbeProvider: Send + Sync {
    fn connect(&self, db_id: &str) -> Result<Box<dyn ValueProbe>>;
}

fn escape_like(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len());
    for c in word.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct SqliteProbe {
    conn: Connection,
}

impl SqliteProbe {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Nl2SqlError::ProbeConnection(format!(
                "No database at {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            Nl2SqlError::ProbeConnection(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    fn any_like(&self, table: &str, column: &str, patterns: [String; 4]) -> bool {
        let col = quote_identifier(column);
        let sql = format!(
            "SELECT 1 FROM {table} WHERE {col} LIKE ?1 ESCAPE '\\' OR {col} LIKE ?2 ESCAPE '\\' \
             OR {col} LIKE ?3 ESCAPE '\\' OR {col} LIKE ?4 ESCAPE '\\' LIMIT 1",
            table = quote_identifier(table),
            col = col
        );
        let outcome = self.conn.prepare_cached(&sql).and_then(|mut stmt| {
            let [a, b, c, d] = &patterns;
            stmt.exists(rusqlite::params![a, b, c, d])
        });
        match outcome {
            Ok(found) => found,
            Err(e) => {
                debug!("Probe on {}.{} failed: {}", table, column, e);
                false
            }
        }
    }
}

impl ValueProbe for SqliteProbe {
    fn partial_match(&self, table: &str, column: &str, word: &str) -> Result<bool> {
        let w = escape_like(word);
        Ok(self.any_like(
            table,
            column,
            [
                format!("{} %", w),
                format!("% {}", w),
                format!("% {} %", w),
                w.clone(),
            ],
        ))
    }

    fn exact_match(&self, table: &str, column: &str, words: &str) -> Result<bool> {
        let w = escape_like(words);
        Ok(self.any_like(
            table,
            column,
            [
                w.clone(),
                format!(" {}", w),
                format!("{} ", w),
                format!(" {} ", w),
            ],
        ))
    }
}

/// Resolves `<db_dir>/<db_id>/<db_id>.sqlite`.
pub struct SqliteProbeProvider {
    db_dir: PathBuf,
}

impl SqliteProbeProvider {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
        }
    }

    pub fn database_path(&self, db_id: &str) -> PathBuf {
        self.db_dir.join(db_id).join(format!("{}.sqlite", db_id))
    }
}

impl ValueProbeProvider for SqliteProbeProvider {
    fn connect(&self, db_id: &str) -> Result<Box<dyn ValueProbe>> {
        Ok(Box::new(SqliteProbe::open(self.database_path(db_id))?))
    }
}

fn is_number(word: &str) -> bool {
    word.parse::<f64>().is_ok()
}

/// Tag numeric tokens by column type and probe the database for the rest.
///
/// Contiguous runs of partially matched tokens get one exact probe; a hit
/// upgrades the whole run to `Exact`. A probe returning `Err` aborts linking.
pub fn compute_cell_value_linking(
    tokens: &[String],
    schema: &DatabaseSchema,
    probe: &dyn ValueProbe,
) -> Result<CellValueLinkResult> {
    let mut result = CellValueLinkResult::default();

    for (col_id, column) in schema.columns.iter().enumerate().skip(1) {
        let Some(table) = column.table_index.and_then(|t| schema.table_names.get(t)) else {
            continue;
        };

        let mut matched = Vec::new();
        for (q, word) in tokens.iter().enumerate() {
            if word.trim().is_empty() || is_stopword(word) || is_punctuation(word) {
                continue;
            }
            if is_number(word) {
                let tag = match column.column_type {
                    ColumnType::Number => Some(NumDateTag::Number),
                    ColumnType::Time => Some(NumDateTag::Time),
                    _ => None,
                };
                if let Some(tag) = tag {
                    result.num_date_match.insert(LinkKey::new(q, col_id), tag);
                }
            } else if probe.partial_match(table, &column.name, word)? {
                matched.push(q);
            }
        }

        let mut from = 0;
        while from < matched.len() {
            let mut to = from + 1;
            while to < matched.len() && matched[to] == matched[to - 1] + 1 {
                to += 1;
            }
            let (q_start, q_end) = (matched[from], matched[to - 1] + 1);
            let words = tokens[q_start..q_end].join(" ");
            let tag = if probe.exact_match(table, &column.name, &words)? {
                CellMatch::Exact
            } else {
                CellMatch::Partial
            };
            for q in q_start..q_end {
                result.cell_match.insert(LinkKey::new(q, col_id), tag);
            }
            from = to;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaColumn;

    fn fixture() -> (SqliteProbe, DatabaseSchema) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE cities (id INTEGER, name TEXT, founded INTEGER);
             INSERT INTO cities VALUES (1, 'New York', 1624), (2, 'Paris', 250), (3, '50% Off Town', 1900);",
        )
        .unwrap();
        let mut schema = DatabaseSchema::new("geo");
        schema.add_table("cities", &[("id", "INTEGER"), ("name", "TEXT"), ("founded", "INTEGER")]);
        (SqliteProbe::from_connection(conn), schema)
    }

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_exact_run_and_numbers() {
        let (probe, schema) = fixture();
        let tokens = toks(&["cities", "like", "new", "york", "since", "1624"]);
        let link = compute_cell_value_linking(&tokens, &schema, &probe).unwrap();

        assert_eq!(link.cell_match.get(&LinkKey::new(2, 2)), Some(&CellMatch::Exact));
        assert_eq!(link.cell_match.get(&LinkKey::new(3, 2)), Some(&CellMatch::Exact));
        assert_eq!(
            link.num_date_match.get(&LinkKey::new(5, 3)),
            Some(&NumDateTag::Number)
        );
        assert!(!link.num_date_match.contains_key(&LinkKey::new(5, 2)));
    }

    #[test]
    fn test_dangling_table_index_is_skipped() {
        let (probe, mut schema) = fixture();
        schema.columns.push(SchemaColumn {
            table_index: Some(7),
            name: "name".to_string(),
            natural_name: "name".to_string(),
            column_type: ColumnType::Text,
        });
        let tokens = toks(&["paris"]);
        let link = compute_cell_value_linking(&tokens, &schema, &probe).unwrap();
        assert_eq!(link.cell_match.get(&LinkKey::new(0, 2)), Some(&CellMatch::Exact));
        assert!(!link.cell_match.contains_key(&LinkKey::new(0, 4)));
    }

    #[test]
    fn test_partial_match_only() {
        let (probe, schema) = fixture();
        let tokens = toks(&["york", "population"]);
        let link = compute_cell_value_linking(&tokens, &schema, &probe).unwrap();
        assert_eq!(link.cell_match.get(&LinkKey::new(0, 2)), Some(&CellMatch::Partial));
        assert_eq!(link.cell_match.len(), 1);
    }

    #[test]
    fn test_wildcards_are_escaped() {
        let (probe, _) = fixture();
        assert!(!probe.partial_match("cities", "name", "_aris").unwrap());
        assert!(probe.partial_match("cities", "name", "50%").unwrap());
    }

    #[test]
    fn test_missing_database_is_connection_error() {
        let provider = SqliteProbeProvider::new("/nonexistent/dir");
        assert!(matches!(
            provider.connect("nope"),
            Err(Nl2SqlError::ProbeConnection(_))
        ));
    }
}
