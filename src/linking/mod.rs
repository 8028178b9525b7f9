//! Schema and cell-value linking for a single question.

pub mod schema_linker;
pub mod tokenize;
pub mod value_linker;

pub use schema_linker::{compute_schema_linking, match_shift, LinkKey, SchemaLinkResult, SchemaMatch};
pub use value_linker::{
    compute_cell_value_linking, CellMatch, CellValueLinkResult, NumDateTag, SqliteProbe,
    SqliteProbeProvider, ValueProbe, ValueProbeProvider,
};

use crate::schema::DatabaseSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tokens plus both link maps, as stored on corpus records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkedQuestion {
    pub tokens: Vec<String>,
    pub sc_link: SchemaLinkResult,
    pub cv_link: CellValueLinkResult,
}

/// Link a tokenized question against a schema, then resolve overlaps with [`match_shift`].
///
/// An invalid schema yields empty link maps. A missing or failing probe
/// yields an empty `cv_link`. Neither is reported as an error.
pub fn link_question(
    tokens: Vec<String>,
    schema: &DatabaseSchema,
    probe: Option<&dyn ValueProbe>,
) -> LinkedQuestion {
    if let Err(e) = schema.validate() {
        warn!("Schema linking skipped for {}: {}", schema.db_id, e);
        return LinkedQuestion {
            tokens,
            ..Default::default()
        };
    }

    let sc_link = compute_schema_linking(&tokens, &schema.column_tokens(), &schema.table_tokens());

    let mut cv_link = match probe {
        Some(probe) => match compute_cell_value_linking(&tokens, schema, probe) {
            Ok(link) => link,
            Err(e) => {
                warn!("Cell-value linking skipped for {}: {}", schema.db_id, e);
                CellValueLinkResult::default()
            }
        },
        None => CellValueLinkResult::default(),
    };

    let (sc_link, cell_match) = match_shift(&sc_link, &cv_link.cell_match);
    cv_link.cell_match = cell_match;

    LinkedQuestion {
        tokens,
        sc_link,
        cv_link,
    }
}

/// Connect through the provider and link; connection failures only drop value linking.
pub fn link_with_provider(
    tokens: Vec<String>,
    schema: &DatabaseSchema,
    provider: Option<&dyn ValueProbeProvider>,
) -> LinkedQuestion {
    let probe = match provider.map(|p| p.connect(&schema.db_id)) {
        Some(Ok(probe)) => Some(probe),
        Some(Err(e)) => {
            warn!("Value probe unavailable for {}: {}", schema.db_id, e);
            None
        }
        None => None,
    };
    link_question(tokens, schema, probe.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Nl2SqlError, Result};

    struct BrokenProbe;

    impl ValueProbe for BrokenProbe {
        fn partial_match(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Err(Nl2SqlError::ProbeConnection("gone".to_string()))
        }

        fn exact_match(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Err(Nl2SqlError::ProbeConnection("gone".to_string()))
        }
    }

    fn schema() -> DatabaseSchema {
        let mut schema = DatabaseSchema::new("shop");
        schema.add_table("customers", &[("id", "INTEGER"), ("name", "TEXT")]);
        schema
    }

    #[test]
    fn test_invalid_schema_falls_back_to_empty_links() {
        let mut schema = schema();
        schema.primary_keys.push(99);
        let linked = link_question(vec!["customers".to_string()], &schema, None);
        assert!(linked.sc_link.is_empty());
        assert!(linked.cv_link.is_empty());
        assert_eq!(linked.tokens, vec!["customers"]);
    }

    /// Reports every word as a stored value.
    struct EverythingProbe;

    impl ValueProbe for EverythingProbe {
        fn partial_match(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(true)
        }

        fn exact_match(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_cell_matches_under_schema_matches_are_dropped() {
        let tokens = vec!["customers".to_string(), "alice".to_string()];
        let linked = link_question(tokens, &schema(), Some(&EverythingProbe));
        assert_eq!(
            linked.sc_link.q_tab_match.get(&LinkKey::new(0, 0)),
            Some(&SchemaMatch::TableExact)
        );
        assert!(linked.cv_link.cell_match.keys().all(|k| k.question_index == 1));
        assert_eq!(
            linked.cv_link.cell_match.get(&LinkKey::new(1, 2)),
            Some(&CellMatch::Exact)
        );
    }

    #[test]
    fn test_probe_failure_keeps_schema_links() {
        let tokens = vec!["alice".to_string(), "customers".to_string()];
        let linked = link_question(tokens, &schema(), Some(&BrokenProbe));
        assert!(!linked.sc_link.is_empty());
        assert!(linked.cv_link.is_empty());
    }
}
