//! N-gram schema linking between question tokens and column/table names.

use super::tokenize::{is_punctuation, is_stopword};
use crate::error::Nl2SqlError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

const MAX_NGRAM: usize = 5;

/// `"question_index,element_index"` key used by every link map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    pub question_index: usize,
    pub element_index: usize,
}

impl LinkKey {
    pub fn new(question_index: usize, element_index: usize) -> Self {
        Self {
            question_index,
            element_index,
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.question_index, self.element_index)
    }
}

impl FromStr for LinkKey {
    type Err = Nl2SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (q, e) = s
            .split_once(',')
            .ok_or_else(|| Nl2SqlError::Corpus(format!("Malformed link key '{}'", s)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<usize>()
                .map_err(|e| Nl2SqlError::Corpus(format!("Malformed link key '{}': {}", s, e)))
        };
        Ok(LinkKey::new(parse(q)?, parse(e)?))
    }
}

impl Serialize for LinkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LinkKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchemaMatch {
    #[serde(rename = "CEM")]
    ColumnExact,
    #[serde(rename = "CPM")]
    ColumnPartial,
    #[serde(rename = "TEM")]
    TableExact,
    #[serde(rename = "TPM")]
    TablePartial,
}

impl SchemaMatch {
    pub fn is_exact(&self) -> bool {
        matches!(self, SchemaMatch::ColumnExact | SchemaMatch::TableExact)
    }

    pub fn is_column(&self) -> bool {
        matches!(self, SchemaMatch::ColumnExact | SchemaMatch::ColumnPartial)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLinkResult {
    #[serde(default)]
    pub q_col_match: BTreeMap<LinkKey, SchemaMatch>,
    #[serde(default)]
    pub q_tab_match: BTreeMap<LinkKey, SchemaMatch>,
}

impl SchemaLinkResult {
    pub fn is_empty(&self) -> bool {
        self.q_col_match.is_empty() && self.q_tab_match.is_empty()
    }

    /// Question positions holding any column or table match.
    pub fn matched_positions(&self) -> BTreeSet<usize> {
        self.q_col_match
            .keys()
            .chain(self.q_tab_match.keys())
            .map(|k| k.question_index)
            .collect()
    }
}

fn is_filler(window: &[String]) -> bool {
    window
        .iter()
        .all(|t| t.trim().is_empty() || is_stopword(t) || is_punctuation(t))
}

/// Compile a whole-word pattern for an n-gram; `None` for filler windows.
fn partial_pattern(window: &[String]) -> Option<Regex> {
    if is_filler(window) {
        return None;
    }
    Regex::new(&format!(r"\b{}\b", regex::escape(&window.join(" ")))).ok()
}

/// Longest-first n-gram linking of question tokens against column and table names.
///
/// `columns[0]` is the `*` placeholder and never matches.
pub fn compute_schema_linking(
    question: &[String],
    columns: &[Vec<String>],
    tables: &[Vec<String>],
) -> SchemaLinkResult {
    let column_names: Vec<(usize, String)> = columns
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, c)| (i, c.join(" ")))
        .collect();
    let table_names: Vec<(usize, String)> = tables
        .iter()
        .enumerate()
        .map(|(i, t)| (i, t.join(" ")))
        .collect();

    let mut result = SchemaLinkResult::default();

    for n in (1..=MAX_NGRAM).rev() {
        if n > question.len() {
            continue;
        }
        for start in 0..=question.len() - n {
            let window = &question[start..start + n];
            let n_gram = window.join(" ");
            if n_gram.trim().is_empty() {
                continue;
            }

            for (col_id, name) in &column_names {
                if *name == n_gram {
                    for q in start..start + n {
                        result
                            .q_col_match
                            .insert(LinkKey::new(q, *col_id), SchemaMatch::ColumnExact);
                    }
                }
            }
            for (tab_id, name) in &table_names {
                if *name == n_gram {
                    for q in start..start + n {
                        result
                            .q_tab_match
                            .insert(LinkKey::new(q, *tab_id), SchemaMatch::TableExact);
                    }
                }
            }

            let Some(pattern) = partial_pattern(window) else {
                continue;
            };
            for (col_id, name) in &column_names {
                if pattern.is_match(name) {
                    for q in start..start + n {
                        result
                            .q_col_match
                            .entry(LinkKey::new(q, *col_id))
                            .or_insert(SchemaMatch::ColumnPartial);
                    }
                }
            }
            for (tab_id, name) in &table_names {
                if pattern.is_match(name) {
                    for q in start..start + n {
                        result
                            .q_tab_match
                            .entry(LinkKey::new(q, *tab_id))
                            .or_insert(SchemaMatch::TablePartial);
                    }
                }
            }
        }
    }

    result
}

/// Resolve overlapping schema matches and drop cell matches that collide with them.
///
/// Positions with fewer candidates are settled first. A position whose
/// candidates intersect what was already chosen keeps only the intersection;
/// otherwise exact candidates win over partial ones.
pub fn match_shift<V: Clone>(
    sc_link: &SchemaLinkResult,
    cell_match: &BTreeMap<LinkKey, V>,
) -> (SchemaLinkResult, BTreeMap<LinkKey, V>) {
    let mut by_position: BTreeMap<usize, BTreeSet<(SchemaMatch, usize)>> = BTreeMap::new();
    for (key, tag) in sc_link.q_col_match.iter().chain(sc_link.q_tab_match.iter()) {
        by_position
            .entry(key.question_index)
            .or_default()
            .insert((*tag, key.element_index));
    }

    let mut priority: Vec<(usize, usize)> = by_position
        .iter()
        .map(|(q, candidates)| (candidates.len(), *q))
        .collect();
    priority.sort();

    let mut chosen: BTreeSet<(SchemaMatch, usize)> = BTreeSet::new();
    let mut shifted = SchemaLinkResult::default();
    for (_, q) in priority {
        let candidates = &by_position[&q];
        let overlap: BTreeSet<(SchemaMatch, usize)> =
            chosen.intersection(candidates).copied().collect();
        let kept = if overlap.is_empty() {
            let exact: BTreeSet<(SchemaMatch, usize)> =
                candidates.iter().filter(|(t, _)| t.is_exact()).copied().collect();
            let kept = if exact.is_empty() { candidates.clone() } else { exact };
            chosen.extend(kept.iter().copied());
            kept
        } else {
            overlap
        };
        for (tag, element) in kept {
            let key = LinkKey::new(q, element);
            if tag.is_column() {
                shifted.q_col_match.insert(key, tag);
            } else {
                shifted.q_tab_match.insert(key, tag);
            }
        }
    }

    let cells = cell_match
        .iter()
        .filter(|(key, _)| !by_position.contains_key(&key.question_index))
        .map(|(key, tag)| (*key, tag.clone()))
        .collect();

    (shifted, cells)
}
