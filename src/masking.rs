use crate::linking::{CellValueLinkResult, SchemaLinkResult};
use std::collections::BTreeSet;

pub const DEFAULT_MASK_TAG: &str = "<mask>";
pub const DEFAULT_VALUE_TAG: &str = "<unk>";

/// Rewrites linked questions into retrieval keys.
///
/// Value positions become `value_tag`, then schema positions become
/// `mask_tag`, so a token with both kinds of match ends up masked as schema.
#[derive(Debug, Clone)]
pub struct QuestionMasker {
    pub mask_tag: String,
    pub value_tag: String,
}

impl Default for QuestionMasker {
    fn default() -> Self {
        Self {
            mask_tag: DEFAULT_MASK_TAG.to_string(),
            value_tag: DEFAULT_VALUE_TAG.to_string(),
        }
    }
}

impl QuestionMasker {
    pub fn new(mask_tag: impl Into<String>, value_tag: impl Into<String>) -> Self {
        Self {
            mask_tag: mask_tag.into(),
            value_tag: value_tag.into(),
        }
    }

    pub fn mask(
        &self,
        tokens: &[String],
        sc_link: &SchemaLinkResult,
        cv_link: &CellValueLinkResult,
    ) -> Vec<String> {
        let value_positions: BTreeSet<usize> = cv_link
            .num_date_match
            .keys()
            .chain(cv_link.cell_match.keys())
            .map(|k| k.question_index)
            .collect();
        let schema_positions = sc_link.matched_positions();

        tokens
            .iter()
            .enumerate()
            .map(|(i, token)| {
                if schema_positions.contains(&i) {
                    self.mask_tag.clone()
                } else if value_positions.contains(&i) {
                    self.value_tag.clone()
                } else {
                    token.clone()
                }
            })
            .collect()
    }

    /// Space-joined masked question, the form that gets embedded.
    pub fn mask_question(
        &self,
        tokens: &[String],
        sc_link: &SchemaLinkResult,
        cv_link: &CellValueLinkResult,
    ) -> String {
        self.mask(tokens, sc_link, cv_link).join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linking::{CellMatch, LinkKey, NumDateTag, SchemaMatch};

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn show_top_customers() -> (Vec<String>, SchemaLinkResult, CellValueLinkResult) {
        let tokens = toks(&["show", "top", "10", "customers"]);
        let mut sc_link = SchemaLinkResult::default();
        sc_link
            .q_tab_match
            .insert(LinkKey::new(3, 0), SchemaMatch::TableExact);
        let mut cv_link = CellValueLinkResult::default();
        cv_link
            .num_date_match
            .insert(LinkKey::new(2, 1), NumDateTag::Number);
        (tokens, sc_link, cv_link)
    }

    #[test]
    fn test_masks_schema_and_values() {
        let (tokens, sc_link, cv_link) = show_top_customers();
        let masked = QuestionMasker::default().mask(&tokens, &sc_link, &cv_link);
        assert_eq!(masked, toks(&["show", "top", "<unk>", "<mask>"]));
    }

    #[test]
    fn test_masking_is_idempotent() {
        let (tokens, sc_link, cv_link) = show_top_customers();
        let masker = QuestionMasker::default();
        assert_eq!(
            masker.mask(&tokens, &sc_link, &cv_link),
            masker.mask(&tokens, &sc_link, &cv_link)
        );
    }

    #[test]
    fn test_schema_match_wins_over_value_match() {
        let tokens = toks(&["paris", "cities"]);
        let mut sc_link = SchemaLinkResult::default();
        sc_link
            .q_col_match
            .insert(LinkKey::new(0, 2), SchemaMatch::ColumnPartial);
        let mut cv_link = CellValueLinkResult::default();
        cv_link.cell_match.insert(LinkKey::new(0, 2), CellMatch::Exact);
        cv_link.num_date_match.insert(LinkKey::new(0, 3), NumDateTag::Time);

        let masked = QuestionMasker::new("[M]", "[V]").mask_question(&tokens, &sc_link, &cv_link);
        assert_eq!(masked, "[M] cities");
    }
}
