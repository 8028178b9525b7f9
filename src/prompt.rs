//! Prompt assembly for draft generation and refinement.
//!
//! Examples are rendered as their question section followed by
//! `"\nSELECT " + sql_query`; stored SQL never carries its own `SELECT`.

use crate::config::{PromptConfig, SchemaRenderMode};
use crate::corpus::TrainingExample;
use crate::schema::{ColumnType, DatabaseSchema, SchemaCatalog};
use crate::selector::SelectedExample;
use std::sync::Arc;
use tracing::debug;

const EXAMPLES_HEADER: &str = "/* Some SQL examples are provided based on similar problems: */";
const DDL_INSTRUCTION: &str = "/* Complete sqlite SQL query only and with no explanation */";
const TABLE_LIST_INSTRUCTION: &str = "### Complete sqlite SQL query only and with no explanation";

/// Rough token estimate, ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() + 3) / 4
}

fn needs_quotes(name: &str) -> bool {
    name.is_empty()
        || name.starts_with(|c: char| c.is_ascii_digit())
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ident(name: &str) -> String {
    if needs_quotes(name) {
        crate::schema::quote_identifier(name)
    } else {
        name.to_string()
    }
}

fn ddl_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "text",
        ColumnType::Number => "number",
        ColumnType::Time => "time",
        ColumnType::Boolean => "boolean",
        ColumnType::Others => "blob",
    }
}

/// Keep user text from closing the surrounding SQL comment.
fn comment_safe(text: &str) -> String {
    text.replace("*/", "* /")
}

pub struct PromptBuilder {
    config: PromptConfig,
    catalog: Arc<SchemaCatalog>,
}

impl PromptBuilder {
    pub fn new(config: PromptConfig, catalog: Arc<SchemaCatalog>) -> Self {
        Self { config, catalog }
    }

    pub fn render_mode(&self) -> SchemaRenderMode {
        self.config.schema_render_mode
    }

    pub fn render_schema(&self, schema: &DatabaseSchema) -> String {
        match self.config.schema_render_mode {
            SchemaRenderMode::Ddl => render_ddl(schema),
            SchemaRenderMode::TableList => render_table_list(schema),
        }
    }

    /// Schema description (when known) followed by the question.
    pub fn format_question(
        &self,
        question: &str,
        schema: Option<&DatabaseSchema>,
        db_id: &str,
    ) -> String {
        let mut parts = Vec::new();
        match schema {
            Some(schema) => parts.push(self.render_schema(schema)),
            None => debug!("No schema for {}, rendering question only", db_id),
        }
        match self.config.schema_render_mode {
            SchemaRenderMode::Ddl => {
                parts.push(format!("/* Answer the following: {} */", comment_safe(question)))
            }
            SchemaRenderMode::TableList => parts.push(format!("### {}", question)),
        }
        parts.join("\n")
    }

    /// An example's question section without its SQL.
    pub fn format_example_only(&self, example: &TrainingExample) -> String {
        let schema = self.catalog.get(&example.db_id);
        self.format_question(&example.question, schema.as_deref(), &example.db_id)
    }

    fn format_example(&self, example: &TrainingExample) -> String {
        format!("{}\nSELECT {}", self.format_example_only(example), example.sql_query)
    }

    /// Examples that fit within the remaining token budget, in the given order.
    pub fn format_examples(&self, examples: &[SelectedExample], budget_tokens: usize) -> String {
        let mut parts = vec![EXAMPLES_HEADER.to_string()];
        let mut used = estimate_tokens(EXAMPLES_HEADER);
        for selected in examples {
            let rendered = self.format_example(&selected.example);
            let cost = estimate_tokens(&rendered) + 1;
            if used + cost > budget_tokens {
                debug!(
                    "Prompt budget reached after {} of {} examples",
                    parts.len() - 1,
                    examples.len()
                );
                break;
            }
            used += cost;
            parts.push(rendered);
        }
        if parts.len() == 1 {
            return String::new();
        }
        parts.join("\n\n")
    }

    fn instruction(&self) -> &'static str {
        match self.config.schema_render_mode {
            SchemaRenderMode::Ddl => DDL_INSTRUCTION,
            SchemaRenderMode::TableList => TABLE_LIST_INSTRUCTION,
        }
    }

    fn assemble(&self, examples: &[SelectedExample], tail: Vec<String>) -> String {
        let mut tail = tail;
        if self.config.completion_cue {
            tail.push("SELECT ".to_string());
        }
        let tail = tail.join("\n");
        let fixed = estimate_tokens(self.instruction()) + estimate_tokens(&tail) + 2;
        let budget = self.config.max_prompt_tokens.saturating_sub(fixed);

        let mut parts = vec![self.instruction().to_string()];
        let rendered = self.format_examples(examples, budget);
        if !rendered.is_empty() {
            parts.push(rendered);
        }
        parts.push(tail);
        parts.join("\n\n")
    }

    /// Draft prompt: question-mask examples plus the target question.
    pub fn build_generation_prompt(
        &self,
        question: &str,
        db_id: &str,
        examples: &[SelectedExample],
    ) -> String {
        let schema = self.catalog.get(db_id);
        let target = self.format_question(question, schema.as_deref(), db_id);
        self.assemble(examples, vec![target])
    }

    /// Refinement prompt: combined examples, the target, optional context and the draft.
    pub fn build_refinement_prompt(
        &self,
        question: &str,
        db_id: &str,
        examples: &[SelectedExample],
        draft_sql: &str,
        context: Option<&str>,
    ) -> String {
        let schema = self.catalog.get(db_id);
        let mut tail = vec![self.format_question(question, schema.as_deref(), db_id)];
        if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
            tail.push(format!("/* Additional context:\n{}\n*/", comment_safe(context)));
        }
        tail.push(format!(
            "/* A draft query for this question is below; return a corrected query:\n{}\n*/",
            comment_safe(draft_sql)
        ));
        self.assemble(examples, tail)
    }
}

fn render_ddl(schema: &DatabaseSchema) -> String {
    let mut statements = Vec::with_capacity(schema.table_names.len());
    for (table_index, table) in schema.table_names.iter().enumerate() {
        let mut lines: Vec<String> = schema
            .columns_of(table_index)
            .map(|(_, c)| format!("{} {}", ident(&c.name), ddl_type(c.column_type)))
            .collect();

        let pks: Vec<String> = schema
            .primary_keys
            .iter()
            .filter_map(|pk| schema.columns.get(*pk))
            .filter(|c| c.table_index == Some(table_index))
            .map(|c| ident(&c.name))
            .collect();
        if !pks.is_empty() {
            lines.push(format!("PRIMARY KEY ({})", pks.join(", ")));
        }

        for (from, to) in &schema.foreign_keys {
            let (Some(from), Some(to)) = (schema.columns.get(*from), schema.columns.get(*to)) else {
                continue;
            };
            if from.table_index != Some(table_index) {
                continue;
            }
            let Some(ref_table) = to.table_index.and_then(|t| schema.table_names.get(t)) else {
                continue;
            };
            lines.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                ident(&from.name),
                ident(ref_table),
                ident(&to.name)
            ));
        }

        statements.push(format!(
            "CREATE TABLE {} (\n{}\n);",
            ident(table),
            lines.join(",\n")
        ));
    }
    format!(
        "/* Given the following database schema: */\n{}",
        statements.join("\n\n")
    )
}

fn render_table_list(schema: &DatabaseSchema) -> String {
    let mut lines = vec![
        "### SQLite SQL tables, with their properties:".to_string(),
        "#".to_string(),
    ];
    for (table_index, table) in schema.table_names.iter().enumerate() {
        let columns: Vec<&str> = schema
            .columns_of(table_index)
            .map(|(_, c)| c.name.as_str())
            .collect();
        lines.push(format!("# {}({})", table, columns.join(", ")));
    }
    lines.push("#".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<SchemaCatalog> {
        let mut schema = DatabaseSchema::new("shop");
        schema.add_table("customers", &[("id", "INTEGER"), ("name", "TEXT")]);
        schema.add_table("orders", &[("id", "INTEGER"), ("customer id", "INTEGER")]);
        schema.set_primary_key("customers", "id").unwrap();
        schema
            .add_foreign_key("orders", "customer id", "customers", "id")
            .unwrap();
        let mut catalog = SchemaCatalog::new();
        catalog.insert(schema);
        Arc::new(catalog)
    }

    fn selected(example: TrainingExample) -> SelectedExample {
        SelectedExample {
            index: 0,
            score: 0.0,
            example,
        }
    }

    #[test]
    fn test_ddl_rendering() {
        let builder = PromptBuilder::new(PromptConfig::default(), catalog());
        let text = builder.format_question("How many orders?", builder.catalog.get("shop").as_deref(), "shop");
        assert!(text.starts_with("/* Given the following database schema: */\nCREATE TABLE customers ("));
        assert!(text.contains("PRIMARY KEY (id)"));
        assert!(text.contains("FOREIGN KEY (\"customer id\") REFERENCES customers(id)"));
        assert!(text.ends_with("/* Answer the following: How many orders? */"));
    }

    #[test]
    fn test_table_list_rendering() {
        let config = PromptConfig {
            schema_render_mode: SchemaRenderMode::TableList,
            ..PromptConfig::default()
        };
        let builder = PromptBuilder::new(config, catalog());
        let text = builder.format_question("list customers", builder.catalog.get("shop").as_deref(), "shop");
        assert!(text.contains("# customers(id, name)\n# orders(id, customer id)\n#"));
        assert!(text.ends_with("### list customers"));
    }

    #[test]
    fn test_example_sql_gets_single_select() {
        let builder = PromptBuilder::new(PromptConfig::default(), catalog());
        let example = TrainingExample::new("shop", "List names", "SELECT name FROM customers");
        let rendered = format!("{}\nSELECT {}", builder.format_example_only(&example), example.sql_query);
        assert!(rendered.ends_with("\nSELECT name FROM customers"));
        assert!(!rendered.contains("SELECT SELECT"));
    }

    #[test]
    fn test_budget_truncates_examples() {
        let config = PromptConfig {
            max_prompt_tokens: 120,
            ..PromptConfig::default()
        };
        let builder = PromptBuilder::new(config, Arc::new(SchemaCatalog::new()));
        let examples: Vec<SelectedExample> = (0..20)
            .map(|i| {
                selected(TrainingExample::new(
                    "other",
                    &format!("question number {}", i),
                    "SELECT a FROM b",
                ))
            })
            .collect();
        let prompt = builder.build_generation_prompt("target", "other", &examples);
        assert!(estimate_tokens(&prompt) <= 120);
        assert!(prompt.contains("question number 0"));
        assert!(!prompt.contains("question number 19"));
        assert!(prompt.ends_with("/* Answer the following: target */"));
    }

    #[test]
    fn test_refinement_prompt_blocks() {
        let config = PromptConfig {
            completion_cue: true,
            ..PromptConfig::default()
        };
        let builder = PromptBuilder::new(config, catalog());
        let prompt = builder.build_refinement_prompt(
            "Show me all customers",
            "shop",
            &[],
            "SELECT * FROM customers",
            Some("Customers are */ stored in the customers table."),
        );
        assert!(!prompt.contains(EXAMPLES_HEADER));
        assert!(prompt.contains("/* Additional context:\nCustomers are * / stored"));
        assert!(prompt.contains("SELECT * FROM customers\n*/"));
        assert!(prompt.ends_with("\nSELECT "));
    }
}
