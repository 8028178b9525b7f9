//! SQL skeletons: clause keywords and shape with identifiers and literals reduced to `_`.

use crate::schema::DatabaseSchema;
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{HashMap, HashSet};
use tracing::warn;

const PLACEHOLDER: &str = "_";

lazy_static! {
    static ref STRUCTURE_KEYWORDS: HashSet<&'static str> = [
        "select", "from", "where", "group", "by", "order", "having", "limit", "offset", "join",
        "inner", "left", "right", "full", "outer", "cross", "natural", "on", "using", "and", "or",
        "not", "in", "like", "glob", "between", "is", "null", "distinct", "as", "asc", "desc",
        "union", "intersect", "except", "all", "exists", "case", "when", "then", "else", "end",
        "count", "sum", "avg", "min", "max", "cast", "with", "over", "partition",
    ]
    .into_iter()
    .collect();
    static ref FALLBACK_LEXEME: Regex = Regex::new(
        r#"'(?:[^']|'')*'|"[^"]*"|`[^`]*`|\[[^\]]*\]|\d+(?:\.\d+)?|\w+|<=|>=|!=|<>|==|\S"#
    )
    .expect("static regex");
}

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Word { text: String, quoted: bool },
    Literal,
    Symbol(String),
}

fn symbol(text: &str) -> Lexeme {
    Lexeme::Symbol(text.to_string())
}

fn lex_with_sqlparser(sql: &str) -> Option<Vec<Lexeme>> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize().ok()?;
    let mut lexemes = Vec::with_capacity(tokens.len());
    for token in tokens {
        let lexeme = match token {
            Token::Whitespace(_) => continue,
            Token::EOF | Token::SemiColon => break,
            Token::Word(w) => Lexeme::Word {
                quoted: w.quote_style.is_some(),
                text: w.value,
            },
            Token::Number(_, _)
            | Token::SingleQuotedString(_)
            | Token::DoubleQuotedString(_)
            | Token::NationalStringLiteral(_)
            | Token::EscapedStringLiteral(_)
            | Token::HexStringLiteral(_)
            | Token::Placeholder(_) => Lexeme::Literal,
            Token::Eq | Token::DoubleEq => symbol("="),
            Token::Neq => symbol("!="),
            other => Lexeme::Symbol(other.to_string()),
        };
        lexemes.push(lexeme);
    }
    Some(lexemes)
}

fn lex_heuristic(sql: &str) -> Vec<Lexeme> {
    let mut lexemes = Vec::new();
    for m in FALLBACK_LEXEME.find_iter(sql) {
        let text = m.as_str();
        let first = text.chars().next().unwrap_or(' ');
        let lexeme = match first {
            ';' => break,
            '\'' => Lexeme::Literal,
            '"' | '`' | '[' => Lexeme::Word {
                text: text.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']')).to_string(),
                quoted: true,
            },
            c if c.is_ascii_digit() => Lexeme::Literal,
            c if c.is_alphanumeric() || c == '_' => Lexeme::Word {
                text: text.to_string(),
                quoted: false,
            },
            _ => match text {
                "==" => symbol("="),
                "<>" => symbol("!="),
                other => symbol(other),
            },
        };
        lexemes.push(lexeme);
    }
    lexemes
}

/// Reduces SQL to its structural skeleton.
#[derive(Debug, Clone, Default)]
pub struct SkeletonExtractor {
    identifiers: HashSet<String>,
}

impl SkeletonExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema names are always treated as identifiers, even when they collide with keywords.
    pub fn for_schema(schema: &DatabaseSchema) -> Self {
        Self {
            identifiers: schema.identifier_names().into_iter().collect(),
        }
    }

    pub fn to_skeleton(&self, sql: &str) -> String {
        let lexemes = match lex_with_sqlparser(sql) {
            Some(lexemes) => lexemes,
            None => {
                warn!("SQL tokenizer rejected query, using heuristic lexer");
                lex_heuristic(sql)
            }
        };

        let mut tokens: Vec<String> = Vec::with_capacity(lexemes.len());
        for (i, lexeme) in lexemes.iter().enumerate() {
            let token = match lexeme {
                Lexeme::Literal => PLACEHOLDER.to_string(),
                Lexeme::Word { quoted: true, .. } => PLACEHOLDER.to_string(),
                Lexeme::Word { text, quoted: false } => {
                    let lower = text.to_lowercase();
                    let is_call = matches!(lexemes.get(i + 1), Some(Lexeme::Symbol(s)) if s == "(");
                    if self.identifiers.contains(&lower) && !is_call {
                        PLACEHOLDER.to_string()
                    } else if STRUCTURE_KEYWORDS.contains(lower.as_str()) {
                        lower
                    } else {
                        PLACEHOLDER.to_string()
                    }
                }
                Lexeme::Symbol(s) if s == "*" => PLACEHOLDER.to_string(),
                Lexeme::Symbol(s) => s.clone(),
            };
            tokens.push(token);
        }

        normalize_shape(tokens).join(" ")
    }
}

/// Skeleton with an optional schema, for one-off calls.
pub fn to_skeleton(sql: &str, schema: Option<&DatabaseSchema>) -> String {
    match schema {
        Some(schema) => SkeletonExtractor::for_schema(schema).to_skeleton(sql),
        None => SkeletonExtractor::new().to_skeleton(sql),
    }
}

fn is_placeholder(token: Option<&String>) -> bool {
    token.map_or(false, |t| t == PLACEHOLDER)
}

fn normalize_shape(tokens: Vec<String>) -> Vec<String> {
    // qualified names: _ . _
    let mut merged: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "." && is_placeholder(merged.last()) && is_placeholder(tokens.get(i + 1)) {
            i += 2;
            continue;
        }
        merged.push(tokens[i].clone());
        i += 1;
    }

    // aliases: as _
    let mut unaliased = Vec::with_capacity(merged.len());
    let mut i = 0;
    while i < merged.len() {
        if merged[i] == "as" && is_placeholder(merged.get(i + 1)) {
            i += 2;
            continue;
        }
        unaliased.push(merged[i].clone());
        i += 1;
    }

    // join conditions: join _ on _ = _ [and _ = _]*
    let mut joined: Vec<String> = Vec::with_capacity(unaliased.len());
    let mut i = 0;
    while i < unaliased.len() {
        let after_join = joined.len() >= 2
            && joined[joined.len() - 2] == "join"
            && joined[joined.len() - 1] == PLACEHOLDER;
        let is_condition = |at: usize, lead: &str| {
            unaliased.get(at).map(String::as_str) == Some(lead)
                && is_placeholder(unaliased.get(at + 1))
                && unaliased.get(at + 2).map(String::as_str) == Some("=")
                && is_placeholder(unaliased.get(at + 3))
        };
        if after_join && is_condition(i, "on") {
            i += 4;
            while is_condition(i, "and") {
                i += 4;
            }
            continue;
        }
        joined.push(unaliased[i].clone());
        i += 1;
    }

    // lists and runs of placeholders: _ , _ and _ _
    let mut compact: Vec<String> = Vec::with_capacity(joined.len());
    let mut i = 0;
    while i < joined.len() {
        let token = &joined[i];
        if token == "," && is_placeholder(compact.last()) && is_placeholder(joined.get(i + 1)) {
            i += 2;
            continue;
        }
        if token == PLACEHOLDER && is_placeholder(compact.last()) {
            i += 1;
            continue;
        }
        compact.push(token.clone());
        i += 1;
    }
    compact
}

/// Multiset Jaccard similarity over whitespace-separated skeleton tokens.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    fn counts(s: &str) -> (HashMap<&str, usize>, usize) {
        let mut map = HashMap::new();
        let mut total = 0;
        for token in s.split_whitespace() {
            *map.entry(token).or_insert(0) += 1;
            total += 1;
        }
        (map, total)
    }

    let (left, left_total) = counts(a);
    let (right, right_total) = counts(b);
    if left_total == 0 && right_total == 0 {
        return 1.0;
    }
    let intersection: usize = left
        .iter()
        .filter_map(|(token, n)| right.get(token).map(|m| (*n).min(*m)))
        .sum();
    let union = left_total + right_total - intersection;
    intersection as f64 / union as f64
}
