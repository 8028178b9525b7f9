//! Question and identifier tokenization shared by corpus preprocessing and live requests.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

const ENGLISH_STOPWORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "you're", "you've",
    "you'll", "you'd", "your", "yours", "yourself", "yourselves", "he", "him", "his", "himself",
    "she", "she's", "her", "hers", "herself", "it", "it's", "its", "itself", "they", "them",
    "their", "theirs", "themselves", "what", "which", "who", "whom", "this", "that", "that'll",
    "these", "those", "am", "is", "are", "was", "were", "be", "been", "being", "have", "has",
    "had", "having", "do", "does", "did", "doing", "a", "an", "the", "and", "but", "if", "or",
    "because", "as", "until", "while", "of", "at", "by", "for", "with", "about", "against",
    "between", "into", "through", "during", "before", "after", "above", "below", "to", "from",
    "up", "down", "in", "out", "on", "off", "over", "under", "again", "further", "then", "once",
    "here", "there", "when", "where", "why", "how", "all", "any", "both", "each", "few", "more",
    "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
    "too", "very", "s", "t", "can", "will", "just", "don", "don't", "should", "should've", "now",
    "d", "ll", "m", "o", "re", "ve", "y", "ain", "aren", "aren't", "couldn", "couldn't", "didn",
    "didn't", "doesn", "doesn't", "hadn", "hadn't", "hasn", "hasn't", "haven", "haven't", "isn",
    "isn't", "ma", "mightn", "mightn't", "mustn", "mustn't", "needn", "needn't", "shan", "shan't",
    "shouldn", "shouldn't", "wasn", "wasn't", "weren", "weren't", "won", "won't", "wouldn",
    "wouldn't",
];

lazy_static! {
    static ref STOPWORDS: HashSet<&'static str> = ENGLISH_STOPWORDS.iter().copied().collect();
    static ref QUESTION_TOKEN: Regex =
        Regex::new(r"\d+\.\d+|\w+(?:'\w+)?|[^\w\s]").expect("static regex");
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}

pub fn is_punctuation(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| !c.is_alphanumeric() && !c.is_whitespace())
}

/// Lowercase word tokens; punctuation becomes its own token.
pub fn tokenize_question(question: &str) -> Vec<String> {
    QUESTION_TOKEN
        .find_iter(question)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Split a schema name into lowercase words on `_`, spaces and camelCase boundaries.
pub fn tokenize_identifier(name: &str) -> Vec<String> {
    if name == "*" {
        return vec!["*".to_string()];
    }
    let mut words = Vec::new();
    for part in name.split(|c: char| !c.is_alphanumeric()) {
        if part.is_empty() {
            continue;
        }
        let chars: Vec<char> = part.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            let boundary = i > 0 && c.is_uppercase() && {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());
                prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower)
            };
            if boundary && !current.is_empty() {
                words.push(std::mem::take(&mut current).to_lowercase());
            }
            current.push(c);
        }
        if !current.is_empty() {
            words.push(current.to_lowercase());
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_question() {
        assert_eq!(
            tokenize_question("Show me the top 10 customers, please?"),
            vec!["show", "me", "the", "top", "10", "customers", ",", "please", "?"]
        );
        assert_eq!(tokenize_question("price above 3.5"), vec!["price", "above", "3.5"]);
    }

    #[test]
    fn test_tokenize_identifier() {
        assert_eq!(tokenize_identifier("customer_id"), vec!["customer", "id"]);
        assert_eq!(tokenize_identifier("CustomerID"), vec!["customer", "id"]);
        assert_eq!(tokenize_identifier("IDNumber"), vec!["id", "number"]);
        assert_eq!(tokenize_identifier("first name"), vec!["first", "name"]);
        assert_eq!(tokenize_identifier("*"), vec!["*"]);
    }

    #[test]
    fn test_stopwords_and_punctuation() {
        assert!(is_stopword("the"));
        assert!(!is_stopword("customers"));
        assert!(is_punctuation("?"));
        assert!(is_punctuation("'s") == false);
    }
}
