mod common;

use common::{mixed_corpus, CountingEmbedder};
use nl2sql_retrieval::corpus::{TrainingCorpus, TrainingExample};
use nl2sql_retrieval::embedding::cache_file::{read_matrix, write_matrix};
use nl2sql_retrieval::embedding::{CorpusKey, Embedder, EmbeddingStore, HashingEmbedder};
use nl2sql_retrieval::linking::tokenize::tokenize_question;
use nl2sql_retrieval::linking::LinkedQuestion;
use nl2sql_retrieval::masking::QuestionMasker;
use nl2sql_retrieval::selector::{SelectionTarget, SelectorFactory, SelectorKind, SkeletonField};
use nl2sql_retrieval::skeleton::{jaccard_similarity, to_skeleton};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

fn all_kinds() -> Vec<SelectorKind> {
    vec![
        SelectorKind::Random { seed: 7 },
        SelectorKind::CosineSimilarity,
        SelectorKind::EuclideanDistance,
        SelectorKind::EuclideanDistanceThreshold { threshold: 0.85 },
        SelectorKind::EuclideanDistanceQuestionMask,
        SelectorKind::default_stage_b(),
        SelectorKind::SkeletonSimilarityPlus {
            question: CorpusKey::Raw,
            skeleton: SkeletonField::QuerySkeleton,
        },
        SelectorKind::SkeletonSimilarityShift { threshold: 0.85 },
    ]
}

/// Kinds without a cutoff always return `min(k, eligible)` examples.
fn unbounded_kinds() -> Vec<SelectorKind> {
    all_kinds()
        .into_iter()
        .filter(|k| {
            !matches!(
                k,
                SelectorKind::EuclideanDistanceThreshold { .. }
                    | SelectorKind::SkeletonSimilarityShift { .. }
            )
        })
        .collect()
}

fn factory(corpus: TrainingCorpus, embedder: Arc<dyn Embedder>, cache_dir: &Path) -> SelectorFactory {
    let store = Arc::new(EmbeddingStore::new(embedder, cache_dir));
    SelectorFactory::new(Arc::new(corpus), store, QuestionMasker::default())
}

fn target(db_id: &str, question: &str, sql: &str) -> SelectionTarget {
    let linked = LinkedQuestion {
        tokens: tokenize_question(question),
        ..Default::default()
    };
    let skeleton = to_skeleton(sql, None);
    SelectionTarget::new(db_id, question, linked)
        .with_pre_skeleton(skeleton.clone())
        .with_query_skeleton(skeleton)
}

#[tokio::test]
async fn test_empty_corpus_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());
    let factory = factory(TrainingCorpus::default(), embedder.clone(), dir.path());
    let bare = SelectionTarget::new("vpbank", "Show me all customers", LinkedQuestion::default());

    for kind in all_kinds() {
        let selector = factory.build_selector(&kind);
        let examples = selector.get_examples(&bare, 5, false).await.unwrap();
        assert!(examples.is_empty(), "{} returned examples", selector.name());
    }
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_cardinality_and_distinct_results() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(mixed_corpus(), Arc::new(HashingEmbedder::default()), dir.path());
    let target = target("vpbank", "Show every customer email", "SELECT email FROM customers");
    let corpus_size = factory.context().corpus().len();

    for kind in unbounded_kinds() {
        let selector = factory.build_selector(&kind);
        for k in [0, 3, 10] {
            let examples = selector.get_examples(&target, k, false).await.unwrap();
            assert_eq!(examples.len(), k.min(corpus_size), "{} with k={}", selector.name(), k);
            let indexes: HashSet<usize> = examples.iter().map(|e| e.index).collect();
            assert_eq!(indexes.len(), examples.len());
        }
    }
}

#[tokio::test]
async fn test_cross_domain_excludes_target_database() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(mixed_corpus(), Arc::new(HashingEmbedder::default()), dir.path());
    let target = target("shop", "Show all orders", "SELECT * FROM orders");

    for kind in all_kinds() {
        let selector = factory.build_selector(&kind);
        let examples = selector.get_examples(&target, 10, true).await.unwrap();
        assert!(
            examples.iter().all(|e| e.example.db_id != "shop"),
            "{} leaked a same-database example",
            selector.name()
        );
    }

    let random = factory.build_selector(&SelectorKind::Random { seed: 1 });
    assert_eq!(random.get_examples(&target, 10, true).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_cosine_skips_the_identical_question() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(mixed_corpus(), Arc::new(HashingEmbedder::default()), dir.path());
    let target = target("vpbank", "List all customers", "SELECT * FROM customers");

    let selector = factory.build_selector(&SelectorKind::CosineSimilarity);
    let examples = selector.get_examples(&target, 10, false).await.unwrap();
    assert_eq!(examples.len(), 5);
    assert!(examples.iter().all(|e| e.example.question != "List all customers"));
    assert!(examples.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_strict_skeleton_gate() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(mixed_corpus(), Arc::new(HashingEmbedder::default()), dir.path());
    let target = target(
        "music",
        "Which singers are older than 25",
        "SELECT name FROM singer WHERE age > 25",
    );
    let target_skeleton = target.pre_skeleton.clone().unwrap();

    let selector = factory.build_selector(&SelectorKind::SkeletonSimilarityShift { threshold: 0.85 });
    let examples = selector.get_examples(&target, 6, false).await.unwrap();

    assert!(!examples.is_empty());
    assert!(examples.len() < 6);
    for selected in &examples {
        assert!(jaccard_similarity(&selected.example.pre_skeleton, &target_skeleton) >= 0.85);
    }

    let relaxed = factory.build_selector(&SelectorKind::default_stage_b());
    assert_eq!(relaxed.get_examples(&target, 6, false).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_skeleton_field_is_read_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let mut plain = TrainingExample::new("a", "names in t", "SELECT name FROM t");
    plain.pre_skeleton = "select _ from _ where _ = _".to_string();
    let mut filtered = TrainingExample::new("a", "name of row one", "SELECT name FROM t WHERE id = 1");
    filtered.pre_skeleton = "select _ from _".to_string();
    let corpus = TrainingCorpus::from_examples(vec![plain, filtered]);
    let factory = factory(corpus, Arc::new(HashingEmbedder::default()), dir.path());
    let target = target("a", "list names in t", "SELECT name FROM t");

    let by_pre = factory.build_selector(&SelectorKind::SkeletonSimilarityShift { threshold: 0.85 });
    let picked: Vec<usize> = by_pre
        .get_examples(&target, 2, false)
        .await
        .unwrap()
        .iter()
        .map(|s| s.index)
        .collect();
    assert_eq!(picked, vec![1]);

    let by_query = factory.build_selector(&SelectorKind::SkeletonSimilarityThreshold {
        question: CorpusKey::Raw,
        skeleton: SkeletonField::QuerySkeleton,
        threshold: 0.85,
    });
    let picked: Vec<usize> = by_query
        .get_examples(&target, 1, false)
        .await
        .unwrap()
        .iter()
        .map(|s| s.index)
        .collect();
    assert_eq!(picked, vec![0]);
}

#[tokio::test]
async fn test_short_cache_file_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = TrainingCorpus::from_examples(vec![
        TrainingExample::new("a", "first question", "SELECT 1"),
        TrainingExample::new("a", "second question", "SELECT 2"),
        TrainingExample::new("b", "third question", "SELECT 3"),
    ]);
    let questions = corpus.raw_questions();

    let embedder = Arc::new(CountingEmbedder::default());
    let store = Arc::new(EmbeddingStore::new(embedder.clone(), dir.path()));
    let path = store.corpus_cache_path(CorpusKey::Raw, &questions);
    let stale = HashingEmbedder::default()
        .embed(&questions[..2].to_vec())
        .await
        .unwrap();
    write_matrix(&path, &stale).unwrap();

    let factory = SelectorFactory::new(Arc::new(corpus), store, QuestionMasker::default());
    let selector = factory.build_selector(&SelectorKind::EuclideanDistance);
    let target = target("a", "a fourth question", "SELECT 4");
    let examples = selector.get_examples(&target, 3, false).await.unwrap();

    assert_eq!(examples.len(), 3);
    assert_eq!(embedder.batches(), vec![3, 1]);
    assert_eq!(read_matrix(&path).unwrap().len(), 3);

    // A fresh store trusts the rewritten file and only embeds the target.
    let embedder = Arc::new(CountingEmbedder::default());
    let store = Arc::new(EmbeddingStore::new(embedder.clone(), dir.path()));
    let factory = SelectorFactory::new(factory.context().corpus().clone().into(), store, QuestionMasker::default());
    let selector = factory.build_selector(&SelectorKind::EuclideanDistance);
    selector.get_examples(&target, 3, false).await.unwrap();
    assert_eq!(embedder.batches(), vec![1]);
}
