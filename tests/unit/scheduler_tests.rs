/*!
 * Tests for batch packing over realistic inputs
 */

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use corpus_translator::database::Sentence;
use corpus_translator::translation::ChunkScheduler;
use corpus_translator::translation::scheduler::text_size;

/// Sentences over several books and paragraphs with random lengths
fn random_corpus(seed: u64, books: usize, per_book: usize) -> Vec<Sentence> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sentences = Vec::new();
    for book in 0..books {
        for i in 0..per_book {
            let len = rng.random_range(1..400);
            let para = (i / 7) as i64 + 1;
            sentences.push(Sentence::new(format!("book{:02}", book), para, i as i64 + 1, "ā".repeat(len)));
        }
    }
    sentences
}

#[test]
fn test_schedule_randomCorpus_shouldCoverEverySentenceOnceInOrder() {
    let corpus = random_corpus(7, 4, 60);
    let batches = ChunkScheduler::new(900).schedule(&corpus);

    let flattened: Vec<(String, i64)> = batches
        .iter()
        .flat_map(|b| b.lines.iter().map(move |l| (b.book_id.clone(), l.line.line_id)))
        .collect();
    let expected: Vec<(String, i64)> = corpus.iter().map(|s| (s.book_id.clone(), s.line.line_id)).collect();

    assert_eq!(flattened, expected);
}

#[test]
fn test_schedule_randomCorpus_shouldRespectBoundUnlessSingleton() {
    let max = 500;
    let corpus = random_corpus(42, 3, 80);
    let batches = ChunkScheduler::new(max).schedule(&corpus);

    for batch in &batches {
        assert!(!batch.is_empty());
        assert!(batch.total_size <= max || batch.len() == 1, "batch {} holds {} chars", batch.batch_id, batch.total_size);
        let summed: usize = batch.lines.iter().map(|l| text_size(&l.source_text)).sum();
        assert_eq!(summed, batch.total_size);
    }
}

#[test]
fn test_schedule_randomCorpus_shouldNeverMixBooks() {
    let corpus = random_corpus(3, 5, 20);
    let batches = ChunkScheduler::new(2_000).schedule(&corpus);

    for batch in &batches {
        let book = &batch.book_id;
        assert!(batch.lines.iter().all(|l| corpus.iter().any(|s| &s.book_id == book && s.line == l.line)));
    }
    let books: std::collections::BTreeSet<&str> = batches.iter().map(|b| b.book_id.as_str()).collect();
    assert_eq!(books.len(), 5);
}

#[test]
fn test_schedule_greedy_shouldNotCloseBatchThatCouldTakeNext() {
    let corpus = random_corpus(11, 1, 100);
    let max = 700;
    let batches = ChunkScheduler::new(max).schedule(&corpus);

    for pair in batches.windows(2) {
        let next = text_size(&pair[1].lines[0].source_text);
        assert!(pair[0].total_size + next > max, "batch {} closed early", pair[0].batch_id);
    }
}

#[test]
fn test_schedule_batchIds_shouldBeSequentialFromOne() {
    let batches = ChunkScheduler::new(300).schedule(&random_corpus(5, 2, 30));
    let ids: Vec<usize> = batches.iter().map(|b| b.batch_id).collect();
    assert_eq!(ids, (1..=batches.len()).collect::<Vec<_>>());
}
