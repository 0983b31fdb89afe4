use std::collections::{HashMap, HashSet};

use schema::{is_stopword, tokenize};

/// Term-frequency counts for `text`, keyed by normalized token.
pub fn term_frequencies(text: &str) -> HashMap<String, u64> {
    let mut tf: HashMap<String, u64> = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0) += 1;
    }
    tf
}

/// Cosine similarity between two term-frequency vectors.
///
/// Norms are multiplied before the square root so that identical vectors
/// score exactly `1.0` (the product is a perfect square).
pub fn cosine_similarity(a: &HashMap<String, u64>, b: &HashMap<String, u64>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: u64 = small
        .iter()
        .filter_map(|(term, count)| large.get(term).map(|other| count * other))
        .sum();
    if dot == 0 {
        return 0.0;
    }
    let norm_a: u64 = a.values().map(|v| v * v).sum();
    let norm_b: u64 = b.values().map(|v| v * v).sum();
    let denom = ((norm_a as f64) * (norm_b as f64)).sqrt();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (dot as f64 / denom).clamp(0.0, 1.0)
}

/// Bag-of-words cosine similarity in `[0, 1]`. Zero when either side has no
/// tokens or the vocabularies are disjoint.
pub fn similarity(a: &str, b: &str) -> f64 {
    cosine_similarity(&term_frequencies(a), &term_frequencies(b))
}

/// Whether `value` is usable as a similarity threshold: a finite number in
/// `[0, 1]`.
pub fn is_similarity_threshold(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

/// Distinct non-stopword tokens of `text`.
pub fn content_vocabulary(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|token| !is_stopword(token))
        .collect()
}

/// Shared vocabulary as a fraction of the smaller side's vocabulary.
pub fn vocabulary_overlap(a: &str, b: &str) -> f64 {
    let vocab_a = content_vocabulary(a);
    let vocab_b = content_vocabulary(b);
    let smaller = vocab_a.len().min(vocab_b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = vocab_a.intersection(&vocab_b).count();
    shared as f64 / smaller as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_texts_score_exactly_one() {
        for text in [
            "price sweeps prior day low",
            "IF price sweeps equal lows THEN expect reversal reversal reversal",
            "a a a b",
            "Displacement",
        ] {
            assert_eq!(similarity(text, text), 1.0, "{text}");
        }
    }

    #[test]
    fn disjoint_vocabularies_score_zero() {
        assert_eq!(similarity("bullish displacement", "weekly range"), 0.0);
    }

    #[test]
    fn empty_input_scores_zero() {
        assert_eq!(similarity("", "price"), 0.0);
        assert_eq!(similarity("price", "  ,, "), 0.0);
    }

    #[test]
    fn similarity_is_case_and_punctuation_insensitive() {
        assert_eq!(similarity("Price, sweeps LOWS.", "price sweeps lows"), 1.0);
    }

    #[test]
    fn paraphrase_pair_scores_partial_overlap() {
        let sim = similarity(
            "IF price sweeps equal lows THEN expect reversal",
            "IF price sweeps equal lows THEN look for reversal",
        );
        assert!(sim > 0.8 && sim < 0.85, "sim was {sim}");
    }

    #[test]
    fn term_frequency_weights_repeated_terms() {
        let strong = similarity("gap gap fill", "gap gap");
        let weak = similarity("gap fill fill", "gap gap");
        assert!(strong > weak);
    }

    #[test]
    fn similarity_thresholds_span_the_closed_unit_interval() {
        assert!(is_similarity_threshold(0.0));
        assert!(is_similarity_threshold(0.85));
        assert!(is_similarity_threshold(1.0));
        assert!(!is_similarity_threshold(1.01));
        assert!(!is_similarity_threshold(-0.1));
        assert!(!is_similarity_threshold(f64::NAN));
    }

    #[test]
    fn vocabulary_overlap_uses_smaller_side() {
        let overlap = vocabulary_overlap("IF price breaks the high", "THEN price breaks high again");
        assert_eq!(overlap, 1.0);
        assert_eq!(vocabulary_overlap("", "price"), 0.0);
    }
}
