use std::collections::{BTreeMap, HashMap};

use schema::{Category, ClaimRecord, is_stopword, tokenize};

const TOPIC_TERMS: usize = 3;
const GENERAL_TOPIC: &str = "GENERAL";

/// Files claims into the fixed taxonomy. Every category is present in the
/// result, possibly empty; members keep their input order.
pub fn categorize(claims: &[ClaimRecord]) -> BTreeMap<Category, Vec<usize>> {
    let mut out: BTreeMap<Category, Vec<usize>> =
        Category::ALL.into_iter().map(|category| (category, Vec::new())).collect();
    for (idx, record) in claims.iter().enumerate() {
        let category = match record.claim.category_tag.as_deref() {
            None => Category::DEFAULT,
            Some(tag) => Category::from_tag(tag).unwrap_or_else(|| {
                tracing::warn!(
                    claim_id = %record.claim.claim_id,
                    tag,
                    "unknown category tag; filing under default"
                );
                Category::DEFAULT
            }),
        };
        out.entry(category).or_default().push(idx);
    }
    out
}

/// Single-pass greedy clustering over `0..len` in order. Each item joins the
/// cluster holding its most similar earlier member when that similarity is
/// at least `threshold`, otherwise it opens a new cluster. Ties go to the
/// cluster created first.
pub fn greedy_cluster<F>(len: usize, threshold: f64, similarity: F) -> Vec<Vec<usize>>
where
    F: Fn(usize, usize) -> f64,
{
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for item in 0..len {
        let mut best: Option<(usize, f64)> = None;
        for (cluster_idx, members) in clusters.iter().enumerate() {
            for &member in members {
                let sim = similarity(item, member);
                if best.is_none_or(|(_, best_sim)| sim > best_sim) {
                    best = Some((cluster_idx, sim));
                }
            }
        }
        match best {
            Some((cluster_idx, sim)) if sim >= threshold => clusters[cluster_idx].push(item),
            _ => clusters.push(vec![item]),
        }
    }
    clusters
}

/// Every pair `(i, j)` with `i < j` whose similarity is at least `threshold`.
pub fn redundant_pairs<F>(len: usize, threshold: f64, similarity: F) -> Vec<(usize, usize, f64)>
where
    F: Fn(usize, usize) -> f64,
{
    let mut out = Vec::new();
    for i in 0..len {
        for j in (i + 1)..len {
            let sim = similarity(i, j);
            if sim >= threshold {
                out.push((i, j, sim));
            }
        }
    }
    out
}

/// Up to three most frequent non-stopword terms across `conditions`,
/// uppercased and joined with `_`. Equal counts keep first-appearance order.
pub fn topic_label<'a, I>(conditions: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut position = 0usize;
    for condition in conditions {
        for token in tokenize(condition) {
            if is_stopword(&token) {
                continue;
            }
            let entry = counts.entry(token).or_insert((0, position));
            entry.0 += 1;
            position += 1;
        }
    }
    if counts.is_empty() {
        return GENERAL_TOPIC.to_string();
    }
    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(term, (count, first_seen))| (term, count, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(TOPIC_TERMS)
        .map(|(term, _, _)| term.to_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}
