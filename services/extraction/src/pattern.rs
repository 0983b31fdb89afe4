use regex::Regex;
use schema::Claim;

use crate::{ExtractionError, ExtractionRequest, Extractor, TranscriptSegment, format_offset};

/// `if/when X, Y`, `if X then Y`, and `X is your Y` statements.
const STATEMENT_PATTERNS: [&str; 2] = [
    r"(?i)\b(?:if|when)\s+(.+?)(?:,\s*|\s+then\s+)(.+?)(?:\.|$)",
    r"(?i)(.+?)\s+(?:is your|that'?s your)\s+(.+?)(?:\.|$)",
];

const WINDOW_SIZES: [usize; 3] = [3, 5, 7];
const MIN_PHRASE_LEN: usize = 15;
const WINDOWED_MIN_SEGMENTS: usize = 20;
const WINDOWED_SAMPLE: usize = 50;
const WINDOWED_MAX_AVG_CHARS: f64 = 60.0;
const DEDUP_KEY_CHARS: usize = 80;
const DEFAULT_AVOID_SIMILARITY: f64 = 0.85;

/// Auto-caption transcripts split statements across many short segments;
/// those are read through sliding windows instead of one segment at a time.
pub fn needs_windowed_extraction(segments: &[TranscriptSegment]) -> bool {
    if segments.len() < WINDOWED_MIN_SEGMENTS {
        return false;
    }
    let sample = &segments[..segments.len().min(WINDOWED_SAMPLE)];
    let total: usize = sample.iter().map(|segment| segment.text.chars().count()).sum();
    (total as f64 / sample.len() as f64) < WINDOWED_MAX_AVG_CHARS
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    timestamp: String,
    condition: String,
    action: String,
}

/// Deterministic extractor driven by statement regexes.
pub struct PatternExtractor {
    patterns: Vec<Regex>,
    avoid_similarity: f64,
}

impl PatternExtractor {
    pub fn new() -> Result<Self, ExtractionError> {
        let patterns = STATEMENT_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            avoid_similarity: DEFAULT_AVOID_SIMILARITY,
        })
    }

    pub fn with_avoid_similarity(mut self, threshold: f64) -> Self {
        self.avoid_similarity = threshold;
        self
    }

    fn statements<'t>(&self, text: &'t str) -> Vec<(&'t str, &'t str)> {
        let mut out = Vec::new();
        for pattern in &self.patterns {
            for captures in pattern.captures_iter(text) {
                let (Some(condition), Some(action)) = (captures.get(1), captures.get(2)) else {
                    continue;
                };
                let condition = condition.as_str().trim();
                let action = action.as_str().trim();
                if !condition.is_empty() && !action.is_empty() {
                    out.push((condition, action));
                }
            }
        }
        out
    }

    fn per_segment(&self, segments: &[TranscriptSegment]) -> Vec<Candidate> {
        let mut out = Vec::new();
        for segment in segments {
            let timestamp = format_offset(segment.start);
            for (condition, action) in self.statements(&segment.text) {
                out.push(Candidate {
                    timestamp: timestamp.clone(),
                    condition: condition.to_string(),
                    action: action.to_string(),
                });
            }
        }
        out
    }

    fn windowed(&self, segments: &[TranscriptSegment]) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for size in WINDOW_SIZES {
            if segments.len() < size {
                continue;
            }
            for window in segments.windows(size) {
                let text = window
                    .iter()
                    .map(|segment| segment.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let timestamp = format_offset(window[0].start);
                for (condition, action) in self.statements(&text) {
                    if condition.chars().count() < MIN_PHRASE_LEN
                        || action.chars().count() < MIN_PHRASE_LEN
                    {
                        continue;
                    }
                    let key = dedup_key(condition);
                    // Same condition seen through another window: keep the
                    // fullest action.
                    if let Some(idx) = seen.iter().position(|existing| *existing == key) {
                        if action.chars().count() > out[idx].action.chars().count() {
                            out[idx] = Candidate {
                                timestamp: timestamp.clone(),
                                condition: condition.to_string(),
                                action: action.to_string(),
                            };
                        }
                        continue;
                    }
                    seen.push(key);
                    out.push(Candidate {
                        timestamp: timestamp.clone(),
                        condition: condition.to_string(),
                        action: action.to_string(),
                    });
                }
            }
        }
        out
    }
}

fn dedup_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(DEDUP_KEY_CHARS)
        .collect()
}

impl Extractor for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn extract(&self, request: &ExtractionRequest) -> Result<Vec<Claim>, ExtractionError> {
        let segments = &request.source.segments;
        let windowed = needs_windowed_extraction(segments);
        let candidates = if windowed {
            self.windowed(segments)
        } else {
            self.per_segment(segments)
        };

        let mut claims = Vec::new();
        for candidate in candidates {
            let condition = format!("IF {}", candidate.condition);
            let action = format!("THEN {}", candidate.action);
            if let Some(entry) = request
                .avoid
                .matching(&condition, &action, self.avoid_similarity)
            {
                tracing::info!(avoided = %entry.id, condition = %condition, "skipping candidate matching a rejected pattern");
                continue;
            }
            let claim_id = format!("S-{:03}", claims.len() + 1);
            claims.push(
                Claim::new(&claim_id, &condition, &action)
                    .with_provenance(&candidate.timestamp, &request.source.title),
            );
        }
        tracing::info!(
            batch_id = %request.batch_id,
            source = %request.source.title,
            segments = segments.len(),
            windowed,
            claims = claims.len(),
            "pattern extraction finished"
        );
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AvoidanceEntry, AvoidanceList, SourceDocument};

    fn request(segments: Vec<TranscriptSegment>, avoid: AvoidanceList) -> ExtractionRequest {
        ExtractionRequest {
            batch_id: "batch-7".into(),
            source: SourceDocument {
                title: "Lecture 4".into(),
                segments,
            },
            avoid,
        }
    }

    fn filler(count: usize, offset: usize) -> Vec<TranscriptSegment> {
        (0..count)
            .map(|idx| TranscriptSegment::new("so we wait here", ((offset + idx) * 3) as f64))
            .collect()
    }

    #[test]
    fn windowed_mode_needs_many_short_segments() {
        assert!(!needs_windowed_extraction(&filler(19, 0)));
        assert!(needs_windowed_extraction(&filler(20, 0)));
        let long: Vec<TranscriptSegment> = (0..25)
            .map(|idx| TranscriptSegment::new(&"x".repeat(70), idx as f64))
            .collect();
        assert!(!needs_windowed_extraction(&long));
    }

    #[test]
    fn extracts_if_then_and_signal_statements_per_segment() {
        let extractor = PatternExtractor::new().unwrap();
        let claims = extractor
            .extract(&request(
                vec![
                    TranscriptSegment::new(
                        "If price sweeps the prior day low, expect a bullish displacement.",
                        74.0,
                    ),
                    TranscriptSegment::new("The fair value gap is your entry.", 130.0),
                    TranscriptSegment::new("Good morning everyone.", 140.0),
                ],
                AvoidanceList::default(),
            ))
            .unwrap();

        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].claim_id, "S-001");
        assert_eq!(claims[0].condition, "IF price sweeps the prior day low");
        assert_eq!(claims[0].action, "THEN expect a bullish displacement");
        assert_eq!(claims[0].provenance_timestamp.as_deref(), Some("1:14"));
        assert_eq!(claims[0].provenance_source.as_deref(), Some("Lecture 4"));
        assert_eq!(claims[1].condition, "IF The fair value gap");
        assert_eq!(claims[1].action, "THEN entry");
    }

    #[test]
    fn windowed_extraction_joins_segments_and_keeps_fullest_action() {
        let mut segments = filler(5, 0);
        segments.push(TranscriptSegment::new("if price runs the buy stops above", 15.0));
        segments.push(TranscriptSegment::new("the old high, we look for a short", 18.0));
        segments.push(TranscriptSegment::new("entry at the order block.", 21.0));
        segments.extend(filler(16, 8));

        let extractor = PatternExtractor::new().unwrap();
        let claims = extractor
            .extract(&request(segments, AvoidanceList::default()))
            .unwrap();

        assert_eq!(claims.len(), 1);
        assert_eq!(
            claims[0].condition,
            "IF price runs the buy stops above the old high"
        );
        assert_eq!(
            claims[0].action,
            "THEN we look for a short entry at the order block"
        );
        assert_eq!(claims[0].provenance_timestamp.as_deref(), Some("0:15"));
    }

    #[test]
    fn avoided_patterns_are_skipped() {
        let avoid = AvoidanceList {
            entries: vec![AvoidanceEntry {
                id: "N-1".into(),
                reason: "Unfalsifiable claim".into(),
                pattern: Some("IF price always reverses at midnight THEN enter short".into()),
            }],
        };
        let extractor = PatternExtractor::new().unwrap();
        let claims = extractor
            .extract(&request(
                vec![
                    TranscriptSegment::new("If price always reverses at midnight, enter short.", 5.0),
                    TranscriptSegment::new("When the weekly candle closes bearish, look for shorts.", 9.0),
                ],
                avoid,
            ))
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].claim_id, "S-001");
        assert!(claims[0].condition.contains("weekly candle"));
    }
}
