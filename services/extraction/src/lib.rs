mod feedback;
mod model;
mod pattern;
mod pipeline;

use std::sync::Arc;

use schema::{Claim, ModelClient, ModelError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use feedback::{AvoidanceEntry, AvoidanceList, DEFAULT_FEEDBACK_WINDOW, FeedbackInjector};
pub use model::{ModelExtractor, ModelExtractorConfig, build_system_prompt};
pub use pattern::{PatternExtractor, needs_windowed_extraction};
pub use pipeline::{
    ConfigError, Pipeline, PipelineConfig, PipelineError, PipelineOutcome, RejectedInput,
};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("invalid extraction pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("model extraction failed: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    /// Offset of the segment into the source, in seconds.
    #[serde(default)]
    pub start: f64,
}

impl TranscriptSegment {
    pub fn new(text: &str, start: f64) -> Self {
        Self {
            text: text.to_string(),
            start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub title: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

/// One dispatch to an extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub batch_id: String,
    pub source: SourceDocument,
    pub avoid: AvoidanceList,
}

/// Proposes candidate claims from source material.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, request: &ExtractionRequest) -> Result<Vec<Claim>, ExtractionError>;
}

/// Which extractor a pipeline is built with. Chosen once, at construction.
#[derive(Clone)]
pub enum ExtractorKind {
    PatternBased,
    ModelBacked(Arc<dyn ModelClient>),
}

impl ExtractorKind {
    pub fn build(self, avoid_similarity: f64) -> Result<Box<dyn Extractor>, ExtractionError> {
        Ok(match self {
            ExtractorKind::PatternBased => {
                Box::new(PatternExtractor::new()?.with_avoid_similarity(avoid_similarity))
            }
            ExtractorKind::ModelBacked(client) => Box::new(ModelExtractor::new(
                client,
                ModelExtractorConfig::default(),
            )),
        })
    }
}

/// `M:SS` offset used as a claim's provenance timestamp.
pub fn format_offset(seconds: f64) -> String {
    let whole = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!("{}:{:02}", whole / 60, whole % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_render_as_minutes_and_seconds() {
        assert_eq!(format_offset(0.0), "0:00");
        assert_eq!(format_offset(65.9), "1:05");
        assert_eq!(format_offset(3_725.0), "62:05");
        assert_eq!(format_offset(-3.0), "0:00");
    }

    #[test]
    fn source_documents_parse_from_transcript_json() {
        let raw = r#"{"title": "Lecture 4", "segments": [{"text": "if price sweeps lows, look for longs", "start": 12.5}]}"#;
        let doc: SourceDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.segments.len(), 1);
        assert_eq!(doc.segments[0].start, 12.5);
    }

    #[test]
    fn extractor_kind_selects_implementation_once() {
        let extractor = ExtractorKind::PatternBased.build(0.85).unwrap();
        assert_eq!(extractor.name(), "pattern");
    }
}
