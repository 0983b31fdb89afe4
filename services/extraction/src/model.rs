use std::{collections::HashSet, sync::Arc};

use schema::{Claim, ModelClient, ModelError, ModelRequest, strip_code_fence};
use serde::Deserialize;

use crate::{AvoidanceList, ExtractionError, ExtractionRequest, Extractor, format_offset};

const SYSTEM_PROMPT_TEMPLATE: &str = "You extract explicit if-then statements from source material.

RULES:
- Extract only explicit if-then logic stated in the segment.
- Every statement must carry the approximate timestamp of the segment it came from.
- No interpretation and no inference.
- Skip vague, motivational, or promotional content.
- If the same logic appears twice, keep the first occurrence only.

CATEGORIES (field \"drawer\"):
1 HTF_BIAS: higher timeframe directional context
2 MARKET_STRUCTURE: structural breaks and formations
3 PREMIUM_DISCOUNT: price relative to its dealing range
4 ENTRY_MODEL: specific entry patterns
5 CONFIRMATION: additional validation

OUTPUT: a JSON array only, each element shaped like
{\"if\": \"...\", \"then\": \"...\", \"timestamp\": \"M:SS\", \"drawer\": 4}
Return [] when the segment has no if-then logic.

AVOID PATTERNS SIMILAR TO THESE REJECTED CLAIMS:
{avoid}
";

pub fn build_system_prompt(avoid: &AvoidanceList) -> String {
    SYSTEM_PROMPT_TEMPLATE.replace("{avoid}", &avoid.render())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelExtractorConfig {
    pub role: String,
    pub temperature: f32,
    /// Segments are grouped into chunks of at most this many characters.
    pub max_chunk_chars: usize,
}

impl Default for ModelExtractorConfig {
    fn default() -> Self {
        Self {
            role: "extractor".to_string(),
            temperature: 0.2,
            max_chunk_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Chunk {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ProposedStatement {
    #[serde(rename = "if", default)]
    condition: String,
    #[serde(rename = "then", default)]
    action: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    drawer: Option<serde_json::Value>,
}

/// Extractor that delegates to a hosted model through [`ModelClient`].
pub struct ModelExtractor {
    client: Arc<dyn ModelClient>,
    config: ModelExtractorConfig,
}

impl ModelExtractor {
    pub fn new(client: Arc<dyn ModelClient>, config: ModelExtractorConfig) -> Self {
        Self { client, config }
    }

    fn chunks(&self, request: &ExtractionRequest) -> Vec<Chunk> {
        let mut out: Vec<Chunk> = Vec::new();
        for segment in &request.source.segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            match out.last_mut() {
                Some(chunk) if chunk.text.len() + text.len() < self.config.max_chunk_chars => {
                    chunk.text.push(' ');
                    chunk.text.push_str(text);
                    chunk.end = segment.start;
                }
                _ => out.push(Chunk {
                    start: segment.start,
                    end: segment.start,
                    text: text.to_string(),
                }),
            }
        }
        out
    }
}

fn parse_statements(content: &str) -> Result<Vec<ProposedStatement>, ModelError> {
    let value: serde_json::Value = serde_json::from_str(strip_code_fence(content))
        .map_err(|err| ModelError::MalformedResponse(err.to_string()))?;
    let serde_json::Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn drawer_tag(drawer: &serde_json::Value) -> Option<String> {
    match drawer {
        serde_json::Value::Number(number) => Some(number.to_string()),
        serde_json::Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        _ => None,
    }
}

impl Extractor for ModelExtractor {
    fn name(&self) -> &'static str {
        "model"
    }

    fn extract(&self, request: &ExtractionRequest) -> Result<Vec<Claim>, ExtractionError> {
        let system_prompt = build_system_prompt(&request.avoid);
        let chunks = self.chunks(request);
        let mut seen: HashSet<String> = HashSet::new();
        let mut claims = Vec::new();

        for (idx, chunk) in chunks.iter().enumerate() {
            let model_request = ModelRequest {
                role: self.config.role.clone(),
                system_prompt: system_prompt.clone(),
                user_content: format!(
                    "TRANSCRIPT SEGMENT [{:.0}s - {:.0}s]:\n\n{}\n\nExtract all if-then logic from this segment. Return a JSON array only.",
                    chunk.start, chunk.end, chunk.text
                ),
                temperature: self.config.temperature,
            };
            let statements = match self
                .client
                .complete(&model_request)
                .and_then(|content| parse_statements(&content))
            {
                Ok(statements) => statements,
                Err(err) => {
                    tracing::warn!(
                        batch_id = %request.batch_id,
                        chunk = idx + 1,
                        error = %err,
                        "skipping chunk after model failure"
                    );
                    continue;
                }
            };

            for statement in statements {
                let key = format!(
                    "{}|{}",
                    statement.condition.trim().to_lowercase(),
                    statement.action.trim().to_lowercase()
                );
                if !seen.insert(key) {
                    continue;
                }
                let claim_id = format!("S-{:03}", claims.len() + 1);
                let timestamp = statement
                    .timestamp
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or_else(|| format_offset(chunk.start));
                let mut claim = Claim::new(
                    &claim_id,
                    &format!("IF {}", statement.condition.trim()),
                    &format!("THEN {}", statement.action.trim()),
                )
                .with_provenance(&timestamp, &request.source.title);
                claim.category_tag = statement.drawer.as_ref().and_then(drawer_tag);
                claims.push(claim);
            }
        }

        tracing::info!(
            batch_id = %request.batch_id,
            chunks = chunks.len(),
            claims = claims.len(),
            "model extraction finished"
        );
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AvoidanceEntry, SourceDocument, TranscriptSegment};
    use std::sync::Mutex;

    struct ScriptedClient {
        replies: Mutex<Vec<Result<String, ModelError>>>,
        prompts: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<String, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    impl ModelClient for ScriptedClient {
        fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(request.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok("[]".into());
            }
            replies.remove(0)
        }
    }

    fn request(segments: Vec<TranscriptSegment>, avoid: AvoidanceList) -> ExtractionRequest {
        ExtractionRequest {
            batch_id: "batch-9".into(),
            source: SourceDocument {
                title: "Lecture 9".into(),
                segments,
            },
            avoid,
        }
    }

    fn small_chunks() -> ModelExtractorConfig {
        ModelExtractorConfig {
            max_chunk_chars: 20,
            ..ModelExtractorConfig::default()
        }
    }

    #[test]
    fn system_prompt_carries_avoidance_list() {
        assert!(build_system_prompt(&AvoidanceList::default()).ends_with("None yet.\n"));
        let avoid = AvoidanceList {
            entries: vec![AvoidanceEntry {
                id: "N-abc".into(),
                reason: "Unfalsifiable claim".into(),
                pattern: None,
            }],
        };
        assert!(build_system_prompt(&avoid).contains("- N-abc: Unfalsifiable claim"));
    }

    #[test]
    fn parses_fenced_arrays_and_deduplicates_logic() {
        let client = ScriptedClient::new(vec![
            Ok("```json\n[{\"if\": \"price sweeps lows\", \"then\": \"look for longs\", \"timestamp\": \"2:10\", \"drawer\": 4}]\n```".into()),
            Ok("[{\"if\": \"Price sweeps lows\", \"then\": \"look for longs\"}, {\"if\": \"weekly bias is bearish\", \"then\": \"favor shorts\", \"drawer\": \"htf bias\"}]".into()),
        ]);
        let extractor = ModelExtractor::new(client.clone(), small_chunks());
        let claims = extractor
            .extract(&request(
                vec![
                    TranscriptSegment::new("segment one text", 10.0),
                    TranscriptSegment::new("segment two text", 95.0),
                ],
                AvoidanceList::default(),
            ))
            .unwrap();

        assert_eq!(client.prompts.lock().unwrap().len(), 2);
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].condition, "IF price sweeps lows");
        assert_eq!(claims[0].provenance_timestamp.as_deref(), Some("2:10"));
        assert_eq!(claims[0].category_tag.as_deref(), Some("4"));
        assert_eq!(claims[1].claim_id, "S-002");
        assert_eq!(claims[1].provenance_timestamp.as_deref(), Some("1:35"));
        assert_eq!(claims[1].category_tag.as_deref(), Some("htf bias"));
    }

    #[test]
    fn failing_chunks_are_skipped() {
        let client = ScriptedClient::new(vec![
            Err(ModelError::Transport("timeout".into())),
            Ok("not json at all".into()),
            Ok("[{\"if\": \"equal highs form\", \"then\": \"target them\"}]".into()),
        ]);
        let extractor = ModelExtractor::new(client, small_chunks());
        let claims = extractor
            .extract(&request(
                vec![
                    TranscriptSegment::new("first chunk text", 0.0),
                    TranscriptSegment::new("second chunk text", 30.0),
                    TranscriptSegment::new("third chunk text", 60.0),
                ],
                AvoidanceList::default(),
            ))
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].claim_id, "S-001");
        assert_eq!(claims[0].provenance_timestamp.as_deref(), Some("1:00"));
    }

    #[test]
    fn short_segments_share_a_chunk() {
        let client = ScriptedClient::new(Vec::new());
        let extractor = ModelExtractor::new(client.clone(), ModelExtractorConfig::default());
        extractor
            .extract(&request(
                vec![
                    TranscriptSegment::new("one", 0.0),
                    TranscriptSegment::new("two", 4.0),
                ],
                AvoidanceList::default(),
            ))
            .unwrap();
        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].user_content.contains("[0s - 4s]"));
        assert!(prompts[0].user_content.contains("one two"));
    }
}
