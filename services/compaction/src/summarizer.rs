use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use schema::{Category, ModelClient, ModelError, ModelRequest, strip_code_fence};
use serde::Deserialize;

const PROMPT_STATEMENT_LIMIT: usize = 10;

const SYSTEM_PROMPT: &str = "You summarize clusters of IF-THEN statements.
1. Identify the common pattern across the statements.
2. Summarize in 1-2 sentences what the cluster represents.
3. List 2-3 key patterns or concepts.

RULES:
- Keep the source terminology; do not translate it.
- Only summarize what is explicitly stated. No interpretation, commentary or recommendations.

Output JSON only:
{\"summary\": \"...\", \"key_patterns\": [\"...\", \"...\"]}";

/// Input for describing one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRequest {
    pub category: Category,
    pub topic: String,
    pub conditions: Vec<String>,
    pub actions: Vec<String>,
    pub member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub description: String,
    pub key_patterns: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("summarizer did not answer within {0:?}")]
    Timeout(Duration),
    #[error("summarizer model call failed: {0}")]
    Model(#[from] ModelError),
    #[error("malformed summarizer response: {0}")]
    Malformed(String),
    #[error("summarizer worker exited without answering")]
    Disconnected,
}

pub trait Summarizer: Send + Sync {
    fn summarize(&self, request: &SummaryRequest) -> Result<ClusterSummary, SummarizerError>;
}

/// Deterministic description used when no summarizer is configured and as
/// the fallback whenever one fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateSummarizer;

impl TemplateSummarizer {
    pub fn describe(request: &SummaryRequest) -> ClusterSummary {
        ClusterSummary {
            description: format!(
                "Cluster of {} signatures in {}",
                request.member_count, request.category
            ),
            key_patterns: vec![request.topic.clone()],
        }
    }
}

impl Summarizer for TemplateSummarizer {
    fn summarize(&self, request: &SummaryRequest) -> Result<ClusterSummary, SummarizerError> {
        Ok(Self::describe(request))
    }
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_patterns: Vec<String>,
}

/// Summarizer backed by a hosted model.
pub struct ModelSummarizer {
    client: Arc<dyn ModelClient>,
    role: String,
    temperature: f32,
}

impl ModelSummarizer {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            role: "compactor".to_string(),
            temperature: 0.3,
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    fn user_content(request: &SummaryRequest) -> String {
        let shown = request.conditions.len().min(PROMPT_STATEMENT_LIMIT);
        let bullets = |items: &[String]| {
            items
                .iter()
                .take(PROMPT_STATEMENT_LIMIT)
                .map(|item| format!("- {item}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Drawer: {}\nSignatures ({} total, showing first {}):\n\nCONDITIONS:\n{}\n\nACTIONS:\n{}",
            request.category,
            request.member_count,
            shown,
            bullets(&request.conditions),
            bullets(&request.actions)
        )
    }
}

impl Summarizer for ModelSummarizer {
    fn summarize(&self, request: &SummaryRequest) -> Result<ClusterSummary, SummarizerError> {
        let content = self.client.complete(&ModelRequest {
            role: self.role.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_content: Self::user_content(request),
            temperature: self.temperature,
        })?;
        let parsed: SummaryResponse = serde_json::from_str(strip_code_fence(&content))
            .map_err(|err| SummarizerError::Malformed(err.to_string()))?;
        let description = parsed.summary.trim().to_string();
        if description.is_empty() {
            return Err(SummarizerError::Malformed("empty summary".to_string()));
        }
        let key_patterns: Vec<String> = parsed
            .key_patterns
            .into_iter()
            .map(|pattern| pattern.trim().to_string())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        Ok(ClusterSummary {
            description,
            key_patterns: if key_patterns.is_empty() {
                vec![request.topic.clone()]
            } else {
                key_patterns
            },
        })
    }
}

/// Runs the inner summarizer on a worker thread and gives up after
/// `timeout`. A worker that overruns is left to finish on its own; its
/// answer is discarded.
pub struct DeadlineSummarizer {
    inner: Arc<dyn Summarizer>,
    timeout: Duration,
}

impl DeadlineSummarizer {
    pub fn new(inner: Arc<dyn Summarizer>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Summarizer for DeadlineSummarizer {
    fn summarize(&self, request: &SummaryRequest) -> Result<ClusterSummary, SummarizerError> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        thread::spawn(move || {
            let _ = tx.send(inner.summarize(&request));
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SummarizerError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SummarizerError::Disconnected),
        }
    }
}

/// Ask `summarizer` and fall back to the template on any failure.
pub fn describe_cluster(summarizer: &dyn Summarizer, request: &SummaryRequest) -> ClusterSummary {
    match summarizer.summarize(request) {
        Ok(summary) => summary,
        Err(err) => {
            tracing::warn!(
                category = %request.category,
                topic = %request.topic,
                error = %err,
                "cluster summarizer failed; using template description"
            );
            TemplateSummarizer::describe(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn request() -> SummaryRequest {
        SummaryRequest {
            category: Category::EntryModel,
            topic: "SWEEPS_LOWS".into(),
            conditions: vec!["IF price sweeps lows".into()],
            actions: vec!["THEN look for longs".into()],
            member_count: 3,
        }
    }

    struct CannedClient {
        reply: Result<String, ModelError>,
        seen: Mutex<Vec<ModelRequest>>,
    }

    impl CannedClient {
        fn new(reply: Result<String, ModelError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl ModelClient for CannedClient {
        fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone()
        }
    }

    struct Slow(Duration);

    impl Summarizer for Slow {
        fn summarize(&self, _request: &SummaryRequest) -> Result<ClusterSummary, SummarizerError> {
            thread::sleep(self.0);
            Ok(ClusterSummary {
                description: "late".into(),
                key_patterns: Vec::new(),
            })
        }
    }

    #[test]
    fn template_describes_size_and_category() {
        let summary = TemplateSummarizer::describe(&request());
        assert_eq!(summary.description, "Cluster of 3 signatures in ENTRY_MODEL");
        assert_eq!(summary.key_patterns, vec!["SWEEPS_LOWS".to_string()]);
    }

    #[test]
    fn model_summary_is_parsed_from_fenced_json() {
        let client = CannedClient::new(Ok(
            "```json\n{\"summary\": \"Liquidity sweeps of lows.\", \"key_patterns\": [\"sweep\", \" \"]}\n```"
                .into(),
        ));
        let summary = ModelSummarizer::new(client.clone())
            .summarize(&request())
            .unwrap();
        assert_eq!(summary.description, "Liquidity sweeps of lows.");
        assert_eq!(summary.key_patterns, vec!["sweep".to_string()]);

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].role, "compactor");
        assert!(seen[0].user_content.contains("Drawer: ENTRY_MODEL"));
        assert!(seen[0].user_content.contains("- IF price sweeps lows"));
    }

    #[test]
    fn blank_or_invalid_model_output_is_malformed() {
        for reply in ["{\"summary\": \"  \"}", "no json here"] {
            let client = CannedClient::new(Ok(reply.into()));
            let err = ModelSummarizer::new(client).summarize(&request()).unwrap_err();
            assert!(matches!(err, SummarizerError::Malformed(_)), "{reply}: {err}");
        }
    }

    #[test]
    fn failures_fall_back_to_template() {
        let client = CannedClient::new(Err(ModelError::Unavailable("no key".into())));
        let summary = describe_cluster(&ModelSummarizer::new(client), &request());
        assert_eq!(summary, TemplateSummarizer::describe(&request()));
    }

    #[test]
    fn deadline_cuts_off_slow_summarizers() {
        let deadline = DeadlineSummarizer::new(
            Arc::new(Slow(Duration::from_millis(500))),
            Duration::from_millis(20),
        );
        let err = deadline.summarize(&request()).unwrap_err();
        assert!(matches!(err, SummarizerError::Timeout(_)));
        assert_eq!(
            describe_cluster(&deadline, &request()),
            TemplateSummarizer::describe(&request())
        );

        let fast = DeadlineSummarizer::new(Arc::new(TemplateSummarizer), Duration::from_secs(5));
        assert_eq!(
            fast.summarize(&request()).unwrap(),
            TemplateSummarizer::describe(&request())
        );
    }
}
