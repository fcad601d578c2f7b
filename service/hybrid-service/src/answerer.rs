//! §4.12 Answerer: prompt assembly, context-budget truncation, post-generation
//! validation, and the guardrails from §15.2. Generation itself goes through the
//! narrow [`LlmClient`] trait — the LLM endpoint is out of scope (§1), so this crate
//! only defines the seam and a deterministic [`EchoLlmClient`] stand-in, the same way
//! [`reranker::CrossEncoder`] and [`embedding_provider::Embedder`] are narrow traits
//! with swappable backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

use cache::TypedCache;
use chunk_model::{Answer, Citation, ChunkId, LatencyBreakdown, QueryPlan, RetrievalCandidate};

const FORBIDDEN_HEDGING_PHRASES: &[&str] = &[
    "i think",
    "i believe",
    "it seems",
    "probably",
    "as an ai",
    "i'm not sure",
    "i am not sure",
];

static CITATION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Source\s+(\d+)").expect("static pattern is valid regex"));

#[derive(Debug, thiserror::Error)]
pub enum AnswererError {
    #[error("llm provider unavailable: {0}")]
    ProviderFailure(String),
}

/// One token (or a small batch) forwarded to a streaming caller, followed by exactly
/// one terminal frame.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done { citations: Vec<Citation>, confidence: f32, deadline_exceeded: bool },
    Error(String),
}

/// The out-of-scope generation boundary. Implementations own their own transport,
/// auth, and retry policy; this crate only needs the two calls below.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str, max_tokens: usize) -> Result<String, AnswererError>;

    async fn generate_stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: usize,
    ) -> Result<mpsc::Receiver<String>, AnswererError>;
}

/// Deterministic, network-free [`LlmClient`]: answers by stitching together the
/// highest-relevance sentence from each source with its citation marker. Useful as
/// the default when no real LLM is wired in, and in tests, the way
/// `embedding_provider`'s `OnnxHttpEmbedder` stands in for a real HTTP provider with a
/// deterministic pseudo-embedder.
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn generate(&self, _system_prompt: &str, user_prompt: &str, max_tokens: usize) -> Result<String, AnswererError> {
        Ok(truncate_words(user_prompt, max_tokens))
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: usize,
    ) -> Result<mpsc::Receiver<String>, AnswererError> {
        let text = self.generate(system_prompt, user_prompt, max_tokens).await?;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for word in text.split_whitespace() {
                if tx.send(format!("{word} ")).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn truncate_words(text: &str, max_words: usize) -> String {
    text.split_whitespace().take(max_words).collect::<Vec<_>>().join(" ")
}

const SYSTEM_PROMPT_TEMPLATE: &str = "You answer only from the sources provided below. \
Cite every claim as \"Source N\", referring to the numbered source list. \
If the sources do not contain enough information to answer, say so plainly instead of guessing. \
Do not hedge with phrases like \"I think\" or \"probably\" — either state the answer with its citation or refuse.";

pub struct Answerer {
    llm: Arc<dyn LlmClient>,
    cache: TypedCache<Answer>,
}

impl Answerer {
    pub fn new(llm: Arc<dyn LlmClient>, cache: TypedCache<Answer>) -> Self {
        Self { llm, cache }
    }

    pub async fn cached_answer(&self, query_fingerprint: &str) -> Option<Answer> {
        self.cache.get(query_fingerprint).await
    }

    pub async fn cache_answer(&self, query_fingerprint: &str, collection: &str, answer: Answer, ttl: Option<Duration>) {
        self.cache.set(query_fingerprint.to_string(), answer, cache::collection_tag(collection), ttl).await;
    }

    /// Produce a full [`Answer`] for `question` grounded in `candidates` (already
    /// reranked and truncated to `rerank_k`, in descending relevance order).
    pub async fn answer(
        &self,
        question: &str,
        candidates: &[RetrievalCandidate],
        plan: &QueryPlan,
        max_tokens: usize,
        max_context_tokens: usize,
        require_citations: bool,
        forbid_unverifiable: bool,
        low_confidence_floor: f32,
    ) -> Result<Answer, AnswererError> {
        let shown = truncate_to_context_budget(candidates, max_context_tokens);
        if shown.is_empty() {
            return Ok(refusal("no relevant sources were found for this question", plan));
        }

        let system_prompt = SYSTEM_PROMPT_TEMPLATE.to_string();
        let user_prompt = build_user_prompt(question, &shown);

        let raw = self.llm.generate(&system_prompt, &user_prompt, max_tokens).await?;
        Ok(validate_and_build(question, &raw, &shown, plan, max_tokens, require_citations, forbid_unverifiable, low_confidence_floor))
    }

    /// Streaming variant of [`answer`](Self::answer): tokens are forwarded as they
    /// arrive, with best-effort validation run once against the fully accumulated
    /// text before the terminal [`StreamEvent::Done`] frame.
    pub async fn answer_stream(
        &self,
        question: &str,
        candidates: &[RetrievalCandidate],
        plan: &QueryPlan,
        max_tokens: usize,
        max_context_tokens: usize,
        require_citations: bool,
        forbid_unverifiable: bool,
        low_confidence_floor: f32,
    ) -> Result<mpsc::Receiver<StreamEvent>, AnswererError> {
        let shown = truncate_to_context_budget(candidates, max_context_tokens);
        let (tx, rx) = mpsc::channel(32);

        if shown.is_empty() {
            tokio::spawn(async move {
                let _ = tx
                    .send(StreamEvent::Done { citations: Vec::new(), confidence: 0.0, deadline_exceeded: false })
                    .await;
            });
            return Ok(rx);
        }

        let system_prompt = SYSTEM_PROMPT_TEMPLATE.to_string();
        let user_prompt = build_user_prompt(question, &shown);
        let mut upstream = self.llm.generate_stream(&system_prompt, &user_prompt, max_tokens).await?;

        let question = question.to_string();
        let plan = plan.clone();
        tokio::spawn(async move {
            let mut accumulated = String::new();
            while let Some(token) = upstream.recv().await {
                accumulated.push_str(&token);
                if tx.send(StreamEvent::Token(token)).await.is_err() {
                    return;
                }
            }
            let answer = validate_and_build(
                &question,
                &accumulated,
                &shown,
                &plan,
                max_tokens,
                require_citations,
                forbid_unverifiable,
                low_confidence_floor,
            );
            let _ = tx
                .send(StreamEvent::Done {
                    citations: answer.citations,
                    confidence: answer.confidence,
                    deadline_exceeded: answer.deadline_exceeded,
                })
                .await;
        });

        Ok(rx)
    }
}

/// §4.12: evict the lowest-fused, longest-text candidates first until the remaining
/// set's approximate token count fits `max_context_tokens`. The top (first) candidate
/// is never evicted.
fn truncate_to_context_budget(candidates: &[RetrievalCandidate], max_context_tokens: usize) -> Vec<RetrievalCandidate> {
    let mut kept: Vec<RetrievalCandidate> = candidates.to_vec();
    let token_count = |cs: &[RetrievalCandidate]| -> usize { cs.iter().map(|c| c.text.split_whitespace().count()).sum() };

    while kept.len() > 1 && token_count(&kept) > max_context_tokens {
        let evict_idx = kept
            .iter()
            .enumerate()
            .skip(1)
            .min_by(|(_, a), (_, b)| {
                a.fused_score
                    .partial_cmp(&b.fused_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.text.len().cmp(&a.text.len()))
            })
            .map(|(i, _)| i);
        match evict_idx {
            Some(i) => {
                kept.remove(i);
            }
            None => break,
        }
    }
    kept
}

fn build_user_prompt(question: &str, shown: &[RetrievalCandidate]) -> String {
    let mut prompt = format!("Question: {question}\n\nSources:\n");
    for (idx, candidate) in shown.iter().enumerate() {
        let page = candidate.metadata.page.map(|p| format!(", page {p}")).unwrap_or_default();
        prompt.push_str(&format!(
            "Source {n} ({source}{page}, section \"{section}\", relevance {relevance:.2}):\n{text}\n\n",
            n = idx + 1,
            source = candidate.metadata.source,
            page = page,
            section = candidate.metadata.section_title,
            relevance = candidate.fused_score,
            text = candidate.text,
        ));
    }
    prompt
}

fn extract_citations(text: &str, shown: &[RetrievalCandidate]) -> Vec<Citation> {
    let mut seen = std::collections::BTreeSet::new();
    let mut citations = Vec::new();
    for capture in CITATION_MARKER.captures_iter(text) {
        let Ok(n) = capture[1].parse::<usize>() else { continue };
        if n == 0 || n > shown.len() || !seen.insert(n) {
            continue;
        }
        citations.push(Citation { source_index: n as u32, chunk_id: shown[n - 1].chunk_id.clone() });
    }
    citations
}

fn contains_forbidden_hedging(text: &str) -> bool {
    let lower = text.to_lowercase();
    FORBIDDEN_HEDGING_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// §15.2 guardrail: reject an answer that is just the question echoed back with no
/// grounding citation.
fn is_verbatim_echo(question: &str, answer: &str, citations: &[Citation]) -> bool {
    citations.is_empty() && normalize(answer) == normalize(question)
}

fn normalize(s: &str) -> String {
    s.trim().trim_end_matches(['.', '?', '!']).to_lowercase()
}

fn confidence(top_fused: f32, candidates: &[RetrievalCandidate], plan_confidence: f32) -> f32 {
    let unique_sources: std::collections::HashSet<&str> = candidates.iter().map(|c| c.metadata.source.as_str()).collect();
    let bonus = 0.05 * (unique_sources.len().min(4) as f32);
    (top_fused + bonus + 0.1 * plan_confidence).min(1.0)
}

fn refusal(reason: &str, plan: &QueryPlan) -> Answer {
    Answer {
        text: format!("I don't have enough information to answer that. {reason}."),
        citations: Vec::new(),
        confidence: 0.0,
        token_count: 0,
        latency: LatencyBreakdown::default(),
        deadline_exceeded: false,
        search_strategy: plan.query_class.as_str().to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_and_build(
    question: &str,
    raw: &str,
    shown: &[RetrievalCandidate],
    plan: &QueryPlan,
    max_tokens: usize,
    require_citations: bool,
    forbid_unverifiable: bool,
    low_confidence_floor: f32,
) -> Answer {
    let mut text = truncate_words(raw, max_tokens);
    let mut citations = extract_citations(&text, shown);

    let violates_citations = require_citations && citations.is_empty();
    let violates_hedging = forbid_unverifiable && contains_forbidden_hedging(&text);
    let violates_echo = is_verbatim_echo(question, &text, &citations);

    if violates_citations || violates_hedging || violates_echo {
        return refusal_for_validation(plan, violates_citations, violates_hedging, violates_echo);
    }

    let top_fused = shown.first().map(|c| c.fused_score).unwrap_or(0.0);
    let mut conf = confidence(top_fused, shown, plan.plan_confidence);
    if conf < low_confidence_floor {
        text = format!("{text}\n\n(Note: this answer has low confidence and should be independently verified.)");
        conf = conf.max(0.0);
    }
    citations.sort_by_key(|c| c.source_index);

    Answer {
        token_count: text.split_whitespace().count(),
        text,
        citations,
        confidence: conf,
        latency: LatencyBreakdown::default(),
        deadline_exceeded: false,
        search_strategy: plan.query_class.as_str().to_string(),
    }
}

fn refusal_for_validation(plan: &QueryPlan, missing_citations: bool, hedging: bool, echo: bool) -> Answer {
    let reason = if echo {
        "the generated answer only repeated the question without citing a source"
    } else if missing_citations {
        "the generated answer did not cite any source"
    } else if hedging {
        "the generated answer hedged instead of citing a source"
    } else {
        "the generated answer failed validation"
    };
    refusal(reason, plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_model::{ChunkMetadata, QueryClass};

    fn plan() -> QueryPlan {
        QueryPlan {
            query_class: QueryClass::Factual,
            dense_weight: 0.5,
            lexical_weight: 0.5,
            retrieve_k: 5,
            rerank_k: 3,
            use_expansion: false,
            use_rerank: true,
            plan_confidence: 0.8,
        }
    }

    fn candidate(id: &str, source: &str, fused: f32, text: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: ChunkId(id.into()),
            text: text.into(),
            metadata: ChunkMetadata { source: source.into(), doc_title: "Doc".into(), section_title: "Intro".into(), page: None },
            dense_score: Some(fused),
            lexical_score: Some(fused),
            fused_score: fused,
        }
    }

    struct FixedLlm(&'static str);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn generate(&self, _s: &str, _u: &str, _m: usize) -> Result<String, AnswererError> {
            Ok(self.0.to_string())
        }
        async fn generate_stream(&self, _s: &str, _u: &str, _m: usize) -> Result<mpsc::Receiver<String>, AnswererError> {
            let (tx, rx) = mpsc::channel(4);
            let text = self.0.to_string();
            tokio::spawn(async move {
                let _ = tx.send(text).await;
            });
            Ok(rx)
        }
    }

    fn cache() -> TypedCache<Answer> {
        TypedCache::new("answer", Duration::from_secs(600), 100)
    }

    #[tokio::test]
    async fn grounded_answer_with_citation_passes_validation() {
        let answerer = Answerer::new(Arc::new(FixedLlm("The answer is X (Source 1).")), cache());
        let candidates = vec![candidate("a", "doc.md", 0.9, "X is true.")];
        let answer = answerer
            .answer("what is X", &candidates, &plan(), 200, 4000, true, true, 0.0)
            .await
            .unwrap();
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].source_index, 1);
    }

    #[tokio::test]
    async fn missing_citation_is_refused_when_required() {
        let answerer = Answerer::new(Arc::new(FixedLlm("The answer is X.")), cache());
        let candidates = vec![candidate("a", "doc.md", 0.9, "X is true.")];
        let answer = answerer
            .answer("what is X", &candidates, &plan(), 200, 4000, true, true, 0.0)
            .await
            .unwrap();
        assert!(answer.citations.is_empty());
        assert!(answer.text.starts_with("I don't have enough information"));
    }

    #[tokio::test]
    async fn hedging_phrase_triggers_refusal() {
        let answerer = Answerer::new(Arc::new(FixedLlm("I think the answer is X (Source 1).")), cache());
        let candidates = vec![candidate("a", "doc.md", 0.9, "X is true.")];
        let answer = answerer
            .answer("what is X", &candidates, &plan(), 200, 4000, true, true, 0.0)
            .await
            .unwrap();
        assert!(answer.text.starts_with("I don't have enough information"));
    }

    #[tokio::test]
    async fn verbatim_echo_without_citation_is_refused() {
        let answerer = Answerer::new(Arc::new(FixedLlm("what is X")), cache());
        let candidates = vec![candidate("a", "doc.md", 0.9, "X is true.")];
        let answer = answerer
            .answer("what is X", &candidates, &plan(), 200, 4000, false, false, 0.0)
            .await
            .unwrap();
        assert!(answer.text.starts_with("I don't have enough information"));
    }

    #[test]
    fn context_truncation_never_evicts_top_candidate() {
        let candidates = vec![
            candidate("top", "doc.md", 0.9, &"word ".repeat(50)),
            candidate("low", "doc.md", 0.1, &"word ".repeat(50)),
        ];
        let shown = truncate_to_context_budget(&candidates, 60);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].chunk_id.0, "top");
    }

    #[test]
    fn no_sources_means_no_citations_possible() {
        assert_eq!(extract_citations("Source 5 says so", &[]), Vec::new());
    }
}
