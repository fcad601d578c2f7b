//! Classifies a query and derives per-request retrieval weights, stage budgets, and
//! feature gates.
//!
//! Ported from the original `QueryPlanner`: four pattern families score the raw
//! query text, the highest-scoring family (ties favor `factual`) picks a base
//! dense/lexical weight split, and a handful of length/vocabulary adjustments nudge
//! the split before it's renormalized to sum to 1.

use chunk_model::{QueryClass, QueryPlan};
use once_cell::sync::Lazy;
use regex::Regex;

struct PatternFamily {
    class: QueryClass,
    patterns: &'static [&'static str],
}

static FACTUAL_PATTERNS: &[&str] = &[
    r"\b(what|who|when|where|which|how many|how much)\b",
    r"\b(define|definition|meaning|explain)\b",
    r"\b(compare|difference|similar|versus|vs)\b",
];

static PROCEDURAL_PATTERNS: &[&str] = &[
    r"\b(how to|how do|steps|process|procedure|method)\b",
    r"\b(implement|create|build|develop|setup|configure)\b",
    r"\b(tutorial|guide|walkthrough|example)\b",
];

static CONCEPTUAL_PATTERNS: &[&str] = &[
    r"\b(why|reason|cause|purpose|benefit|advantage)\b",
    r"\b(concept|theory|principle|idea|notion)\b",
    r"\b(understand|comprehend|learn|study)\b",
];

static SEARCH_PATTERNS: &[&str] = &[
    r"\b(find|search|look for|locate|discover)\b",
    r"\b(list|show|display|present)\b",
    r"\b(available|options|choices|alternatives)\b",
];

static TECHNICAL_TERMS: &[&str] = &["api", "function", "method", "class", "code", "syntax"];
static CONNECTIVE_TERMS: &[&str] = &["and", "or", "but", "however", "although", "while"];
static HEDGING_TERMS: &[&str] = &["maybe", "might", "could", "possibly"];
static SPECIFICITY_TERMS: &[&str] = &["specific", "exact", "precise", "detailed", "particular"];

static COMPILED_FAMILIES: Lazy<Vec<(QueryClass, Vec<Regex>)>> = Lazy::new(|| {
    let families: &[PatternFamily] = &[
        PatternFamily { class: QueryClass::Factual, patterns: FACTUAL_PATTERNS },
        PatternFamily { class: QueryClass::Procedural, patterns: PROCEDURAL_PATTERNS },
        PatternFamily { class: QueryClass::Conceptual, patterns: CONCEPTUAL_PATTERNS },
        PatternFamily { class: QueryClass::Search, patterns: SEARCH_PATTERNS },
    ];
    families
        .iter()
        .map(|f| {
            let compiled = f
                .patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern is valid regex"))
                .collect();
            (f.class, compiled)
        })
        .collect()
});

fn score_family(query: &str, patterns: &[Regex]) -> u32 {
    patterns.iter().filter(|re| re.is_match(query)).count() as u32
}

fn classify(query: &str) -> QueryClass {
    let mut best = QueryClass::Factual;
    let mut best_score = 0u32;
    // Iterate in a fixed, declared order so a tie always resolves to whichever
    // family comes first — factual is first, matching "ties -> factual".
    for (class, patterns) in COMPILED_FAMILIES.iter() {
        let score = score_family(query, patterns);
        if score > best_score {
            best_score = score;
            best = *class;
        }
    }
    best
}

fn base_weights(class: QueryClass) -> (f32, f32) {
    match class {
        QueryClass::Factual => (0.60, 0.40),
        QueryClass::Procedural => (0.40, 0.60),
        QueryClass::Conceptual => (0.70, 0.30),
        QueryClass::Search => (0.30, 0.70),
    }
}

fn retrieve_k(class: QueryClass) -> usize {
    match class {
        QueryClass::Factual => 8,
        QueryClass::Procedural => 12,
        QueryClass::Conceptual => 10,
        QueryClass::Search => 15,
    }
}

fn rerank_k(class: QueryClass) -> usize {
    match class {
        QueryClass::Factual => 5,
        QueryClass::Procedural => 8,
        QueryClass::Conceptual => 6,
        QueryClass::Search => 10,
    }
}

fn tokenize(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Build a [`QueryPlan`] for `query`. Pure function of the query text: no I/O, no
/// randomness, safe to call on every request without side effects.
pub fn plan(query: &str) -> QueryPlan {
    let query_lower = query.to_lowercase();
    let tokens = tokenize(&query_lower);
    let token_count = tokens.len();

    let class = classify(&query_lower);
    let (mut dense, mut lexical) = base_weights(class);

    if token_count > 10 {
        dense += 0.10;
        lexical -= 0.10;
    } else if token_count < 5 {
        lexical += 0.10;
        dense -= 0.10;
    }

    if TECHNICAL_TERMS.iter().any(|t| tokens.iter().any(|w| w == t)) {
        lexical += 0.10;
        dense -= 0.10;
    }

    // Renormalize so the pair always sums to 1, clamping negative drift from the
    // adjustments above before the final divide.
    let dense = dense.max(0.0);
    let lexical = lexical.max(0.0);
    let total = dense + lexical;
    let (dense_weight, lexical_weight) = if total > 0.0 {
        (dense / total, lexical / total)
    } else {
        (0.5, 0.5)
    };

    let connective_count = CONNECTIVE_TERMS
        .iter()
        .filter(|t| tokens.iter().any(|w| w == *t))
        .count();
    let use_rerank = token_count > 8
        || matches!(class, QueryClass::Factual | QueryClass::Conceptual)
        || connective_count >= 2;

    let has_specificity = SPECIFICITY_TERMS.iter().any(|t| tokens.iter().any(|w| w == t));
    let use_expansion = token_count < 4 || matches!(class, QueryClass::Conceptual) || !has_specificity;

    let mut confidence: f32 = 0.7;
    if token_count > 5 {
        confidence += 0.1;
    }
    if token_count > 10 {
        confidence += 0.1;
    }
    if matches!(class, QueryClass::Factual | QueryClass::Procedural) {
        confidence += 0.1;
    }
    if HEDGING_TERMS.iter().any(|t| tokens.iter().any(|w| w == t)) {
        confidence -= 0.2;
    }
    let plan_confidence = confidence.clamp(0.0, 1.0);

    QueryPlan {
        query_class: class,
        dense_weight,
        lexical_weight,
        retrieve_k: retrieve_k(class),
        rerank_k: rerank_k(class),
        use_expansion,
        use_rerank,
        plan_confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-4, "{a} != {b}");
    }

    #[test]
    fn weights_always_sum_to_one() {
        for q in ["what is X", "how to configure a widget", "why does this matter", "find all reports"] {
            let p = plan(q);
            approx(p.dense_weight + p.lexical_weight, 1.0);
        }
    }

    #[test]
    fn scenario_short_factual_query() {
        // "what is X" -> factual, 3 tokens -> short-query adjustment applies.
        let p = plan("what is X");
        assert_eq!(p.query_class, QueryClass::Factual);
        approx(p.dense_weight, 0.5);
        approx(p.lexical_weight, 0.5);
        assert_eq!(p.retrieve_k, 8);
        assert_eq!(p.rerank_k, 5);
    }

    #[test]
    fn procedural_query_favors_lexical() {
        let p = plan("how to implement a retry loop in rust with backoff and jitter");
        assert_eq!(p.query_class, QueryClass::Procedural);
        assert!(p.lexical_weight > p.dense_weight);
        assert!(p.use_rerank, "query has > 8 tokens");
    }

    #[test]
    fn hedging_lowers_confidence() {
        let hedged = plan("maybe this could possibly be the cause of the issue");
        let direct = plan("this is the cause of the issue");
        assert!(hedged.plan_confidence < direct.plan_confidence);
    }

    #[test]
    fn technical_terms_shift_toward_lexical() {
        let p = plan("explain the api method signature for this class");
        assert!(p.lexical_weight >= 0.3);
    }

    #[test]
    fn ties_default_to_factual() {
        let p = plan("xyzzy plugh");
        assert_eq!(p.query_class, QueryClass::Factual);
    }
}
