//! Parsing of free-form judge responses into structured output.
//!
//! Judges answer in text that should contain a JSON object. The parser
//! extracts that object (bare or inside a fenced block), validates it against
//! the rubric, and returns either a [`ScoreSet`] or a [`Verdict`]. Callers
//! never inspect raw provider payloads themselves.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;
use crate::run::Criterion;

/// Validated per-criterion scores from one judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSet {
    pub scores: BTreeMap<String, i64>,
    #[serde(default)]
    pub rationale: Option<String>,
    /// Cost of the judge call that produced the scores.
    #[serde(default)]
    pub cost: f64,
}

impl ScoreSet {
    pub fn new(scores: BTreeMap<String, i64>) -> Self {
        Self {
            scores,
            rationale: None,
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Arithmetic mean of all scores.
    pub fn mean(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.values().sum::<i64>() as f64 / self.scores.len() as f64)
    }
}

/// Which side a judge preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictWinner {
    A,
    B,
    Tie,
}

impl fmt::Display for VerdictWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictWinner::A => write!(f, "A"),
            VerdictWinner::B => write!(f, "B"),
            VerdictWinner::Tie => write!(f, "tie"),
        }
    }
}

/// A pairwise verdict from one judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub winner: VerdictWinner,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub cost: f64,
}

impl Verdict {
    pub fn new(winner: VerdictWinner, rationale: impl Into<String>) -> Self {
        Self {
            winner,
            rationale: rationale.into(),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Extracts the JSON object from a possibly markdown-wrapped response.
pub fn extract_json(content: &str) -> Option<&str> {
    if let Some(start) = content.find("```json") {
        let body = &content[start + 7..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end >= start {
        Some(&content[start..=end])
    } else {
        None
    }
}

fn parse_object(raw: &str) -> Result<serde_json::Map<String, Value>, ParseError> {
    let json = extract_json(raw).ok_or(ParseError::NoJson)?;
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ParseError::InvalidJson(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
        Err(e) => Err(ParseError::InvalidJson(e.to_string())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Integer score from a JSON value; accepts integral floats and numeric strings.
fn as_score(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(obj) => obj.get("score").and_then(as_score),
        _ => None,
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Checks that `raw` has exactly one in-range score per criterion.
///
/// Keys are matched case-insensitively; extra keys are ignored.
pub fn validate_scores(
    raw: &BTreeMap<String, i64>,
    criteria: &[Criterion],
) -> Result<BTreeMap<String, i64>, ParseError> {
    let by_key: BTreeMap<String, i64> = raw.iter().map(|(k, v)| (normalize(k), *v)).collect();
    let mut scores = BTreeMap::new();
    for criterion in criteria {
        let score = *by_key
            .get(&normalize(&criterion.name))
            .ok_or_else(|| ParseError::MissingCriterion(criterion.name.clone()))?;
        if !criterion.contains(score) {
            return Err(ParseError::OutOfRange {
                criterion: criterion.name.clone(),
                score,
                min: criterion.min,
                max: criterion.max,
            });
        }
        scores.insert(criterion.name.clone(), score);
    }
    Ok(scores)
}

/// Parses a scoring response.
///
/// Accepted shapes: `{"scores": {"clarity": 4}}`, a flat `{"clarity": 4}`,
/// or `{"scores": [{"criterion": "clarity", "score": 4}]}`.
pub fn parse_scores(raw: &str, criteria: &[Criterion]) -> Result<ScoreSet, ParseError> {
    let object = parse_object(raw)?;
    let rationale = object
        .get("rationale")
        .or_else(|| object.get("reasoning"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut found = BTreeMap::new();
    match object.get("scores") {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                if let Some(score) = as_score(value) {
                    found.insert(key.clone(), score);
                }
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let name = item
                    .get("criterion")
                    .or_else(|| item.get("name"))
                    .and_then(Value::as_str);
                if let (Some(name), Some(score)) = (name, item.get("score").and_then(as_score)) {
                    found.insert(name.to_string(), score);
                }
            }
        }
        Some(other) => {
            return Err(ParseError::InvalidJson(format!(
                "'scores' must be an object or array, got {}",
                type_name(other)
            )))
        }
        None => {
            for (key, value) in &object {
                if let Some(score) = as_score(value) {
                    found.insert(key.clone(), score);
                }
            }
        }
    }

    let scores = validate_scores(&found, criteria)?;
    Ok(ScoreSet {
        scores,
        rationale,
        cost: 0.0,
    })
}

fn parse_winner(raw: &str) -> Option<VerdictWinner> {
    match normalize(raw).as_str() {
        "a" | "document_a" | "doc_a" | "first" | "1" => Some(VerdictWinner::A),
        "b" | "document_b" | "doc_b" | "second" | "2" => Some(VerdictWinner::B),
        "tie" | "draw" | "equal" | "none" => Some(VerdictWinner::Tie),
        _ => None,
    }
}

/// Parses a comparison response such as `{"winner": "A", "rationale": "..."}`.
pub fn parse_verdict(raw: &str) -> Result<Verdict, ParseError> {
    let object = parse_object(raw)?;
    let winner_raw = match object.get("winner") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Null) => "tie".to_string(),
        Some(other) => return Err(ParseError::UnknownWinner(other.to_string())),
        None => return Err(ParseError::UnknownWinner("<missing>".to_string())),
    };
    let winner = parse_winner(&winner_raw).ok_or(ParseError::UnknownWinner(winner_raw))?;
    let rationale = object
        .get("rationale")
        .or_else(|| object.get("reasoning"))
        .or_else(|| object.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(Verdict {
        winner,
        rationale,
        cost: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> Vec<Criterion> {
        vec![Criterion::new("clarity"), Criterion::new("Factual Accuracy")]
    }

    #[test]
    fn test_extract_json_from_fence() {
        let content = "Here you go:\n```json\n{\"winner\": \"A\"}\n```\nThanks";
        assert_eq!(extract_json(content), Some("{\"winner\": \"A\"}"));
    }

    #[test]
    fn test_extract_json_bare() {
        let content = "Result: {\"a\": 1} done";
        assert_eq!(extract_json(content), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no braces here"), None);
    }

    #[test]
    fn test_parse_nested_scores() {
        let raw = r#"{"scores": {"clarity": 4, "factual_accuracy": 5}, "rationale": "solid"}"#;
        let set = parse_scores(raw, &criteria()).unwrap();
        assert_eq!(set.scores["clarity"], 4);
        assert_eq!(set.scores["Factual Accuracy"], 5);
        assert_eq!(set.rationale.as_deref(), Some("solid"));
        assert!((set.mean().unwrap() - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_flat_and_list_scores() {
        let set = parse_scores(r#"{"Clarity": "3", "factual accuracy": 2.0}"#, &criteria())
            .unwrap();
        assert_eq!(set.scores["clarity"], 3);
        assert_eq!(set.scores["Factual Accuracy"], 2);

        let raw = r#"{"scores": [{"criterion": "clarity", "score": 1},
                                 {"name": "factual-accuracy", "score": {"score": 5}}]}"#;
        let set = parse_scores(raw, &criteria()).unwrap();
        assert_eq!(set.scores.len(), 2);
    }

    #[test]
    fn test_parse_scores_rejects_bad_input() {
        assert_eq!(
            parse_scores("I think it is great", &criteria()),
            Err(ParseError::NoJson)
        );
        assert!(matches!(
            parse_scores("{not json}", &criteria()),
            Err(ParseError::InvalidJson(_))
        ));
        assert_eq!(
            parse_scores(r#"{"clarity": 4}"#, &criteria()),
            Err(ParseError::MissingCriterion("Factual Accuracy".to_string()))
        );
        assert!(matches!(
            parse_scores(r#"{"clarity": 9, "factual_accuracy": 3}"#, &criteria()),
            Err(ParseError::OutOfRange { score: 9, .. })
        ));
        assert!(matches!(
            parse_scores(r#"{"clarity": 3.5, "factual_accuracy": 3}"#, &criteria()),
            Err(ParseError::MissingCriterion(_))
        ));
    }

    #[test]
    fn test_parse_verdict_variants() {
        let v = parse_verdict(r#"{"winner": "A", "rationale": "more precise"}"#).unwrap();
        assert_eq!(v.winner, VerdictWinner::A);
        assert_eq!(v.rationale, "more precise");

        let v = parse_verdict("```json\n{\"winner\": \"document_b\"}\n```").unwrap();
        assert_eq!(v.winner, VerdictWinner::B);

        let v = parse_verdict(r#"{"winner": "Tie", "reasoning": "same"}"#).unwrap();
        assert_eq!(v.winner, VerdictWinner::Tie);
        assert_eq!(v.rationale, "same");
    }

    #[test]
    fn test_parse_verdict_rejects_unknown_winner() {
        assert_eq!(
            parse_verdict(r#"{"winner": "C"}"#),
            Err(ParseError::UnknownWinner("C".to_string()))
        );
        assert!(matches!(
            parse_verdict(r#"{"rationale": "no decision"}"#),
            Err(ParseError::UnknownWinner(_))
        ));
    }
}
