use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use specgen_core::selector::TemplateMatchResult;

use crate::error::{ErrorKind, GenerateError};
use crate::refine::RefinedTest;

/// Which path produced a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Template,
    Llm,
}

/// Final source text for one case.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTest {
    pub case: String,
    pub code: String,
    pub origin: Origin,
    /// USD; always 0 for template output.
    pub cost: f64,
    /// Present only for LLM output.
    pub tokens_used: Option<u64>,
    pub model: Option<String>,
    pub attempts: u32,
    pub selection: TemplateMatchResult,
}

impl GeneratedTest {
    pub fn from_template(case: &str, code: String, selection: TemplateMatchResult) -> Self {
        Self {
            case: case.to_string(),
            code,
            origin: Origin::Template,
            cost: 0.0,
            tokens_used: None,
            model: None,
            attempts: 0,
            selection,
        }
    }

    pub fn from_llm(case: &str, refined: RefinedTest, selection: TemplateMatchResult) -> Self {
        Self {
            case: case.to_string(),
            code: refined.code,
            origin: Origin::Llm,
            cost: refined.cost,
            tokens_used: Some(refined.tokens_used),
            model: Some(refined.model),
            attempts: refined.attempts,
            selection,
        }
    }

    pub fn provenance(&self) -> TestProvenance {
        TestProvenance {
            case: self.case.clone(),
            origin: self.origin,
            template: self.selection.template.clone(),
            score: self.selection.score,
            matched_keywords: self.selection.matched_keywords.clone(),
            hinted: self.selection.hinted,
            cost: self.cost,
            tokens_used: self.tokens_used,
            model: self.model.clone(),
            attempts: self.attempts,
        }
    }
}

/// Audit record of how one case was produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestProvenance {
    pub case: String,
    pub origin: Origin,
    /// Best-scoring template, even when the LLM path was taken.
    pub template: String,
    pub score: f64,
    pub matched_keywords: BTreeSet<String>,
    pub hinted: bool,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSummary {
    pub total_tests: usize,
    pub from_templates: usize,
    #[serde(rename = "fromLLM")]
    pub from_llm: usize,
    pub total_cost: f64,
}

impl GenerationSummary {
    pub fn from_tests(tests: &[GeneratedTest]) -> Self {
        tests.iter().fold(Self::default(), |mut summary, test| {
            summary.total_tests += 1;
            match test.origin {
                Origin::Template => summary.from_templates += 1,
                Origin::Llm => {
                    summary.from_llm += 1;
                    summary.total_cost += test.cost;
                }
            }
            summary
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSuccess {
    pub files_generated: Vec<PathBuf>,
    pub summary: GenerationSummary,
    pub run_id: String,
    pub actor_id: String,
    pub generated_at: DateTime<Utc>,
    pub tests: Vec<TestProvenance>,
    /// Cases dropped in partial-success mode.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_cases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&GenerateError> for GenerationErrorInfo {
    fn from(err: &GenerateError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFailure {
    pub error: GenerationErrorInfo,
    pub run_id: String,
    pub actor_id: String,
}

/// Outcome of one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationResult {
    Success(GenerationSuccess),
    Failure(GenerationFailure),
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResult::Success(_))
    }

    pub fn success(&self) -> Option<&GenerationSuccess> {
        match self {
            GenerationResult::Success(s) => Some(s),
            GenerationResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&GenerationFailure> {
        match self {
            GenerationResult::Failure(f) => Some(f),
            GenerationResult::Success(_) => None,
        }
    }
}

/// Serialized as the body's fields plus a `success` discriminator.
impl Serialize for GenerationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Tagged<'a, T> {
            success: bool,
            #[serde(flatten)]
            body: &'a T,
        }

        match self {
            GenerationResult::Success(body) => Tagged {
                success: true,
                body,
            }
            .serialize(serializer),
            GenerationResult::Failure(body) => Tagged {
                success: false,
                body,
            }
            .serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmErrorKind;

    fn selection(template: &str, score: f64) -> TemplateMatchResult {
        TemplateMatchResult {
            template: template.into(),
            score,
            should_use_template: score >= 0.7,
            matched_keywords: BTreeSet::new(),
            hinted: false,
        }
    }

    fn llm_test(cost: f64) -> GeneratedTest {
        GeneratedTest::from_llm(
            "drag",
            RefinedTest {
                code: "test('drag', async () => {});".into(),
                model: "claude-haiku-4-5".into(),
                cost,
                tokens_used: 1400,
                attempts: 1,
            },
            selection("modal-dialog", 0.2),
        )
    }

    #[test]
    fn summary_reconciles_counts_and_cost() {
        let tests = vec![
            GeneratedTest::from_template(
                "crud",
                "test('crud', ...)".into(),
                selection("crud-operations", 0.8),
            ),
            llm_test(0.0034),
            llm_test(0.0010),
        ];
        let summary = GenerationSummary::from_tests(&tests);
        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.from_templates, 1);
        assert_eq!(summary.from_llm, 2);
        assert!((summary.total_cost - 0.0044).abs() < 1e-12);
    }

    #[test]
    fn template_tests_have_no_tokens() {
        let t =
            GeneratedTest::from_template("crud", String::new(), selection("crud-operations", 0.9));
        assert_eq!(t.cost, 0.0);
        assert_eq!(t.tokens_used, None);
        let json = serde_json::to_value(t.provenance()).unwrap();
        assert_eq!(json["origin"], "template");
        assert!(json.get("tokensUsed").is_none());
    }

    #[test]
    fn success_serializes_with_flag_and_camel_case() {
        let tests = vec![llm_test(0.0034)];
        let result = GenerationResult::Success(GenerationSuccess {
            files_generated: vec![PathBuf::from("out/dashboard.spec.ts")],
            summary: GenerationSummary::from_tests(&tests),
            run_id: "run".into(),
            actor_id: "ci".into(),
            generated_at: Utc::now(),
            tests: tests.iter().map(GeneratedTest::provenance).collect(),
            failed_cases: vec![],
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["filesGenerated"][0], "out/dashboard.spec.ts");
        assert_eq!(json["summary"]["fromLLM"], 1);
        assert_eq!(json["tests"][0]["tokensUsed"], 1400);
        assert!(json.get("failedCases").is_none());
    }

    #[test]
    fn failure_serializes_error_object() {
        let err = GenerateError::Refinement {
            case: "drag".into(),
            source: crate::error::LlmError {
                kind: LlmErrorKind::Api,
                message: "connection refused".into(),
                details: vec!["attempt 1: backend error: connection refused".into()],
            },
        };
        let result = GenerationResult::Failure(GenerationFailure {
            error: GenerationErrorInfo::from(&err),
            run_id: "run".into(),
            actor_id: "ci".into(),
        });
        assert!(!result.is_success());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "generation");
        assert!(json["error"]["message"].as_str().unwrap().contains("connection refused"));
        assert_eq!(
            json["error"]["details"]["llmError"]["details"][0],
            "attempt 1: backend error: connection refused"
        );
    }
}
