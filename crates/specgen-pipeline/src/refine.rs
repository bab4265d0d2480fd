use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use specgen_core::spec::TestCaseSpec;

use crate::error::{LlmError, LlmErrorKind};
use crate::extract::extract_code;
use crate::llm::{LlmClient, LlmMessage, LlmRequest, TokenUsage};
use crate::pricing::PriceTable;
use crate::validate::validate_test_source;

/// Total attempts per case: the first call plus two retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

const SYSTEM_PROMPT: &str = r#"You are a Senior QA Automation Engineer. You write end-to-end tests with Playwright Test in TypeScript.

House conventions:
1. Write exactly ONE test using `test('<name>', async ({ page }) => { ... })`. Never use test.only, test.skip or test.describe.
2. Do NOT write import statements; `test` and `expect` are already imported.
3. Prefer user-facing locators: page.getByRole, page.getByLabel, page.getByText, page.getByPlaceholder. Avoid CSS selectors and XPath.
4. Every assertion uses a web-first `await expect(...)` matcher (toBeVisible, toHaveText, toHaveURL, toHaveCount, ...). Never use fixed sleeps like page.waitForTimeout.
5. Implement every step and every assertion in order. Use `test.step` to group related actions when it helps readability.
6. Use the test case name as the test title.

Output ONLY the TypeScript code for the single test, inside one ```typescript code fence. No explanations."#;

/// Used when no exemplar tests are configured.
pub const DEFAULT_EXEMPLAR: &str = r#"test('shows an error for an invalid email', async ({ page }) => {
  await page.goto('/signup');
  await page.getByLabel('Email').fill('not-an-email');
  await page.getByRole('button', { name: 'Sign up' }).click();
  await expect(page.getByText('Enter a valid email address')).toBeVisible();
  await expect(page).toHaveURL(/\/signup$/);
});"#;

/// Screen-level information shared by every case of a document.
#[derive(Debug, Clone, Default)]
pub struct RefinementContext {
    pub screen: String,
    pub screen_description: String,
    /// Existing tests shown to the model as style references.
    pub exemplars: Vec<String>,
}

/// An accepted LLM-generated test with its accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinedTest {
    pub code: String,
    /// Model that produced the accepted answer.
    pub model: String,
    /// USD over every attempt for this case, including rejected ones.
    pub cost: f64,
    pub tokens_used: u64,
    pub attempts: u32,
}

/// Where a case is in the refinement loop. Attempts are numbered from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementState {
    Attempting { attempt: u32 },
    Validating { attempt: u32 },
    Accepted { attempt: u32 },
    Failed { attempt: u32 },
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The candidate passed validation; here is the extracted code.
    Accept(String),
    /// Ask again; the next prompt includes [`RefinementMachine::feedback`].
    Retry { attempt: u32 },
    Fail(LlmError),
}

/// Bounded, feedback-driven retry loop for one test case.
///
/// Holds no I/O: the caller performs each backend call and reports the outcome
/// through [`on_response`](Self::on_response) or
/// [`on_backend_error`](Self::on_backend_error).
#[derive(Debug, Clone)]
pub struct RefinementMachine {
    max_attempts: u32,
    state: RefinementState,
    feedback: Option<String>,
    failures: Vec<String>,
}

impl RefinementMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            state: RefinementState::Attempting { attempt: 0 },
            feedback: None,
            failures: Vec::new(),
        }
    }

    pub fn state(&self) -> RefinementState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        match self.state {
            RefinementState::Attempting { attempt }
            | RefinementState::Validating { attempt }
            | RefinementState::Accepted { attempt }
            | RefinementState::Failed { attempt } => attempt,
        }
    }

    /// Validation feedback for the next prompt, if the last candidate was rejected.
    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            RefinementState::Accepted { .. } | RefinementState::Failed { .. }
        )
    }

    /// The backend answered; validate the candidate.
    pub fn on_response(&mut self, raw: &str) -> Transition {
        if let Some(finished) = self.guard_finished() {
            return finished;
        }
        let attempt = self.attempt();
        self.state = RefinementState::Validating { attempt };

        let code = extract_code(raw);
        match validate_test_source(&code) {
            Ok(()) => {
                self.state = RefinementState::Accepted { attempt };
                Transition::Accept(code)
            }
            Err(err) => {
                let mut feedback = String::from("Your previous answer was rejected:\n");
                for issue in &err.issues {
                    let _ = writeln!(feedback, "- {issue}");
                }
                feedback.push_str("Return the complete corrected test.");
                self.feedback = Some(feedback);
                self.advance(LlmErrorKind::Validation, err.to_string())
            }
        }
    }

    /// The backend call failed or timed out. Feedback from earlier validation
    /// failures is kept for the retry.
    pub fn on_backend_error(&mut self, message: &str) -> Transition {
        if let Some(finished) = self.guard_finished() {
            return finished;
        }
        self.advance(LlmErrorKind::Api, format!("backend error: {message}"))
    }

    fn advance(&mut self, kind: LlmErrorKind, failure: String) -> Transition {
        let attempt = self.attempt();
        self.failures.push(format!("attempt {}: {failure}", attempt + 1));

        if attempt + 1 < self.max_attempts {
            self.state = RefinementState::Attempting {
                attempt: attempt + 1,
            };
            return Transition::Retry {
                attempt: attempt + 1,
            };
        }

        self.state = RefinementState::Failed { attempt };
        Transition::Fail(LlmError {
            kind,
            message: format!("gave up after {} attempt(s); last {failure}", self.max_attempts),
            details: self.failures.clone(),
        })
    }

    fn guard_finished(&self) -> Option<Transition> {
        self.is_finished().then(|| {
            Transition::Fail(LlmError {
                kind: LlmErrorKind::Api,
                message: "refinement already finished".into(),
                details: self.failures.clone(),
            })
        })
    }
}

/// Build the prompt for one attempt.
pub fn build_request(
    case: &TestCaseSpec,
    context: &RefinementContext,
    feedback: Option<&str>,
    max_tokens: u32,
) -> LlmRequest {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Screen: {}", context.screen);
    if !context.screen_description.is_empty() {
        let _ = writeln!(prompt, "Screen description: {}", context.screen_description);
    }
    let _ = writeln!(prompt, "\nTest case: {}", case.name);
    if !case.description.is_empty() {
        let _ = writeln!(prompt, "Description: {}", case.description);
    }
    prompt.push_str("\nSteps:\n");
    for (i, step) in case.steps.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {step}", i + 1);
    }
    prompt.push_str("\nAssertions:\n");
    for (i, assertion) in case.assertions.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {assertion}", i + 1);
    }

    prompt.push_str("\nExamples of tests written in our style:\n");
    if context.exemplars.is_empty() {
        let _ = writeln!(prompt, "```typescript\n{DEFAULT_EXEMPLAR}\n```");
    } else {
        for exemplar in &context.exemplars {
            let _ = writeln!(prompt, "```typescript\n{}\n```", exemplar.trim());
        }
    }

    if let Some(feedback) = feedback {
        let _ = write!(prompt, "\n{feedback}\n");
    }

    LlmRequest {
        system_prompt: SYSTEM_PROMPT.to_string(),
        messages: vec![LlmMessage::user(prompt)],
        max_tokens,
    }
}

/// Escalates low-confidence cases to the generative backend.
pub struct RefinementService {
    llm: Arc<dyn LlmClient>,
    prices: Arc<PriceTable>,
    max_attempts: u32,
    timeout: Duration,
    max_tokens: u32,
}

impl RefinementService {
    pub fn new(llm: Arc<dyn LlmClient>, prices: Arc<PriceTable>) -> Self {
        Self {
            llm,
            prices,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub async fn refine_test(
        &self,
        case: &TestCaseSpec,
        context: &RefinementContext,
    ) -> Result<RefinedTest, LlmError> {
        let mut machine = RefinementMachine::new(self.max_attempts);
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        let mut model = String::new();

        loop {
            let attempt = machine.attempt();
            let request = build_request(case, context, machine.feedback(), self.max_tokens);
            tracing::info!(case = %case.name, attempt = attempt + 1, "Requesting test from LLM");

            let reply = tokio::time::timeout(self.timeout, self.llm.chat(&request)).await;
            let transition = match reply {
                Ok(Ok(response)) => {
                    cost += self.prices.cost(&response.model, &response.usage);
                    usage += response.usage;
                    model = response.model;
                    machine.on_response(&response.content)
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        case = %case.name,
                        attempt = attempt + 1,
                        error = %e,
                        "LLM call failed"
                    );
                    machine.on_backend_error(&e.0)
                }
                Err(_) => {
                    tracing::warn!(
                        case = %case.name,
                        attempt = attempt + 1,
                        timeout = ?self.timeout,
                        "LLM call timed out"
                    );
                    let message = format!("request timed out after {:?}", self.timeout);
                    machine.on_backend_error(&message)
                }
            };

            match transition {
                Transition::Accept(code) => {
                    tracing::info!(
                        case = %case.name,
                        attempts = attempt + 1,
                        model = %model,
                        tokens = usage.total(),
                        cost,
                        "LLM test accepted"
                    );
                    return Ok(RefinedTest {
                        code,
                        model,
                        cost,
                        tokens_used: usage.total(),
                        attempts: attempt + 1,
                    });
                }
                Transition::Retry { attempt } => {
                    tracing::info!(
                        case = %case.name,
                        next_attempt = attempt + 1,
                        "Retrying LLM generation"
                    );
                }
                Transition::Fail(err) => {
                    tracing::error!(
                        case = %case.name,
                        kind = %err.kind,
                        cost,
                        tokens = usage.total(),
                        "Refinement failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{StubLlmClient, StubReply};

    const VALID: &str = "test('reorders widgets', async ({ page }) => {\n  await page.goto('/dashboard');\n  await expect(page.getByText('Revenue')).toBeVisible();\n});";
    const UNBALANCED: &str = "test('reorders widgets', async ({ page }) => {\n  await expect(page.getByText('Revenue')).toBeVisible();\n";

    fn case() -> TestCaseSpec {
        TestCaseSpec {
            name: "Reorder widgets by dragging".into(),
            description: String::new(),
            steps: vec!["Drag the \"Revenue\" widget onto the \"Top\" slot".into()],
            assertions: vec!["\"Revenue\" widget appears first in the grid".into()],
            template_hint: None,
        }
    }

    fn context() -> RefinementContext {
        RefinementContext {
            screen: "Dashboard".into(),
            screen_description: "Widget grid".into(),
            exemplars: vec![],
        }
    }

    fn service(stub: StubLlmClient) -> (Arc<StubLlmClient>, RefinementService) {
        let stub = Arc::new(stub);
        let svc = RefinementService::new(stub.clone(), Arc::new(PriceTable::builtin()));
        (stub, svc)
    }

    #[test]
    fn machine_accepts_valid_first_answer() {
        let mut m = RefinementMachine::new(3);
        assert_eq!(m.state(), RefinementState::Attempting { attempt: 0 });
        let fenced = format!("```typescript\n{VALID}\n```");
        assert_eq!(m.on_response(&fenced), Transition::Accept(VALID.to_string()));
        assert_eq!(m.state(), RefinementState::Accepted { attempt: 0 });
    }

    #[test]
    fn machine_retries_with_feedback() {
        let mut m = RefinementMachine::new(3);
        assert_eq!(m.on_response(UNBALANCED), Transition::Retry { attempt: 1 });
        let feedback = m.feedback().unwrap();
        assert!(feedback.contains("unclosed `{`"), "{feedback}");
        assert_eq!(m.state(), RefinementState::Attempting { attempt: 1 });
        assert_eq!(m.on_response(VALID), Transition::Accept(VALID.to_string()));
    }

    #[test]
    fn machine_fails_after_max_attempts() {
        let mut m = RefinementMachine::new(3);
        assert!(matches!(m.on_response("nope"), Transition::Retry { attempt: 1 }));
        assert!(matches!(m.on_response("nope"), Transition::Retry { attempt: 2 }));
        match m.on_response("nope") {
            Transition::Fail(err) => {
                assert_eq!(err.kind, LlmErrorKind::Validation);
                assert_eq!(err.details.len(), 3);
                assert!(err.details[0].starts_with("attempt 1:"));
                assert!(err.message.contains("gave up after 3 attempt(s)"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(m.state(), RefinementState::Failed { attempt: 2 });
        assert!(m.is_finished());
    }

    #[test]
    fn final_kind_follows_last_failure() {
        let mut m = RefinementMachine::new(2);
        m.on_response("nope");
        match m.on_backend_error("503 Service Unavailable") {
            Transition::Fail(err) => {
                assert_eq!(err.kind, LlmErrorKind::Api);
                assert!(err.message.contains("503"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn backend_error_keeps_earlier_feedback() {
        let mut m = RefinementMachine::new(3);
        m.on_response(UNBALANCED);
        m.on_backend_error("timeout");
        assert!(m.feedback().unwrap().contains("unclosed"));
    }

    #[test]
    fn single_attempt_machine_fails_immediately() {
        let mut m = RefinementMachine::new(0);
        assert!(matches!(m.on_backend_error("down"), Transition::Fail(_)));
        assert!(matches!(m.on_response(VALID), Transition::Fail(_)));
    }

    #[test]
    fn request_includes_case_and_default_exemplar() {
        let request = build_request(&case(), &context(), None, 1000);
        let prompt = &request.messages[0].content;
        assert!(prompt.contains("Screen: Dashboard"));
        assert!(prompt.contains("1. Drag the \"Revenue\" widget"));
        assert!(prompt.contains("shows an error for an invalid email"));
        assert!(!prompt.contains("rejected"));
        assert_eq!(request.max_tokens, 1000);
        assert!(request.system_prompt.contains("exactly ONE test"));
    }

    #[test]
    fn request_uses_configured_exemplars_and_feedback() {
        let mut ctx = context();
        ctx.exemplars = vec!["test('house style', async () => {});".into()];
        let request = build_request(&case(), &ctx, Some("Your previous answer was rejected"), 1000);
        let prompt = &request.messages[0].content;
        assert!(prompt.contains("house style"));
        assert!(!prompt.contains("invalid email"));
        assert!(prompt.ends_with("Your previous answer was rejected\n"));
    }

    #[tokio::test]
    async fn service_accepts_and_prices_answer() {
        let usage = TokenUsage {
            input_tokens: 900,
            output_tokens: 500,
        };
        let (_, svc) =
            service(StubLlmClient::constant(VALID).with_usage("claude-haiku-4-5", usage));
        let refined = svc.refine_test(&case(), &context()).await.unwrap();
        assert_eq!(refined.code, VALID);
        assert_eq!(refined.model, "claude-haiku-4-5");
        assert_eq!(refined.tokens_used, 1400);
        assert_eq!(refined.attempts, 1);
        assert!((refined.cost - 0.0034).abs() < 1e-12);
    }

    #[tokio::test]
    async fn service_sends_feedback_and_accumulates_cost() {
        let usage = TokenUsage {
            input_tokens: 900,
            output_tokens: 500,
        };
        let (stub, svc) = service(
            StubLlmClient::new(vec![UNBALANCED.into(), VALID.into()])
                .with_usage("claude-haiku-4-5", usage),
        );
        let refined = svc.refine_test(&case(), &context()).await.unwrap();
        assert_eq!(refined.attempts, 2);
        assert_eq!(refined.tokens_used, 2800);
        assert!((refined.cost - 0.0068).abs() < 1e-12);

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].messages[0].content.contains("rejected"));
        assert!(requests[1].messages[0].content.contains("unclosed `{`"));
    }

    #[tokio::test]
    async fn service_retries_api_errors() {
        let (stub, svc) = service(StubLlmClient::scripted(vec![
            StubReply::Error("529 overloaded".into()),
            StubReply::Text(VALID.into()),
        ]));
        let refined = svc.refine_test(&case(), &context()).await.unwrap();
        assert_eq!(refined.attempts, 2);
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn service_gives_up_after_bounded_attempts() {
        let (stub, svc) = service(StubLlmClient::failing("connection refused"));
        let err = svc.refine_test(&case(), &context()).await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Api);
        assert_eq!(stub.call_count(), DEFAULT_MAX_ATTEMPTS as usize);
        assert!(err.message.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_api_errors() {
        let (stub, svc) = service(
            StubLlmClient::constant(VALID).with_delay(|_| Duration::from_secs(120)),
        );
        let svc = svc.with_timeout(Duration::from_secs(60)).with_max_attempts(2);
        let err = svc.refine_test(&case(), &context()).await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Api);
        assert!(err.message.contains("timed out"), "{}", err.message);
        assert_eq!(stub.call_count(), 2);
    }
}
