use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use specgen_core::catalog::TemplateCatalog;
use specgen_core::error::ParseError;
use specgen_core::naming;
use specgen_core::render::TemplateRenderer;
use specgen_core::selector::{TemplateMatchResult, TemplateSelector};
use specgen_core::spec::{self, TestCaseSpec, TestSpecDocument};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::GenerationConfig;
use crate::error::{GenerateError, LlmError};
use crate::llm::LlmClient;
use crate::metrics::GenerationMetrics;
use crate::refine::{RefinedTest, RefinementContext, RefinementService};
use crate::types::{
    GeneratedTest, GenerationErrorInfo, GenerationFailure, GenerationResult, GenerationSuccess,
    GenerationSummary, Origin,
};

/// First line of every generated file.
pub const PREAMBLE: &str = "import { test, expect } from '@playwright/test';";

/// How one case will be produced, without producing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CasePlan {
    pub case: String,
    pub route: Origin,
    #[serde(flatten)]
    pub selection: TemplateMatchResult,
}

type CaseOutcome = (usize, TestCaseSpec, TemplateMatchResult, Result<RefinedTest, LlmError>);

/// Cases that made it into the file, plus those dropped in partial mode.
struct Generated {
    path: PathBuf,
    tests: Vec<GeneratedTest>,
    failed_cases: Vec<String>,
}

/// Turns one spec file into one test file.
///
/// 1. Parse the spec and reject unknown template hints
/// 2. Create the output directory
/// 3. Select a template per case; render confident cases synchronously
/// 4. Refine the rest concurrently, bounded by `refinement.max_concurrency`
/// 5. Write all tests, in input order, to `<output_dir>/<screen><extension>`
pub struct Orchestrator {
    catalog: Arc<TemplateCatalog>,
    refiner: Arc<RefinementService>,
    config: GenerationConfig,
    metrics: Arc<GenerationMetrics>,
}

impl Orchestrator {
    pub fn new(
        catalog: TemplateCatalog,
        llm: Arc<dyn LlmClient>,
        config: GenerationConfig,
    ) -> Self {
        let refiner = RefinementService::new(llm, Arc::new(config.price_table()))
            .with_max_attempts(config.refinement.max_attempts)
            .with_timeout(config.refinement.timeout())
            .with_max_tokens(config.llm.max_tokens);
        Self {
            catalog: Arc::new(catalog),
            refiner: Arc::new(refiner),
            config,
            metrics: Arc::new(GenerationMetrics::new()),
        }
    }

    /// Share a metrics collector, e.g. one wired to a logging backend.
    pub fn with_metrics(mut self, metrics: Arc<GenerationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &GenerationMetrics {
        &self.metrics
    }

    fn selector(&self) -> TemplateSelector<'_> {
        TemplateSelector::new(&self.catalog).with_threshold(self.config.selection.threshold)
    }

    /// Template selection for every case, in document order.
    pub fn plan(&self, doc: &TestSpecDocument) -> Vec<CasePlan> {
        let selector = self.selector();
        doc.test_cases
            .iter()
            .map(|case| {
                let selection = selector.select(case);
                CasePlan {
                    case: case.name.clone(),
                    route: if selection.should_use_template {
                        Origin::Template
                    } else {
                        Origin::Llm
                    },
                    selection,
                }
            })
            .collect()
    }

    /// Every `templateHint` must name a catalog template.
    pub fn check_hints(&self, doc: &TestSpecDocument) -> Result<(), ParseError> {
        for case in &doc.test_cases {
            if let Some(hint) = case.template_hint.as_deref()
                && !self.catalog.contains(hint)
            {
                let known: Vec<&str> = self.catalog.iter().map(|t| t.id.as_str()).collect();
                return Err(ParseError::with_details(
                    format!("test case '{}' names unknown template '{hint}'", case.name),
                    format!("known templates: {}", known.join(", ")),
                ));
            }
        }
        Ok(())
    }

    pub async fn generate(
        &self,
        spec_path: &Path,
        output_dir: &Path,
        actor_id: &str,
    ) -> GenerationResult {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "generate",
            run_id = %run_id,
            actor_id,
            screen = tracing::field::Empty
        );

        async {
            self.metrics.record_document_started();
            tracing::info!(
                spec = %spec_path.display(),
                output_dir = %output_dir.display(),
                "Generation started"
            );

            match self.run(spec_path, output_dir, &run_id).await {
                Ok(generated) => {
                    let summary = GenerationSummary::from_tests(&generated.tests);
                    self.metrics.record_document_completed(summary.total_cost);
                    tracing::info!(
                        path = %generated.path.display(),
                        total_tests = summary.total_tests,
                        from_templates = summary.from_templates,
                        from_llm = summary.from_llm,
                        cost_usd = summary.total_cost,
                        failed_cases = generated.failed_cases.len(),
                        "Generation complete"
                    );
                    GenerationResult::Success(GenerationSuccess {
                        files_generated: vec![generated.path],
                        summary,
                        run_id: run_id.clone(),
                        actor_id: actor_id.to_string(),
                        generated_at: Utc::now(),
                        tests: generated.tests.iter().map(GeneratedTest::provenance).collect(),
                        failed_cases: generated.failed_cases,
                    })
                }
                Err(err) => {
                    self.metrics.record_document_failed(err.kind());
                    tracing::error!(kind = %err.kind(), error = %err, "Generation failed");
                    GenerationResult::Failure(GenerationFailure {
                        error: GenerationErrorInfo::from(&err),
                        run_id: run_id.clone(),
                        actor_id: actor_id.to_string(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        spec_path: &Path,
        output_dir: &Path,
        run_id: &str,
    ) -> Result<Generated, GenerateError> {
        let raw = tokio::fs::read_to_string(spec_path)
            .await
            .map_err(|source| GenerateError::Filesystem {
                action: "read spec",
                path: spec_path.to_path_buf(),
                source,
            })?;
        let doc = spec::parse_str(&raw)?;
        self.check_hints(&doc)?;
        tracing::Span::current().record("screen", doc.screen.as_str());

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| GenerateError::Filesystem {
                action: "create output directory",
                path: output_dir.to_path_buf(),
                source,
            })?;

        let plan = self.plan(&doc);
        let mut slots: Vec<Option<GeneratedTest>> = vec![None; doc.test_cases.len()];
        let mut pending = Vec::new();

        let renderer = TemplateRenderer::new(&self.catalog);
        for (index, (case, planned)) in doc.test_cases.iter().zip(plan).enumerate() {
            let selection = planned.selection;
            if selection.should_use_template {
                let code = renderer
                    .render(&selection.template, case)
                    .map_err(|source| GenerateError::Render {
                        case: case.name.clone(),
                        source,
                    })?;
                tracing::info!(
                    case = %case.name,
                    template = %selection.template,
                    score = selection.score,
                    "Rendered from template"
                );
                self.metrics.record_template_render();
                slots[index] = Some(GeneratedTest::from_template(&case.name, code, selection));
            } else {
                tracing::info!(
                    case = %case.name,
                    template = %selection.template,
                    score = selection.score,
                    "Escalating to LLM"
                );
                pending.push((index, case.clone(), selection));
            }
        }

        let mut failed_cases = Vec::new();
        if !pending.is_empty() {
            let context = Arc::new(RefinementContext {
                screen: doc.screen.clone(),
                screen_description: doc.description.clone(),
                exemplars: self.load_exemplars().await?,
            });
            failed_cases = self.refine_pending(pending, context, &mut slots).await?;
        }

        let tests: Vec<GeneratedTest> = slots.into_iter().flatten().collect();
        let file_name = naming::file_name_for(&doc.screen, &self.config.output.extension);
        let path = output_dir.join(file_name);
        write_test_file(&path, &tests, run_id).await?;

        Ok(Generated {
            path,
            tests,
            failed_cases,
        })
    }

    /// Run LLM cases concurrently and fill their slots. Returns the names of
    /// cases dropped in partial-success mode.
    async fn refine_pending(
        &self,
        pending: Vec<(usize, TestCaseSpec, TemplateMatchResult)>,
        context: Arc<RefinementContext>,
        slots: &mut [Option<GeneratedTest>],
    ) -> Result<Vec<String>, GenerateError> {
        let partial = self.config.generation.partial_success;
        // A zero limit would never hand out a permit.
        let permits = self.config.refinement.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks: JoinSet<CaseOutcome> = JoinSet::new();

        for (index, case, selection) in pending {
            let refiner = Arc::clone(&self.refiner);
            let context = Arc::clone(&context);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(
                async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => refiner.refine_test(&case, &context).await,
                        Err(_) => Err(LlmError {
                            kind: crate::error::LlmErrorKind::Api,
                            message: "refinement cancelled".into(),
                            details: vec![],
                        }),
                    };
                    (index, case, selection, result)
                }
                .in_current_span(),
            );
        }

        let mut failed: Vec<(usize, String)> = Vec::new();
        let mut first_failure: Option<GenerateError> = None;

        while let Some(joined) = tasks.join_next().await {
            let (index, case, selection, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tasks.abort_all();
                    return Err(GenerateError::Task {
                        reason: e.to_string(),
                    });
                }
            };
            match result {
                Ok(refined) => {
                    self.metrics.record_refinement(refined.attempts, refined.cost);
                    slots[index] = Some(GeneratedTest::from_llm(&case.name, refined, selection));
                }
                Err(source) => {
                    self.metrics.record_refinement_failure();
                    let err = GenerateError::Refinement {
                        case: case.name.clone(),
                        source,
                    };
                    if !partial {
                        tasks.abort_all();
                        return Err(err);
                    }
                    tracing::warn!(case = %case.name, error = %err, "Dropping failed case");
                    failed.push((index, case.name));
                    first_failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_failure
            && slots.iter().all(Option::is_none)
        {
            return Err(err);
        }

        failed.sort_by_key(|(index, _)| *index);
        Ok(failed.into_iter().map(|(_, name)| name).collect())
    }

    /// Existing tests used as prompt exemplars, sorted by file name.
    async fn load_exemplars(&self) -> Result<Vec<String>, GenerateError> {
        let Some(dir) = self.config.refinement.exemplar_dir.as_deref() else {
            return Ok(Vec::new());
        };
        let read_err = |source| GenerateError::Filesystem {
            action: "read exemplar directory",
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let path = entry.path();
            let is_test = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&self.config.output.extension));
            if is_test {
                files.push(path);
            }
        }
        files.sort();
        files.truncate(self.config.refinement.max_exemplars);

        let mut exemplars = Vec::with_capacity(files.len());
        for path in files {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| GenerateError::Filesystem {
                    action: "read exemplar",
                    path: path.clone(),
                    source,
                })?;
            exemplars.push(content);
        }
        tracing::debug!(count = exemplars.len(), dir = %dir.display(), "Loaded exemplars");
        Ok(exemplars)
    }
}

/// File contents: preamble, then each test separated by a blank line.
pub fn assemble_file(tests: &[GeneratedTest]) -> String {
    let mut out = String::from(PREAMBLE);
    for test in tests {
        out.push_str("\n\n");
        out.push_str(test.code.trim_end());
    }
    out.push('\n');
    out
}

/// Write via a sibling temp file renamed into place, so readers never see a
/// half-written file.
async fn write_test_file(
    path: &Path,
    tests: &[GeneratedTest],
    run_id: &str,
) -> Result<(), GenerateError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{run_id}.tmp"));

    if let Err(source) = tokio::fs::write(&tmp, assemble_file(tests)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(GenerateError::Filesystem {
            action: "write",
            path: tmp,
            source,
        });
    }

    if let Err(source) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(GenerateError::Filesystem {
            action: "write",
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::llm::StubLlmClient;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            TemplateCatalog::builtin(),
            Arc::new(StubLlmClient::constant("unused")),
            GenerationConfig::default(),
        )
    }

    fn doc(yaml: &str) -> TestSpecDocument {
        spec::parse_str(yaml).unwrap()
    }

    #[test]
    fn plan_reports_selection_per_case() {
        let d = doc(r#"
screen: Projects
description: Project list
testCases:
  - name: Create a new project
    steps:
      - Navigate to /projects
      - Click the "New Project" button
      - Fill "Name" with "Apollo"
      - Click the "Save" button
    assertions:
      - '"Apollo" is visible in the project list'
      - Success message "Project created" is shown
  - name: Reorder widgets by dragging
    steps:
      - Drag the "Revenue" widget onto the "Top" slot
    assertions:
      - The layout persists after reload
"#);
        let plan = orchestrator().plan(&d);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].case, "Create a new project");
        assert!(plan[0].selection.should_use_template);
        assert!(!plan[1].selection.should_use_template);

        let json = serde_json::to_value(&plan[0]).unwrap();
        assert_eq!(json["template"], "crud-operations");
        assert_eq!(json["shouldUseTemplate"], true);
        assert_eq!(json["route"], "template");
        assert_eq!(plan[1].route, Origin::Llm);
    }

    #[test]
    fn unknown_hint_is_rejected() {
        let d = doc(r#"
screen: Projects
description: x
testCases:
  - name: a
    templateHint: drag-and-drop
    steps: [Click "x"]
    assertions: ['"x" is visible']
"#);
        let err = orchestrator().check_hints(&d).unwrap_err();
        assert!(err.message.contains("drag-and-drop"));
        assert!(err.details.unwrap().contains("crud-operations"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_write_removes_temp_file() {
        if !Path::new("/dev/full").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.spec.ts");
        // Writes through this link fail with ENOSPC.
        let tmp = dir.path().join(".projects.spec.ts.run-1.tmp");
        std::os::unix::fs::symlink("/dev/full", &tmp).unwrap();

        let err = write_test_file(&path, &[], "run-1").await.unwrap_err();
        assert!(matches!(err, GenerateError::Filesystem { action: "write", .. }));
        assert!(std::fs::symlink_metadata(&tmp).is_err(), "temp file left behind");
        assert!(!path.exists());
    }

    #[test]
    fn assembled_file_has_preamble_and_blank_line_separators() {
        let selection = TemplateMatchResult {
            template: "crud-operations".into(),
            score: 1.0,
            should_use_template: true,
            matched_keywords: BTreeSet::new(),
            hinted: false,
        };
        let tests = vec![
            GeneratedTest::from_template(
                "a",
                "test('a', async () => {});\n".into(),
                selection.clone(),
            ),
            GeneratedTest::from_template("b", "test('b', async () => {});".into(), selection),
        ];
        assert_eq!(
            assemble_file(&tests),
            "import { test, expect } from '@playwright/test';\n\ntest('a', async () => {});\n\ntest('b', async () => {});\n"
        );
    }
}
