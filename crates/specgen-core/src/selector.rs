use std::collections::BTreeSet;

use serde::Serialize;

use crate::catalog::{TemplateCatalog, TemplateDescriptor, normalize};
use crate::render;
use crate::spec::TestCaseSpec;

/// Confidence at or above which a case is rendered from its template.
pub const DEFAULT_THRESHOLD: f64 = 0.7;

/// Share of the score contributed by keyword evidence; the rest comes from how
/// many step and assertion lines the template explains.
const KEYWORD_SHARE: f64 = 0.5;

type Candidate<'a> = (&'a TemplateDescriptor, f64, BTreeSet<String>);

/// Best template for one test case and how confident the selector is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMatchResult {
    /// Best-matching template id. Empty only when the catalog is empty.
    pub template: String,
    pub score: f64,
    pub should_use_template: bool,
    /// Keywords that contributed to the score. Informational only.
    pub matched_keywords: BTreeSet<String>,
    /// True when the case's `templateHint` picked the template.
    pub hinted: bool,
}

/// Scores test cases against a catalog. Pure: no I/O, no interior state.
#[derive(Debug, Clone, Copy)]
pub struct TemplateSelector<'a> {
    catalog: &'a TemplateCatalog,
    threshold: f64,
}

impl<'a> TemplateSelector<'a> {
    pub fn new(catalog: &'a TemplateCatalog) -> Self {
        Self {
            catalog,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn select(&self, case: &TestCaseSpec) -> TemplateMatchResult {
        if let Some(hint) = case.template_hint.as_deref() {
            if let Some(template) = self.catalog.get(hint) {
                let (score, matched_keywords) = score_template(template, case);
                tracing::debug!(
                    case = %case.name,
                    template = hint,
                    score,
                    "Template forced by hint"
                );
                return TemplateMatchResult {
                    template: template.id.clone(),
                    score,
                    should_use_template: true,
                    matched_keywords,
                    hinted: true,
                };
            }
            // Callers that need strict hints validate them up front.
            tracing::warn!(
                case = %case.name,
                hint,
                "Template hint names no catalog template; falling back to scoring"
            );
        }

        // Templates the case cannot fill are never chosen for rendering; the
        // best of them is reported only when nothing else is fillable.
        let mut best: Option<Candidate<'_>> = None;
        let mut best_unfillable: Option<Candidate<'_>> = None;
        for template in self.catalog.iter() {
            let (score, matched) = score_template(template, case);
            let slot = if render::can_fill(template, case) {
                &mut best
            } else {
                tracing::debug!(
                    case = %case.name,
                    template = %template.id,
                    score,
                    "Template cannot be filled from this case"
                );
                &mut best_unfillable
            };
            // Strictly greater: ties go to the earlier catalog entry.
            if slot.as_ref().is_none_or(|(_, s, _)| score > *s) {
                *slot = Some((template, score, matched));
            }
        }

        let chosen = match best {
            Some(candidate) => Some((candidate, true)),
            None => best_unfillable.map(|candidate| (candidate, false)),
        };
        match chosen {
            Some(((template, score, matched_keywords), fillable)) => {
                let should_use_template = fillable && score >= self.threshold;
                tracing::debug!(
                    case = %case.name,
                    template = %template.id,
                    score,
                    should_use_template,
                    "Template selected"
                );
                TemplateMatchResult {
                    template: template.id.clone(),
                    score,
                    should_use_template,
                    matched_keywords,
                    hinted: false,
                }
            }
            None => TemplateMatchResult {
                template: String::new(),
                score: 0.0,
                should_use_template: false,
                matched_keywords: BTreeSet::new(),
                hinted: false,
            },
        }
    }
}

/// Score one template against one case, returning the score in [0, 1] and the
/// keywords that matched anywhere in the case's name, steps or assertions.
pub fn score_template(
    template: &TemplateDescriptor,
    case: &TestCaseSpec,
) -> (f64, BTreeSet<String>) {
    let name = normalize(&case.name);
    let lines: Vec<String> = case.lines().map(normalize).collect();

    let mut matched = BTreeSet::new();
    let mut weight = 0.0;
    for keyword in &template.keywords {
        if (keyword.matches(&name) || lines.iter().any(|l| keyword.matches(l)))
            && matched.insert(keyword.phrase.clone())
        {
            weight += keyword.weight;
        }
    }

    let covered = lines
        .iter()
        .filter(|l| template.keywords.iter().any(|k| k.matches(l)))
        .count();
    let coverage = if lines.is_empty() {
        0.0
    } else {
        covered as f64 / lines.len() as f64
    };

    let evidence = (weight / template.saturation).min(1.0);
    let score = KEYWORD_SHARE * evidence + (1.0 - KEYWORD_SHARE) * coverage;
    (score.clamp(0.0, 1.0), matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str, steps: &[&str], assertions: &[&str]) -> TestCaseSpec {
        TestCaseSpec {
            name: name.into(),
            description: String::new(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            assertions: assertions.iter().map(|s| s.to_string()).collect(),
            template_hint: None,
        }
    }

    fn crud_case() -> TestCaseSpec {
        case(
            "Create a new project",
            &[
                "Navigate to /projects",
                "Click the \"New Project\" button",
                "Fill \"Name\" with \"Apollo\"",
                "Click the \"Save\" button",
            ],
            &[
                "\"Apollo\" is visible in the project list",
                "Success message \"Project created\" is shown",
            ],
        )
    }

    fn unusual_case() -> TestCaseSpec {
        case(
            "Reorder widgets by dragging",
            &[
                "Drag the \"Revenue\" widget onto the \"Top\" slot",
                "Wait for the layout animation to finish",
            ],
            &[
                "\"Revenue\" widget appears first in the grid",
                "The layout persists after reload",
            ],
        )
    }

    #[test]
    fn crud_case_selects_crud_template() {
        let catalog = TemplateCatalog::builtin();
        let result = TemplateSelector::new(&catalog).select(&crud_case());
        assert_eq!(result.template, "crud-operations");
        assert!(result.score >= DEFAULT_THRESHOLD, "score was {}", result.score);
        assert!(result.should_use_template);
        assert!(result.matched_keywords.contains("save"));
        assert!(!result.hinted);
    }

    #[test]
    fn unusual_case_falls_below_threshold() {
        let catalog = TemplateCatalog::builtin();
        let result = TemplateSelector::new(&catalog).select(&unusual_case());
        assert!(result.score < DEFAULT_THRESHOLD, "score was {}", result.score);
        assert!(!result.should_use_template);
    }

    #[test]
    fn selection_is_deterministic() {
        let catalog = TemplateCatalog::builtin();
        let selector = TemplateSelector::new(&catalog);
        let first = selector.select(&crud_case());
        for _ in 0..10 {
            assert_eq!(selector.select(&crud_case()), first);
        }
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let catalog = TemplateCatalog::builtin();
        for c in [crud_case(), unusual_case()] {
            for template in catalog.iter() {
                let (score, _) = score_template(template, &c);
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }

    #[test]
    fn hint_forces_template_regardless_of_score() {
        let catalog = TemplateCatalog::builtin();
        let mut c = unusual_case();
        c.template_hint = Some("modal-dialog".into());
        let result = TemplateSelector::new(&catalog).select(&c);
        assert_eq!(result.template, "modal-dialog");
        assert!(result.should_use_template);
        assert!(result.hinted);
        assert!(result.score < DEFAULT_THRESHOLD);
    }

    #[test]
    fn unknown_hint_falls_back_to_scoring() {
        let catalog = TemplateCatalog::builtin();
        let mut c = crud_case();
        c.template_hint = Some("does-not-exist".into());
        let result = TemplateSelector::new(&catalog).select(&c);
        assert_eq!(result.template, "crud-operations");
        assert!(!result.hinted);
    }

    #[test]
    fn threshold_is_configurable() {
        let catalog = TemplateCatalog::builtin();
        let strict = TemplateSelector::new(&catalog).with_threshold(0.95);
        assert!(!strict.select(&crud_case()).should_use_template);
        let reload = case(
            "Reload the dashboard",
            &["Navigate to /dashboard", "Drag the \"Revenue\" widget onto the \"Top\" slot"],
            &["The layout persists after reload"],
        );
        let default = TemplateSelector::new(&catalog).select(&reload);
        assert_eq!(default.template, "navigation");
        assert!(!default.should_use_template, "score was {}", default.score);
        let lax = TemplateSelector::new(&catalog).with_threshold(0.1);
        assert!(lax.select(&reload).should_use_template);
    }

    #[test]
    fn navigation_case_without_url_goes_to_llm() {
        let catalog = TemplateCatalog::builtin();
        let c = case(
            "Go home via breadcrumb",
            &["Navigate to the settings page", "Click the \"Home\" breadcrumb link"],
            &["The page title is \"Home\""],
        );
        assert!(score_template(catalog.get("navigation").unwrap(), &c).0 >= DEFAULT_THRESHOLD);

        let result = TemplateSelector::new(&catalog).select(&c);
        assert_ne!(result.template, "navigation");
        assert!(!result.should_use_template);
    }

    #[test]
    fn crud_case_without_crud_verb_goes_to_llm() {
        let catalog = TemplateCatalog::builtin();
        let c = case(
            "Persist profile changes",
            &["Click the \"Save\" button"],
            &[
                "\"Profile saved\" is visible",
                "The record list shows the updated record",
            ],
        );
        assert!(score_template(catalog.get("crud-operations").unwrap(), &c).0 >= DEFAULT_THRESHOLD);

        let result = TemplateSelector::new(&catalog).select(&c);
        assert_ne!(result.template, "crud-operations");
        assert!(!result.should_use_template);
    }

    #[test]
    fn unfillable_template_reported_when_nothing_fits() {
        let catalog = TemplateCatalog::new(vec![TemplateDescriptor::new(
            "needs-url",
            "",
            &["click"],
            "await page.goto('{{start_url}}');\n{{steps}}",
        )]);
        let result = TemplateSelector::new(&catalog)
            .with_threshold(0.1)
            .select(&case("x", &["click it"], &["done"]));
        assert_eq!(result.template, "needs-url");
        assert!(!result.should_use_template);
    }

    #[test]
    fn ties_resolve_to_catalog_order() {
        let catalog = TemplateCatalog::new(vec![
            TemplateDescriptor::new("first", "", &["click"], "{{steps}}"),
            TemplateDescriptor::new("second", "", &["click"], "{{steps}}"),
        ]);
        let result = TemplateSelector::new(&catalog).select(&case("x", &["click it"], &["done"]));
        assert_eq!(result.template, "first");
    }

    #[test]
    fn synthetic_catalog_full_match_scores_one() {
        let catalog = TemplateCatalog::new(vec![
            TemplateDescriptor::new("only", "", &["alpha", "beta"], "{{steps}}")
                .with_saturation(2.0),
        ]);
        let result = TemplateSelector::new(&catalog).select(&case("x", &["alpha"], &["beta"]));
        assert!((result.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_catalog_never_uses_templates() {
        let catalog = TemplateCatalog::default();
        let result = TemplateSelector::new(&catalog).select(&crud_case());
        assert!(!result.should_use_template);
        assert_eq!(result.score, 0.0);
    }
}
