use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

pub(crate) static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([a-z_]+)\}\}").expect("placeholder pattern is valid"));

/// Keyword weight that already counts as full keyword evidence for a template.
const DEFAULT_SATURATION: f64 = 3.0;

/// A characteristic word or phrase of a template.
///
/// Longer phrases are more specific and weigh more: 1.0 for one word, +0.5 per
/// extra word, capped at 2.0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Keyword {
    pub phrase: String,
    pub weight: f64,
    #[serde(skip)]
    needle: String,
}

impl Keyword {
    pub fn new(phrase: &str) -> Self {
        let needle = normalize(phrase);
        let words = needle.split_whitespace().count().max(1);
        let weight = (1.0 + 0.5 * (words as f64 - 1.0)).min(2.0);
        Self {
            phrase: phrase.to_lowercase(),
            weight,
            needle,
        }
    }

    /// True when the phrase occurs on word boundaries in normalized text.
    pub fn matches(&self, normalized: &str) -> bool {
        !self.needle.trim().is_empty() && normalized.contains(&self.needle)
    }
}

/// Lowercase, collapse every non-alphanumeric run into one space, and pad with
/// a space on each side so that substring checks respect word boundaries.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with(' ') {
            out.push(' ');
        }
    }
    if !out.ends_with(' ') {
        out.push(' ');
    }
    out
}

/// A catalog entry: identifier, scoring keywords and a parameterized body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateDescriptor {
    pub id: String,
    pub description: String,
    pub keywords: Vec<Keyword>,
    /// Keyword weight at which keyword evidence is considered complete.
    pub saturation: f64,
    #[serde(skip)]
    pub body: String,
}

impl TemplateDescriptor {
    pub fn new(id: &str, description: &str, keywords: &[&str], body: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            keywords: keywords.iter().map(|k| Keyword::new(k)).collect(),
            saturation: DEFAULT_SATURATION,
            body: body.into(),
        }
    }

    pub fn with_saturation(mut self, saturation: f64) -> Self {
        self.saturation = saturation.max(f64::EPSILON);
        self
    }

    /// Placeholder names used by the body, e.g. `steps` for `{{steps}}`.
    pub fn placeholders(&self) -> BTreeSet<String> {
        PLACEHOLDER
            .captures_iter(&self.body)
            .map(|c| c[1].to_string())
            .collect()
    }
}

/// Immutable set of templates handed to the selector and renderer.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: Vec<TemplateDescriptor>,
}

impl TemplateCatalog {
    /// Build a catalog from explicit templates. Later entries with an id that
    /// is already present are dropped.
    pub fn new(templates: Vec<TemplateDescriptor>) -> Self {
        let mut seen = BTreeSet::new();
        let templates = templates
            .into_iter()
            .filter(|t| {
                let fresh = seen.insert(t.id.clone());
                if !fresh {
                    tracing::warn!(template = %t.id, "Duplicate template id ignored");
                }
                fresh
            })
            .collect();
        Self { templates }
    }

    /// The built-in Playwright templates.
    pub fn builtin() -> Self {
        Self::new(vec![
            TemplateDescriptor::new(
                "crud-operations",
                "Create, edit or delete a record and verify the result",
                &[
                    "create", "created", "add", "added", "new", "edit", "edited", "update",
                    "updated", "delete", "deleted", "remove", "removed", "save", "saved",
                    "list", "record", "rename",
                ],
                CRUD_BODY,
            ),
            TemplateDescriptor::new(
                "form-submission",
                "Fill in a form, submit it and check validation or success",
                &[
                    "fill", "form", "submit", "submitted", "enter", "field", "required",
                    "validation", "invalid", "error message", "success message", "select",
                    "check", "input",
                ],
                FORM_BODY,
            ),
            TemplateDescriptor::new(
                "navigation",
                "Move between pages and verify where the user ends up",
                &[
                    "navigate", "go to", "visit", "url", "redirected", "redirect", "link",
                    "breadcrumb", "back", "menu", "tab", "heading", "page title", "reload",
                ],
                NAVIGATION_BODY,
            ),
            TemplateDescriptor::new(
                "authentication",
                "Log in, log out or register and verify session state",
                &[
                    "log in", "login", "logged in", "log out", "logout", "sign in", "sign out",
                    "sign up", "register", "password", "username", "email", "credentials",
                    "session",
                ],
                AUTH_BODY,
            ),
            TemplateDescriptor::new(
                "search-filter",
                "Search or filter a collection and verify the visible results",
                &[
                    "search", "filter", "filtered", "query", "results", "no results", "sort",
                    "sorted", "matching", "clear filter",
                ],
                SEARCH_BODY,
            ),
            TemplateDescriptor::new(
                "modal-dialog",
                "Open, confirm or dismiss a modal dialog",
                &[
                    "modal", "dialog", "popup", "confirm", "confirmation", "cancel", "close",
                    "closed", "dismiss", "overlay",
                ],
                MODAL_BODY,
            ),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&TemplateDescriptor> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TemplateDescriptor> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

const CRUD_BODY: &str = r#"test('{{test_name}}', async ({ page }) => {
  // {{description}}
  await test.step('{{action}} {{entity}}', async () => {
    {{steps}}
  });

  await test.step('verify {{entity}}', async () => {
    {{assertions}}
  });
});"#;

const FORM_BODY: &str = r#"test('{{test_name}}', async ({ page }) => {
  // {{description}}
  await test.step('fill in and submit the form', async () => {
    {{steps}}
  });

  await test.step('check the outcome', async () => {
    {{assertions}}
  });
});"#;

const NAVIGATION_BODY: &str = r#"test('{{test_name}}', async ({ page }) => {
  // {{description}}
  await page.goto('{{start_url}}');
  {{steps}}

  {{assertions}}
});"#;

const AUTH_BODY: &str = r#"test('{{test_name}}', async ({ page }) => {
  // {{description}}
  await test.step('authenticate', async () => {
    {{steps}}
  });

  {{assertions}}
});"#;

const SEARCH_BODY: &str = r#"test('{{test_name}}', async ({ page }) => {
  // {{description}}
  await test.step('search for {{query}}', async () => {
    {{steps}}
  });

  {{assertions}}
});"#;

const MODAL_BODY: &str = r#"test('{{test_name}}', async ({ page }) => {
  // {{description}}
  await test.step('use the {{dialog_name}} dialog', async () => {
    {{steps}}
  });

  {{assertions}}
});"#;
