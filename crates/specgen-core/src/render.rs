use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::{PLACEHOLDER, TemplateCatalog, TemplateDescriptor, normalize};
use crate::error::RenderError;
use crate::spec::TestCaseSpec;

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).expect("step pattern is valid"));
    };
}

pattern!(QUOTED, r#""([^"]*)""#);
pattern!(
    NAVIGATE,
    r#"(?i)^(?:(?:navigate|go|browse)\s+to|visit|open)\s+(?:the\s+)?(?:page\s+)?"?((?:https?://|/)[^\s"]*)"?"#
);
pattern!(PRESS, r#"(?i)^press\s+(?:the\s+)?"?([A-Za-z0-9+]+)"?(?:\s+key)?\s*\.?$"#);
pattern!(
    CLICK,
    r#"(?i)^(?:click|tap|press)\s+(?:on\s+)?(?:the\s+)?"([^"]+)"(?:\s+(button|link|tab|checkbox|menu item|option))?"#
);
pattern!(
    FILL,
    r#"(?i)^fill(?:\s+in)?\s+(?:the\s+)?"([^"]+)"(?:\s+field)?\s+with\s+"([^"]*)""#
);
pattern!(
    TYPE_INTO,
    r#"(?i)^(?:enter|type|input)\s+"([^"]*)"\s+(?:in|into)\s+(?:the\s+)?"([^"]+)""#
);
pattern!(
    SELECT,
    r#"(?i)^(?:select|choose)\s+"([^"]+)"\s+(?:from|in)\s+(?:the\s+)?"([^"]+)""#
);
pattern!(CHECK, r#"(?i)^(check|uncheck)\s+(?:the\s+)?"([^"]+)""#);
pattern!(WAIT_FOR, r#"(?i)^wait\s+(?:for|until)\s+(?:the\s+)?"([^"]+)""#);

pattern!(TITLE, r#"(?i)\btitle\s+(?:is|should be|equals|reads)\s+"([^"]+)""#);
pattern!(
    STATE,
    r#"(?i)"([^"]+)"\s+(?:button\s+)?(?:is|should be|becomes)\s+(disabled|enabled)"#
);
pattern!(
    FIELD_VALUE,
    r#"(?i)"([^"]+)"\s+(?:field\s+)?(?:has value|has the value|value is|contains the value)\s+"([^"]*)""#
);
pattern!(CHECKED, r#"(?i)"([^"]+)"\s+is\s+(checked|unchecked)"#);
pattern!(COUNT, r#"(?i)\b(\d+)\s+(rows?|items?|results?|entries|cards?)\b"#);
pattern!(
    URL,
    r#"(?i)\b(?:url|redirected|navigated|taken)\b.*?(https?://[^\s"]+|/[\w\-./?=&%]*)"#
);
pattern!(
    HIDDEN,
    r#"(?i)\bnot\s+(?:be\s+)?(?:visible|shown|displayed)\b|\bisn't\s+(?:visible|shown|displayed)\b|\bno\s+longer\s+(?:visible|shown|displayed)\b|\bhidden\b|\bdisappears?\b|\bshould\s+not\s+see\b|\bdoes\s+not\s+(?:show|display|appear)\b"#
);
pattern!(DIALOG_NAME, r#"(?i)"([^"]+)"\s+(?:dialog|modal)\b"#);

const CRUD_VERBS: &[(&str, &str)] = &[
    ("create", "create"),
    ("add", "create"),
    ("edit", "update"),
    ("update", "update"),
    ("rename", "update"),
    ("delete", "delete"),
    ("remove", "delete"),
];
const ENTITY_SKIP: &[&str] = &["a", "an", "the", "new", "existing", "some", "this", "that", "my"];
const ENTITY_STOP: &[&str] = &[
    "from", "in", "on", "to", "with", "for", "and", "via", "using", "by", "at", "into", "as",
    "then",
];
const DEFAULT_DIALOG_NAME: &str = "modal";

/// Substitutes values extracted from a test case into a catalog template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateRenderer<'a> {
    catalog: &'a TemplateCatalog,
}

impl<'a> TemplateRenderer<'a> {
    pub fn new(catalog: &'a TemplateCatalog) -> Self {
        Self { catalog }
    }

    /// Render the complete source of one test.
    ///
    /// A `{{name}}` alone on its line expands to one line per statement, each
    /// carrying that line's indentation; an empty expansion drops the line.
    pub fn render(&self, template_id: &str, case: &TestCaseSpec) -> Result<String, RenderError> {
        let template = self
            .catalog
            .get(template_id)
            .ok_or_else(|| RenderError::UnknownTemplate(template_id.into()))?;

        let mut values: BTreeMap<String, String> = BTreeMap::new();
        let mut consumed_step = None;
        for name in template.placeholders() {
            if is_list_placeholder(&name) {
                continue;
            }
            let (value, consumed) =
                placeholder_value(&name, case).ok_or_else(|| RenderError::MissingPlaceholder {
                    template: template.id.clone(),
                    placeholder: name.clone(),
                    case: case.name.clone(),
                })?;
            consumed_step = consumed.or(consumed_step);
            values.insert(name, value);
        }

        let steps: Vec<String> = case
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != consumed_step)
            .map(|(_, step)| {
                translate_step(step).unwrap_or_else(|| {
                    tracing::debug!(case = %case.name, step = %step, "Step kept as comment");
                    format!("// {}", single_line(step))
                })
            })
            .collect();
        let assertions: Vec<String> = case
            .assertions
            .iter()
            .map(|assertion| {
                translate_assertion(assertion).unwrap_or_else(|| {
                    tracing::debug!(
                        case = %case.name,
                        assertion = %assertion,
                        "Assertion kept as comment"
                    );
                    format!("// expect: {}", single_line(assertion))
                })
            })
            .collect();
        values.insert("steps".into(), steps.join("\n"));
        values.insert("assertions".into(), assertions.join("\n"));

        let mut out: Vec<String> = Vec::new();
        for line in template.body.lines() {
            let trimmed = line.trim();
            if let Some(caps) = PLACEHOLDER.captures(trimmed)
                && caps[0].len() == trimmed.len()
            {
                let indent = &line[..line.len() - line.trim_start().len()];
                let value = values.get(&caps[1]).map(String::as_str).unwrap_or_default();
                out.extend(value.lines().map(|v| format!("{indent}{v}")));
                continue;
            }
            let replaced = PLACEHOLDER.replace_all(line, |caps: &regex::Captures<'_>| {
                values.get(&caps[1]).cloned().unwrap_or_default()
            });
            out.push(replaced.into_owned());
        }

        Ok(out.join("\n"))
    }
}

/// True when every placeholder of `template` can be filled from `case`.
pub fn can_fill(template: &TemplateDescriptor, case: &TestCaseSpec) -> bool {
    template
        .placeholders()
        .iter()
        .all(|name| is_list_placeholder(name) || placeholder_value(name, case).is_some())
}

fn is_list_placeholder(name: &str) -> bool {
    name == "steps" || name == "assertions"
}

/// Value for a single-line placeholder, plus the index of a step it replaces.
fn placeholder_value(name: &str, case: &TestCaseSpec) -> Option<(String, Option<usize>)> {
    match name {
        "test_name" => Some((js_string(&case.name), None)),
        "description" => {
            let text = if case.description.is_empty() {
                &case.name
            } else {
                &case.description
            };
            Some((single_line(text), None))
        }
        "action" => crud_target(case).map(|(action, _)| (action.to_string(), None)),
        "entity" => crud_target(case).map(|(_, entity)| (js_string(&entity), None)),
        "start_url" => start_url(case).map(|(index, url)| (js_string(&url), Some(index))),
        "query" => search_query(case).map(|q| (js_string(&q), None)),
        "dialog_name" => {
            let name = dialog_name(case).unwrap_or_else(|| DEFAULT_DIALOG_NAME.into());
            Some((js_string(&name), None))
        }
        _ => None,
    }
}

/// Playwright statement for an imperative step, if the step is recognized.
pub fn translate_step(step: &str) -> Option<String> {
    let step = step.trim();

    if let Some(c) = NAVIGATE.captures(step) {
        return Some(format!("await page.goto('{}');", js_string(&c[1])));
    }
    if let Some(c) = PRESS.captures(step) {
        return Some(format!("await page.keyboard.press('{}');", js_string(&c[1])));
    }
    if let Some(c) = CLICK.captures(step) {
        let name = js_string(&c[1]);
        return Some(match c.get(2).map(|m| m.as_str().to_lowercase()) {
            Some(role) => format!(
                "await page.getByRole('{}', {{ name: '{name}' }}).click();",
                role.replace(' ', "")
            ),
            None => format!("await page.getByText('{name}').click();"),
        });
    }
    if let Some(c) = FILL.captures(step) {
        return Some(format!(
            "await page.getByLabel('{}').fill('{}');",
            js_string(&c[1]),
            js_string(&c[2])
        ));
    }
    if let Some(c) = TYPE_INTO.captures(step) {
        return Some(format!(
            "await page.getByLabel('{}').fill('{}');",
            js_string(&c[2]),
            js_string(&c[1])
        ));
    }
    if let Some(c) = SELECT.captures(step) {
        return Some(format!(
            "await page.getByLabel('{}').selectOption('{}');",
            js_string(&c[2]),
            js_string(&c[1])
        ));
    }
    if let Some(c) = CHECK.captures(step) {
        return Some(format!(
            "await page.getByLabel('{}').{}();",
            js_string(&c[2]),
            c[1].to_lowercase()
        ));
    }
    if let Some(c) = WAIT_FOR.captures(step) {
        return Some(format!(
            "await expect(page.getByText('{}')).toBeVisible();",
            js_string(&c[1])
        ));
    }
    None
}

/// Playwright `expect` statement for an expectation, if recognized.
pub fn translate_assertion(assertion: &str) -> Option<String> {
    let assertion = assertion.trim();

    if let Some(c) = TITLE.captures(assertion) {
        return Some(format!("await expect(page).toHaveTitle('{}');", js_string(&c[1])));
    }
    if let Some(c) = STATE.captures(assertion) {
        let matcher = if c[2].eq_ignore_ascii_case("disabled") {
            "toBeDisabled"
        } else {
            "toBeEnabled"
        };
        return Some(format!(
            "await expect(page.getByRole('button', {{ name: '{}' }})).{matcher}();",
            js_string(&c[1])
        ));
    }
    if let Some(c) = FIELD_VALUE.captures(assertion) {
        return Some(format!(
            "await expect(page.getByLabel('{}')).toHaveValue('{}');",
            js_string(&c[1]),
            js_string(&c[2])
        ));
    }
    if let Some(c) = CHECKED.captures(assertion) {
        let matcher = if c[2].eq_ignore_ascii_case("checked") {
            "toBeChecked()"
        } else {
            "not.toBeChecked()"
        };
        return Some(format!(
            "await expect(page.getByLabel('{}')).{matcher};",
            js_string(&c[1])
        ));
    }
    if let Some(c) = COUNT.captures(assertion) {
        let role = if c[2].to_lowercase().starts_with("row") {
            "row"
        } else {
            "listitem"
        };
        return Some(format!(
            "await expect(page.getByRole('{role}')).toHaveCount({});",
            &c[1]
        ));
    }
    if let Some(c) = URL.captures(assertion) {
        return Some(format!(
            "await expect(page).toHaveURL(/{}/);",
            regex_literal(&c[1])
        ));
    }
    if let Some(c) = QUOTED.captures(assertion) {
        let text = js_string(&c[1]);
        let matcher = if HIDDEN.is_match(assertion) {
            "toBeHidden"
        } else {
            "toBeVisible"
        };
        return Some(format!("await expect(page.getByText('{text}')).{matcher}();"));
    }
    None
}

/// Escape for a single-quoted JavaScript string literal.
pub fn js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Escape for the body of a JavaScript regex literal.
fn regex_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        if "\\^$.|?*+()[]{}/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// CRUD action and the entity it applies to, from the name or the steps.
fn crud_target(case: &TestCaseSpec) -> Option<(&'static str, String)> {
    let texts = std::iter::once(case.name.as_str()).chain(case.steps.iter().map(String::as_str));
    for text in texts {
        let normalized = normalize(text);
        let words: Vec<&str> = normalized.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            let Some((_, action)) = CRUD_VERBS.iter().find(|(verb, _)| verb == word) else {
                continue;
            };
            let entity: Vec<&str> = words[i + 1..]
                .iter()
                .copied()
                .skip_while(|w| ENTITY_SKIP.contains(w))
                .take_while(|w| !ENTITY_STOP.contains(w))
                .take(2)
                .collect();
            if !entity.is_empty() {
                return Some((action, entity.join(" ")));
            }
        }
    }
    None
}

fn start_url(case: &TestCaseSpec) -> Option<(usize, String)> {
    case.steps
        .iter()
        .enumerate()
        .find_map(|(i, step)| NAVIGATE.captures(step.trim()).map(|c| (i, c[1].to_string())))
}

fn search_query(case: &TestCaseSpec) -> Option<String> {
    case.steps.iter().find_map(|step| {
        let normalized = normalize(step);
        let searching = [" search ", " filter ", " type "]
            .iter()
            .any(|k| normalized.contains(k));
        if !searching {
            return None;
        }
        let step = step.trim();
        let query = if let Some(c) = FILL.captures(step) {
            Some(c[2].to_string())
        } else if let Some(c) = TYPE_INTO.captures(step) {
            Some(c[1].to_string())
        } else {
            QUOTED.captures_iter(step).last().map(|c| c[1].to_string())
        };
        query.filter(|q| !q.is_empty())
    })
}

fn dialog_name(case: &TestCaseSpec) -> Option<String> {
    std::iter::once(case.name.as_str())
        .chain(case.lines())
        .find_map(|text| DIALOG_NAME.captures(text).map(|c| c[1].to_string()))
}
