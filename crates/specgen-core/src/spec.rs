use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::naming;

/// One screen's test intent, parsed from a spec file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpecDocument {
    pub screen: String,
    pub description: String,
    pub test_cases: Vec<TestCaseSpec>,
}

/// One named behavior. `steps` and `assertions` are non-empty once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<String>,
    pub assertions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hint: Option<String>,
}

impl TestCaseSpec {
    /// Steps followed by assertions, in document order.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .chain(self.assertions.iter())
            .map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSpec {
    screen: Option<String>,
    description: Option<String>,
    #[serde(alias = "test_cases")]
    test_cases: Option<Vec<RawTestCase>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTestCase {
    name: Option<String>,
    description: Option<String>,
    steps: Option<Vec<String>>,
    assertions: Option<Vec<String>>,
    #[serde(alias = "template_hint")]
    template_hint: Option<String>,
}

/// Parse YAML text into a validated spec document.
pub fn parse_str(yaml: &str) -> Result<TestSpecDocument, ParseError> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)
        .map_err(|e| ParseError::with_details("document is not valid YAML", e.to_string()))?;
    parse(&value)
}

/// Validate and normalize an already-parsed YAML document.
pub fn parse(raw: &serde_yaml::Value) -> Result<TestSpecDocument, ParseError> {
    if !raw.is_mapping() {
        return Err(ParseError::new("top level must be a mapping"));
    }
    let spec: RawSpec = serde_yaml::from_value(raw.clone()).map_err(|e| {
        ParseError::with_details(format!("unexpected document shape: {e}"), e.to_string())
    })?;
    spec.validate()
}

/// Same as [`parse`], for collaborators that hand over JSON.
pub fn parse_json(raw: &serde_json::Value) -> Result<TestSpecDocument, ParseError> {
    if !raw.is_object() {
        return Err(ParseError::new("top level must be an object"));
    }
    let spec: RawSpec = serde_json::from_value(raw.clone()).map_err(|e| {
        ParseError::with_details(format!("unexpected document shape: {e}"), e.to_string())
    })?;
    spec.validate()
}

impl RawSpec {
    fn validate(self) -> Result<TestSpecDocument, ParseError> {
        let screen = required_text(self.screen, "screen")?;
        if naming::kebab_case(&screen).is_empty() {
            return Err(ParseError::new(format!(
                "screen '{screen}' must contain at least one letter or digit"
            )));
        }
        let description = self
            .description
            .map(|d| d.trim().to_string())
            .ok_or_else(|| ParseError::new("missing required field `description`"))?;
        let raw_cases = self
            .test_cases
            .ok_or_else(|| ParseError::new("missing required field `testCases`"))?;
        if raw_cases.is_empty() {
            return Err(ParseError::new("`testCases` must list at least one test case"));
        }

        let mut seen = HashSet::new();
        let mut test_cases = Vec::with_capacity(raw_cases.len());
        for (index, raw) in raw_cases.into_iter().enumerate() {
            let case = raw.validate(index)?;
            if !seen.insert(case.name.clone()) {
                return Err(ParseError::new(format!(
                    "duplicate test case name '{}'",
                    case.name
                )));
            }
            test_cases.push(case);
        }

        Ok(TestSpecDocument {
            screen,
            description,
            test_cases,
        })
    }
}

impl RawTestCase {
    fn validate(self, index: usize) -> Result<TestCaseSpec, ParseError> {
        let name = required_text(self.name, &format!("testCases[{index}].name"))?;
        let steps = non_empty_lines(self.steps, &name, "steps")?;
        let assertions = non_empty_lines(self.assertions, &name, "assertions")?;
        let template_hint = self
            .template_hint
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());

        Ok(TestCaseSpec {
            name,
            description: self.description.unwrap_or_default().trim().to_string(),
            steps,
            assertions,
            template_hint,
        })
    }
}

fn required_text(value: Option<String>, field: &str) -> Result<String, ParseError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(ParseError::new(format!("field `{field}` must not be empty"))),
        None => Err(ParseError::new(format!("missing required field `{field}`"))),
    }
}

fn non_empty_lines(
    value: Option<Vec<String>>,
    case: &str,
    field: &str,
) -> Result<Vec<String>, ParseError> {
    let lines = value.ok_or_else(|| {
        ParseError::new(format!("test case '{case}' is missing `{field}`"))
    })?;
    if lines.is_empty() {
        return Err(ParseError::new(format!(
            "test case '{case}' must have at least one entry in `{field}`"
        )));
    }
    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                Err(ParseError::new(format!(
                    "test case '{case}': `{field}[{i}]` is blank"
                )))
            } else {
                Ok(trimmed.to_string())
            }
        })
        .collect()
}
