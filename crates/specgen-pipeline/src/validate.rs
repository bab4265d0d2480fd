//! Structural checks on generated test source.
//!
//! This is not a TypeScript parser. It tokenizes just enough (strings,
//! template literals, comments, regex literals) to check delimiter balance and
//! count the calls that make a file a single Playwright test.

/// Why a candidate was rejected. Issues are sent back to the model verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generated test failed validation: {}", issues.join("; "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

pub fn validate_test_source(code: &str) -> Result<(), ValidationError> {
    if code.trim().is_empty() {
        return Err(ValidationError {
            issues: vec!["generated code is empty".into()],
        });
    }

    let scan = Scanner::new(code).run();
    let mut issues = scan.issues;

    match scan.test_calls {
        0 => issues.push("no top-level `test(` call found".into()),
        1 => {}
        n => issues.push(format!("expected exactly one top-level `test(` call, found {n}")),
    }
    for modifier in scan.focused {
        issues.push(format!("`test.{modifier}` must not be used; emit a plain `test(` call"));
    }
    if scan.expect_calls == 0 {
        issues.push("no `expect(` assertion found".into());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    LineComment,
    BlockComment,
    Str(char),
    Template,
    Regex { in_class: bool },
}

/// Keywords after which a `/` starts a regex literal rather than a division.
const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "in", "of", "delete", "void", "throw", "yield", "await",
];

#[derive(Default)]
struct Scan {
    test_calls: usize,
    focused: Vec<String>,
    expect_calls: usize,
    issues: Vec<String>,
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    mode: Mode,
    mode_line: usize,
    /// Open delimiters with the line they were opened on. `$` marks a
    /// template literal interpolation.
    stack: Vec<(char, usize)>,
    /// Last significant code character; `a` stands for any word.
    prev: Option<char>,
    prev_word: String,
    scan: Scan,
}

impl Scanner {
    fn new(code: &str) -> Self {
        Self {
            chars: code.chars().collect(),
            pos: 0,
            line: 1,
            mode: Mode::Code,
            mode_line: 1,
            stack: Vec::new(),
            prev: None,
            prev_word: String::new(),
            scan: Scan::default(),
        }
    }

    fn run(mut self) -> Scan {
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            let next = self.chars.get(self.pos + 1).copied();
            match self.mode {
                Mode::Code => self.code(c, next),
                Mode::LineComment => {
                    if c == '\n' {
                        self.mode = Mode::Code;
                    }
                }
                Mode::BlockComment => {
                    if c == '*' && next == Some('/') {
                        self.mode = Mode::Code;
                        self.pos += 1;
                    }
                }
                Mode::Str(quote) => {
                    if c == '\\' {
                        self.skip_escaped();
                    } else if c == quote {
                        self.mode = Mode::Code;
                        self.prev = Some(quote);
                    } else if c == '\n' {
                        let line = self.mode_line;
                        self.issue(format!("unterminated string starting on line {line}"));
                        self.mode = Mode::Code;
                    }
                }
                Mode::Template => {
                    if c == '\\' {
                        self.skip_escaped();
                    } else if c == '`' {
                        self.mode = Mode::Code;
                        self.prev = Some('`');
                    } else if c == '$' && next == Some('{') {
                        self.stack.push(('$', self.line));
                        self.mode = Mode::Code;
                        self.prev = Some('{');
                        self.pos += 1;
                    }
                }
                Mode::Regex { in_class } => match c {
                    '\\' => self.skip_escaped(),
                    '[' => self.mode = Mode::Regex { in_class: true },
                    ']' => self.mode = Mode::Regex { in_class: false },
                    '/' if !in_class => {
                        self.mode = Mode::Code;
                        self.prev = Some('a');
                        self.prev_word.clear();
                    }
                    '\n' => {
                        let line = self.mode_line;
                        self.issue(format!("unterminated regex literal on line {line}"));
                        self.mode = Mode::Code;
                    }
                    _ => {}
                },
            }
            if self.chars.get(self.pos) == Some(&'\n') {
                self.line += 1;
            }
            self.pos += 1;
        }

        match self.mode {
            Mode::Str(_) => {
                self.issue(format!("unterminated string starting on line {}", self.mode_line))
            }
            Mode::Template => self.issue(format!(
                "unterminated template literal starting on line {}",
                self.mode_line
            )),
            Mode::BlockComment => self.issue(format!(
                "unterminated block comment starting on line {}",
                self.mode_line
            )),
            Mode::Regex { .. } => {
                self.issue(format!("unterminated regex literal on line {}", self.mode_line))
            }
            Mode::Code | Mode::LineComment => {}
        }
        for (open, line) in std::mem::take(&mut self.stack) {
            let shown = if open == '$' { "${".to_string() } else { open.to_string() };
            self.issue(format!("unclosed `{shown}` opened on line {line}"));
        }
        self.scan
    }

    fn code(&mut self, c: char, next: Option<char>) {
        match c {
            c if c.is_whitespace() => {}
            '/' if next == Some('/') => {
                self.mode = Mode::LineComment;
                self.pos += 1;
            }
            '/' if next == Some('*') => {
                self.mode = Mode::BlockComment;
                self.mode_line = self.line;
                self.pos += 1;
            }
            '/' if self.regex_allowed() => {
                self.mode = Mode::Regex { in_class: false };
                self.mode_line = self.line;
            }
            '\'' | '"' => {
                self.mode = Mode::Str(c);
                self.mode_line = self.line;
            }
            '`' => {
                self.mode = Mode::Template;
                self.mode_line = self.line;
            }
            '(' | '[' | '{' => {
                self.stack.push((c, self.line));
                self.prev = Some(c);
            }
            ')' | ']' | '}' => self.close(c),
            c if c.is_alphanumeric() || c == '_' || c == '$' => self.word(),
            other => self.prev = Some(other),
        }
    }

    fn close(&mut self, c: char) {
        let expected = match c {
            ')' => '(',
            ']' => '[',
            _ => '{',
        };
        match self.stack.pop() {
            Some(('$', _)) if c == '}' => {
                self.mode = Mode::Template;
                return;
            }
            Some((open, _)) if open == expected => {}
            Some((open, line)) => {
                let shown = if open == '$' { "${".to_string() } else { open.to_string() };
                self.issue(format!(
                    "mismatched `{c}` on line {} (closes `{shown}` opened on line {line})",
                    self.line
                ));
            }
            None => self.issue(format!("unexpected `{c}` on line {}", self.line)),
        }
        self.prev = Some(c);
    }

    fn word(&mut self) {
        let start = self.pos;
        while self
            .chars
            .get(self.pos + 1)
            .is_some_and(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..=self.pos].iter().collect();
        let is_member = self.prev == Some('.');

        if !is_member {
            match word.as_str() {
                "test" => self.test_reference(),
                "expect"
                    if matches!(
                        self.peek_past_whitespace(self.pos + 1),
                        Some((_, '(' | '.'))
                    ) =>
                {
                    self.scan.expect_calls += 1;
                }
                _ => {}
            }
        }

        self.prev = Some('a');
        self.prev_word = word;
    }

    /// Classify `test(`, `test.only(` and `test.skip(` after reading `test`.
    fn test_reference(&mut self) {
        let top_level = self.stack.is_empty();
        match self.peek_past_whitespace(self.pos + 1) {
            Some((_, '(')) if top_level => self.scan.test_calls += 1,
            Some((dot, '.')) => {
                let Some((start, _)) = self.peek_past_whitespace(dot + 1) else {
                    return;
                };
                let mut end = start;
                while self.chars.get(end).is_some_and(|c| c.is_alphanumeric()) {
                    end += 1;
                }
                let member: String = self.chars[start..end].iter().collect();
                if matches!(member.as_str(), "only" | "skip")
                    && matches!(self.peek_past_whitespace(end), Some((_, '(')))
                {
                    self.scan.focused.push(member);
                }
            }
            _ => {}
        }
    }

    fn peek_past_whitespace(&self, from: usize) -> Option<(usize, char)> {
        self.chars[from.min(self.chars.len())..]
            .iter()
            .position(|c| !c.is_whitespace())
            .map(|offset| (from + offset, self.chars[from + offset]))
    }

    fn regex_allowed(&self) -> bool {
        match self.prev {
            None => true,
            Some('a') => REGEX_KEYWORDS.contains(&self.prev_word.as_str()),
            Some(c) => "(,=:[!&|?{};+-*%<>~^".contains(c),
        }
    }

    /// Step onto the escaped character; the main loop then counts it if it
    /// is a newline.
    fn skip_escaped(&mut self) {
        self.pos += 1;
    }

    fn issue(&mut self, message: String) {
        self.scan.issues.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"test('creates a project', async ({ page }) => {
  await page.goto('/projects');
  await page.getByRole('button', { name: 'New Project' }).click();
  await expect(page).toHaveURL(/\/projects\/new$/);
  const label = `Project ${'Apollo'} {`;
  // a stray ) in a comment
  /* and ( in a block comment */
  await expect(page.getByText(label)).toBeVisible();
});"#;

    #[test]
    fn well_formed_test_passes() {
        assert_eq!(validate_test_source(GOOD), Ok(()));
    }

    #[test]
    fn empty_code_is_rejected() {
        let err = validate_test_source("  \n").unwrap_err();
        assert_eq!(err.issues, vec!["generated code is empty".to_string()]);
    }

    #[test]
    fn missing_closing_brace_is_reported() {
        let code = "test('a', async ({ page }) => {\n  await expect(page).toHaveTitle('x');\n";
        let err = validate_test_source(code).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("unclosed `{`")), "{err}");
        assert!(err.issues.iter().any(|i| i.contains("unclosed `(`")), "{err}");
    }

    #[test]
    fn mismatched_delimiter_is_reported() {
        let code = "test('a', async () => {\n  expect([1, 2)).toHaveLength(2);\n});";
        let err = validate_test_source(code).unwrap_err();
        assert!(err.issues.iter().any(|i| i.starts_with("mismatched `)` on line 2")), "{err}");
    }

    #[test]
    fn unterminated_string_is_reported() {
        let code = "test('a, async () => {\n  expect(1).toBe(1);\n});";
        let err = validate_test_source(code).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("unterminated string starting on line 1")));
    }

    #[test]
    fn unterminated_template_is_reported() {
        let code = "test('a', async () => {\n  const s = `open;\n  expect(1).toBe(1);\n});";
        let err = validate_test_source(code).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("unterminated template literal")));
    }

    #[test]
    fn missing_expect_is_reported() {
        let code = "test('a', async ({ page }) => {\n  await page.goto('/');\n});";
        let err = validate_test_source(code).unwrap_err();
        assert_eq!(err.issues, vec!["no `expect(` assertion found".to_string()]);
    }

    #[test]
    fn expect_in_comment_does_not_count() {
        let code = "test('a', async () => {\n  // expect(1).toBe(1);\n});";
        assert!(validate_test_source(code).is_err());
    }

    #[test]
    fn multiple_tests_are_rejected() {
        let code = "test('a', async () => { expect(1).toBe(1); });\ntest('b', async () => { expect(2).toBe(2); });";
        let err = validate_test_source(code).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("found 2")));
    }

    #[test]
    fn missing_test_call_is_rejected() {
        let err = validate_test_source("expect(1).toBe(1);").unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("no top-level `test(`")));
    }

    #[test]
    fn focused_tests_are_rejected() {
        let code = "test.only('a', async () => { expect(1).toBe(1); });";
        let err = validate_test_source(code).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("`test.only`")));
    }

    #[test]
    fn nested_test_step_is_not_a_second_test() {
        let code = "test('a', async () => {\n  await test.step('x', async () => {\n    expect(1).toBe(1);\n  });\n});";
        assert_eq!(validate_test_source(code), Ok(()));
    }

    #[test]
    fn division_is_not_a_regex() {
        let code = "test('a', async () => {\n  const half = (4) / 2; const q = half / 1;\n  expect(half).toBe(2);\n});";
        assert_eq!(validate_test_source(code), Ok(()));
    }

    #[test]
    fn nested_template_interpolation_balances() {
        let code = "test('a', async () => {\n  const s = `a ${`b ${1 + (2)}`} c`;\n  expect(s).toBeTruthy();\n});";
        assert_eq!(validate_test_source(code), Ok(()));
    }

    #[test]
    fn error_display_joins_issues() {
        let err = ValidationError {
            issues: vec!["one".into(), "two".into()],
        };
        assert_eq!(err.to_string(), "generated test failed validation: one; two");
    }
}
