/// Default extension for generated Playwright test files.
pub const DEFAULT_EXTENSION: &str = ".spec.ts";

/// Lowercase, hyphen-separated form of a screen identifier.
///
/// Word boundaries are separators (anything not alphanumeric), a lowercase or
/// digit followed by an uppercase letter, and the last capital of an acronym
/// that starts a new word (`HTTPServer` -> `http-server`).
pub fn kebab_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);
    let mut pending_separator = false;

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            pending_separator = true;
            continue;
        }

        let camel_boundary = c.is_uppercase()
            && i > 0
            && match chars[i - 1] {
                prev if prev.is_lowercase() || prev.is_numeric() => true,
                prev if prev.is_uppercase() => {
                    chars.get(i + 1).is_some_and(|next| next.is_lowercase())
                }
                _ => false,
            };

        if (pending_separator || camel_boundary) && !out.is_empty() {
            out.push('-');
        }
        pending_separator = false;
        out.extend(c.to_lowercase());
    }

    out
}

/// File name for the generated test file of a screen.
pub fn file_name_for(screen: &str, extension: &str) -> String {
    format!("{}{extension}", kebab_case(screen))
}
