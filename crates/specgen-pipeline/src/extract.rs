/// Pull test source out of a raw LLM reply.
///
/// Models wrap code in prose, markdown fences or reasoning blocks. This strips
/// `<think>` blocks, prefers the last fenced block that contains a `test(`
/// call, and removes `@playwright/test` import lines since the file preamble
/// already provides them.
pub fn extract_code(raw: &str) -> String {
    let cleaned = strip_think_blocks(raw);
    let trimmed = cleaned.trim();

    let body = extract_from_code_fence(trimmed).unwrap_or(trimmed);

    let kept: Vec<&str> = body
        .lines()
        .filter(|line| !is_playwright_import(line))
        .collect();
    kept.join("\n").trim().to_string()
}

/// Remove `<think>...</think>` blocks from LLM output.
fn strip_think_blocks(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut remaining = s;
    while let Some(start) = remaining.find("<think>") {
        result.push_str(&remaining[..start]);
        if let Some(end) = remaining[start..].find("</think>") {
            remaining = &remaining[start + end + "</think>".len()..];
        } else {
            // Unclosed <think> tag -- strip everything after it
            return result;
        }
    }
    result.push_str(remaining);
    result
}

/// Content of the last fenced block that contains a test, else of the last
/// fenced block.
fn extract_from_code_fence(s: &str) -> Option<&str> {
    let fences: Vec<usize> = s.match_indices("```").map(|(pos, _)| pos).collect();
    if fences.len() < 2 {
        return None;
    }

    let blocks: Vec<&str> = fences
        .chunks_exact(2)
        .filter_map(|pair| {
            let (open, close) = (pair[0], pair[1]);
            // Skip the info string on the opening line (```ts, ```typescript).
            let after = &s[open + 3..close];
            let start = after.find('\n').map(|i| i + 1)?;
            Some(after[start..].trim())
        })
        .filter(|block| !block.is_empty())
        .collect();

    blocks
        .iter()
        .rev()
        .find(|block| block.contains("test("))
        .or_else(|| blocks.last())
        .copied()
}

fn is_playwright_import(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("import ")
        && (line.contains("'@playwright/test'") || line.contains("\"@playwright/test\""))
}
