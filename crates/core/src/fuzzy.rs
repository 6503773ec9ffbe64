//! Pattern helpers shared by the search backends: safe fuzzy expansion and
//! glob-to-regex translation for tools that take regex file filters.

/// Expand a user pattern into a word-boundary regex that is more permissive
/// than an exact match but immune to regex injection.
///
/// Patterns of three or more characters may match at either word boundary
/// (`testing` and `mytest` both match `test`); shorter patterns require both
/// boundaries to avoid flooding the result set.
pub fn create_safe_fuzzy_pattern(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    if pattern.chars().count() >= 3 {
        format!("\\b{escaped}|{escaped}\\b")
    } else {
        format!("\\b{escaped}\\b")
    }
}

/// Translate a file glob (`*.py`, `src/**/*.rs`) to an equivalent regex for
/// tools whose file filter takes a regex instead of a glob.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    format!("{out}$")
}
