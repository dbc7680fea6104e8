use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Characters that are stripped from every column name: parentheses,
/// square brackets, periods and any whitespace.
static STRIPPED_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\(\)\s\.\[\]]").expect("column sanitizer pattern should be valid"));

/// Remove `(`, `)`, `[`, `]`, `.` and whitespace from a column name,
/// keeping every other character in order.
pub fn sanitize_column(name: &str) -> String {
    STRIPPED_CHARS.replace_all(name, "").into_owned()
}

/// Give blank header cells a positional name and make repeated names unique
/// by suffixing `.1`, `.2`, ... (a suffix that is already taken is skipped).
pub fn dedupe_headers<I, S>(headers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    headers
        .into_iter()
        .enumerate()
        .map(|(idx, raw)| {
            let mut name = match raw.as_ref() {
                "" => format!("Unnamed: {}", idx),
                other => other.to_string(),
            };
            let mut seen = counts.get(&name).copied().unwrap_or(0);
            while seen > 0 {
                counts.insert(name.clone(), seen + 1);
                name = format!("{}.{}", name, seen);
                seen = counts.get(&name).copied().unwrap_or(0);
            }
            counts.insert(name.clone(), seen + 1);
            name
        })
        .collect()
}

/// Header row → final column names: dedupe first, then sanitize each name.
pub fn sanitize_headers<I, S>(headers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dedupe_headers(headers)
        .iter()
        .map(|name| sanitize_column(name))
        .collect()
}
