//! Dependency discovery from compiler console output: MSVC's
//! `/showIncludes` notes and GCC's `-H` include tree.  Both formats are
//! interleaved with regular diagnostics, so the parsers split the text into
//! the dependency list and the remaining output that should reach the user.

/// The default prefix MSVC uses in English locales.
pub const DEFAULT_PREFIX: &str = "Note: including file:";

pub struct Filtered {
    pub deps: Vec<String>,
    pub output: String,
}

/// Split `/showIncludes` lines (`<prefix> <spaces><path>`) out of `text`.
pub fn parse_show_includes(text: &str, prefix: &str) -> Filtered {
    let mut deps = Vec::new();
    let mut output = String::with_capacity(text.len());
    for line in text.lines() {
        match line.strip_prefix(prefix) {
            Some(rest) => {
                let path = rest.trim();
                if !path.is_empty() && !deps.iter().any(|d: &String| d == path) {
                    deps.push(path.to_string());
                }
            }
            None => {
                output.push_str(line);
                output.push('\n');
            }
        }
    }
    Filtered { deps, output }
}

/// Split GCC `-H` lines (one or more '.' then a space then the path) out
/// of `text`.  The "Multiple include guards may be useful for:" trailer and
/// the list that follows it are dropped too.
pub fn parse_dot_prefixed(text: &str) -> Filtered {
    let mut deps = Vec::new();
    let mut output = String::with_capacity(text.len());
    let mut in_guard_list = false;
    for line in text.lines() {
        let dots = line.bytes().take_while(|&c| c == b'.').count();
        if dots > 0 && line[dots..].starts_with(' ') {
            let path = line[dots + 1..].trim();
            if !path.is_empty() && !deps.iter().any(|d: &String| d == path) {
                deps.push(path.to_string());
            }
            in_guard_list = false;
            continue;
        }
        if line.starts_with("Multiple include guards may be useful for:") {
            in_guard_list = true;
            continue;
        }
        if in_guard_list && !line.is_empty() && !line.contains(": ") {
            continue;
        }
        in_guard_list = false;
        output.push_str(line);
        output.push('\n');
    }
    Filtered { deps, output }
}
