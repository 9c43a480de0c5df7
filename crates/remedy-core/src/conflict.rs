use std::collections::BTreeSet;

/// Pre-flight file prediction.
///
/// Before admitting an issue, the orchestrator guesses which files the work
/// will touch from the issue text alone: explicit paths, referenced
/// identifiers, and area keywords. Two issues whose predictions overlap are
/// not run concurrently.

const KNOWN_PREFIXES: &[&str] = &[
    "src/", "lib/", "tests/", "test/", "docs/", "doc/", "config/", "app/", "pkg/", "crates/",
    "internal/", "cmd/",
];

const CODE_EXTENSIONS: &[&str] = &[
    ".rs", ".ts", ".tsx", ".js", ".jsx", ".py", ".go", ".java", ".rb", ".c", ".cc", ".cpp",
    ".h", ".hpp", ".md", ".yml", ".yaml", ".toml", ".json", ".sql", ".sh",
];

/// Area keyword → canonical directory.
const AREA_DIRS: &[(&str, &str)] = &[
    ("auth", "src/auth"),
    ("authentication", "src/auth"),
    ("login", "src/auth"),
    ("api", "src/api"),
    ("endpoint", "src/api"),
    ("database", "src/db"),
    ("migration", "src/db"),
    ("sql", "src/db"),
    ("ui", "src/ui"),
    ("frontend", "src/ui"),
    ("component", "src/ui"),
    ("util", "src/utils"),
    ("utils", "src/utils"),
    ("helper", "src/utils"),
    ("test", "tests"),
    ("tests", "tests"),
    ("doc", "docs"),
    ("docs", "docs"),
    ("documentation", "docs"),
    ("readme", "docs"),
    ("config", "config"),
    ("configuration", "config"),
    ("settings", "config"),
];

fn looks_like_path(token: &str) -> bool {
    let has_ext = CODE_EXTENSIONS.iter().any(|e| token.ends_with(e));
    let has_prefix = KNOWN_PREFIXES.iter().any(|p| token.starts_with(p));
    (token.contains('/') && (has_ext || has_prefix)) || (has_ext && !token.contains("://"))
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| {
        matches!(c, '`' | '\'' | '"' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';' | ':' | '*')
    })
}

fn extract_explicit_paths(text: &str, out: &mut BTreeSet<String>) {
    for raw in text.split_whitespace() {
        let token = trim_token(raw);
        if token.len() < 4 || token.contains("://") {
            continue;
        }
        if looks_like_path(token) {
            out.insert(token.trim_start_matches("./").to_string());
        }
    }
}

fn is_snake_identifier(token: &str) -> bool {
    token.contains('_')
        && token.len() >= 5
        && token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_camel_identifier(token: &str) -> bool {
    token.len() >= 5
        && token.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && token.chars().skip(1).any(|c| c.is_ascii_lowercase())
        && token.chars().skip(1).any(|c| c.is_ascii_uppercase())
        && token.chars().all(char::is_alphanumeric)
}

fn camel_to_snake(token: &str) -> String {
    let mut out = String::with_capacity(token.len() + 4);
    for (i, c) in token.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Referenced component/type/function names become candidate module paths.
fn extract_identifiers(text: &str, out: &mut BTreeSet<String>) {
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let token = raw.trim();
        if is_camel_identifier(token) {
            out.insert(format!("src/{}", camel_to_snake(token)));
        } else if is_snake_identifier(token) && !AREA_DIRS.iter().any(|(k, _)| *k == token) {
            out.insert(format!("src/{token}"));
        }
    }
}

fn extract_areas(text: &str, out: &mut BTreeSet<String>) {
    let lower = text.to_lowercase();
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        for (keyword, dir) in AREA_DIRS {
            if word == *keyword {
                out.insert((*dir).to_string());
            }
        }
    }
}

/// Predict the set of paths an issue's work will probably touch.
pub fn predict_paths(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    extract_explicit_paths(text, &mut out);
    extract_identifiers(text, &mut out);
    extract_areas(text, &mut out);
    out
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn parent(path: &str) -> String {
    let comps = components(path);
    if comps.len() <= 1 {
        return String::new();
    }
    comps[..comps.len() - 1].join("/")
}

/// Whether two predicted paths overlap: equal, one a component-wise prefix of
/// the other (`a/b` vs `a/b/c`), or siblings under the same (non-root)
/// parent.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let ca = components(a);
    let cb = components(b);
    let short = ca.len().min(cb.len());
    if ca[..short] == cb[..short] {
        return true;
    }
    let pa = parent(a);
    !pa.is_empty() && pa == parent(b)
}

/// Whether two predicted sets conflict under the overlap rule.
pub fn sets_conflict(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.iter().any(|pa| b.iter().any(|pb| paths_overlap(pa, pb)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_explicit_paths() {
        let text = "The bug is in `src/auth/login.ts` and also affects src/auth/session.ts.";
        let predicted = predict_paths(text);
        assert!(predicted.contains("src/auth/login.ts"));
        assert!(predicted.contains("src/auth/session.ts"));
    }

    #[test]
    fn ignores_urls() {
        let predicted = predict_paths("See https://example.com/src/auth/login.ts for details");
        assert!(!predicted.contains("https://example.com/src/auth/login.ts"));
    }

    #[test]
    fn maps_identifiers_to_candidates() {
        let predicted = predict_paths("SessionManager leaks handles; also fix parse_config");
        assert!(predicted.contains("src/session_manager"));
        assert!(predicted.contains("src/parse_config"));
    }

    #[test]
    fn maps_area_keywords() {
        let predicted = predict_paths("Authentication is broken after the database migration");
        assert!(predicted.contains("src/auth"));
        assert!(predicted.contains("src/db"));
    }

    #[test]
    fn overlap_rules() {
        assert!(paths_overlap("src/auth", "src/auth"));
        assert!(paths_overlap("src/auth", "src/auth/login.ts"));
        assert!(paths_overlap("src/auth/login.ts", "src/auth"));
        // Siblings share the immediate parent.
        assert!(paths_overlap("src/auth/login.ts", "src/auth/session.ts"));
        assert!(!paths_overlap("src/auth/login.ts", "src/api/routes.ts"));
        // Component-wise: "a/bc" is not under "a/b".
        assert!(!paths_overlap("src/auth", "src/authz/check.ts"));
        // Distinct top-level areas are not siblings.
        assert!(!paths_overlap("docs", "tests"));
    }

    #[test]
    fn conflicting_issue_pair_is_deferred() {
        let a = predict_paths("Refactor auth flow in src/auth/");
        let b = predict_paths("Fix token refresh in src/auth/login.ts");
        assert!(sets_conflict(&a, &b));
    }

    #[test]
    fn disjoint_sets_do_not_conflict() {
        assert!(!sets_conflict(
            &set(&["src/api/routes.ts"]),
            &set(&["docs/README.md"])
        ));
        assert!(sets_conflict(&set(&["src/a/x.rs"]), &set(&["src/a/y.rs"])));
    }
}
