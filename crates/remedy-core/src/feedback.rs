use std::collections::BTreeMap;

use crate::host::{ConclusionMap, ProposalFeedback};
use crate::types::{FeedbackItem, FeedbackKind};

/// Parsed view of everything actionable on one proposal.
#[derive(Debug, Clone)]
pub struct ParsedFeedback {
    pub items: Vec<FeedbackItem>,
    pub needs_attention: bool,
    pub summary: String,
}

/// Keyword taxonomy, checked in order; first hit wins.
const TAXONOMY: &[(FeedbackKind, &[&str])] = &[
    (FeedbackKind::Security, &[
        "security", "vulnerab", "cve-", "injection", "xss", "csrf", "unsafe", "sanitize",
        "secret", "credential",
    ]),
    (FeedbackKind::BugFix, &[
        "bug", "broken", "crash", "panic", "regression", "incorrect", "wrong", "fails",
        "doesn't work", "does not work", "off-by-one", "race condition", "deadlock",
    ]),
    (FeedbackKind::Test, &[
        "test", "coverage", "assert", "spec",
    ]),
    (FeedbackKind::Performance, &[
        "performance", "slow", "optimi", "latency", "memory leak", "allocation", "n+1",
    ]),
    (FeedbackKind::Documentation, &[
        "documentation", "docs", "docstring", "readme", "changelog", "comment",
    ]),
    (FeedbackKind::Style, &[
        "style", "lint", "format", "naming", "typo", "whitespace", "nit", "nitpick",
    ]),
    (FeedbackKind::CodeChange, &[
        "refactor", "rename", "extract", "move", "instead", "suggest", "should", "please change",
        "consider", "could you",
    ]),
];

/// Classify one piece of feedback text.
pub fn classify(text: &str) -> FeedbackKind {
    let lower = text.to_lowercase();
    for (kind, keywords) in TAXONOMY {
        if keywords.iter().any(|k| lower.contains(k)) {
            return *kind;
        }
    }
    let trimmed = text.trim();
    if trimmed.ends_with('?')
        || ["why ", "what ", "how ", "is there"].iter().any(|q| lower.starts_with(q))
    {
        return FeedbackKind::Question;
    }
    FeedbackKind::Other
}

/// Priority 1 for security and CI failures, else a kind-based heuristic.
pub fn priority_for(kind: FeedbackKind) -> u8 {
    match kind {
        FeedbackKind::Security | FeedbackKind::CiFailure => 1,
        FeedbackKind::BugFix => 2,
        FeedbackKind::CodeChange | FeedbackKind::Test | FeedbackKind::Performance => 3,
        FeedbackKind::Style | FeedbackKind::Documentation => 4,
        FeedbackKind::Question | FeedbackKind::Other => 5,
    }
}

fn is_bot(author: &str, bot_authors: &[String]) -> bool {
    bot_authors.iter().any(|b| b == author) || author.ends_with("[bot]")
}

/// Parse reviews, comments and check-runs into prioritised feedback items.
///
/// Bot authors are dropped, direct replies are skipped, inline comments keep
/// their file and line, and failing checks become `ci_failure` items.
pub fn parse_feedback(
    feedback: &ProposalFeedback,
    bot_authors: &[String],
    conclusions: &ConclusionMap,
) -> ParsedFeedback {
    let mut items = Vec::new();
    let mut changes_requested = false;

    for review in &feedback.reviews {
        if is_bot(&review.author, bot_authors) {
            continue;
        }
        if review.state == "changes_requested" {
            changes_requested = true;
        }
        let body = review.body.trim();
        if body.is_empty() || review.state == "approved" {
            continue;
        }
        let kind = classify(body);
        items.push(FeedbackItem {
            kind,
            priority: priority_for(kind),
            file: None,
            line: None,
            body: body.to_string(),
            author: review.author.clone(),
            addressed: false,
        });
    }

    for comment in &feedback.comments {
        if is_bot(&comment.author, bot_authors) || comment.in_reply_to.is_some() {
            continue;
        }
        let body = comment.body.trim();
        if body.is_empty() {
            continue;
        }
        let kind = classify(body);
        items.push(FeedbackItem {
            kind,
            priority: priority_for(kind),
            file: comment.path.clone(),
            line: comment.line,
            body: body.to_string(),
            author: comment.author.clone(),
            addressed: false,
        });
    }

    for check in &feedback.check_runs {
        if conclusions.is_failing(check) {
            items.push(FeedbackItem {
                kind: FeedbackKind::CiFailure,
                priority: 1,
                file: None,
                line: None,
                body: format!(
                    "Check '{}' concluded '{}'",
                    check.name,
                    check.conclusion.as_deref().unwrap_or("failure")
                ),
                author: String::new(),
                addressed: false,
            });
        }
    }

    items.sort_by_key(|i| i.priority);
    let needs_attention = !items.is_empty() || changes_requested;
    let summary = summarise(&items, changes_requested);

    ParsedFeedback { items, needs_attention, summary }
}

fn summarise(items: &[FeedbackItem], changes_requested: bool) -> String {
    if items.is_empty() {
        return if changes_requested {
            "changes requested, no itemised feedback".to_string()
        } else {
            "no actionable feedback".to_string()
        };
    }
    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for item in items {
        *by_kind.entry(item.kind.as_str()).or_insert(0) += 1;
    }
    let breakdown = by_kind
        .iter()
        .map(|(k, n)| format!("{n} {k}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} actionable item(s): {breakdown}", items.len())
}

/// Render feedback items into the iteration prompt for the agent.
pub fn feedback_prompt(pr_url: &str, items: &[FeedbackItem]) -> String {
    let mut prompt = format!(
        "Address the following review feedback on {pr_url}. Make the minimal \
         changes each item asks for, keep unrelated code untouched, and do not \
         force-push over reviewer commits.\n\n"
    );
    for (i, item) in items.iter().enumerate() {
        prompt.push_str(&format!("{}. [{}]", i + 1, item.kind.as_str()));
        if let Some(file) = &item.file {
            prompt.push_str(&format!(" {file}"));
            if let Some(line) = item.line {
                prompt.push_str(&format!(":{line}"));
            }
        }
        prompt.push_str(&format!(" — {}\n", item.body));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CheckRun, ProposalInfo, ProposalState, Review, ReviewComment};

    fn feedback_with(
        reviews: Vec<Review>,
        comments: Vec<ReviewComment>,
        check_runs: Vec<CheckRun>,
    ) -> ProposalFeedback {
        ProposalFeedback {
            proposal: ProposalInfo {
                url: "https://github.com/acme/app/pull/7".into(),
                number: 7,
                state: ProposalState::Open,
                head_branch: "remedy/issue-42".into(),
                title: "Fix login".into(),
            },
            reviews,
            comments,
            check_runs,
        }
    }

    fn comment(author: &str, body: &str) -> ReviewComment {
        ReviewComment {
            id: 1,
            author: author.into(),
            body: body.into(),
            path: None,
            line: None,
            in_reply_to: None,
            created_at: None,
        }
    }

    #[test]
    fn classifies_by_keyword() {
        assert_eq!(classify("This has a SQL injection vulnerability"), FeedbackKind::Security);
        assert_eq!(classify("this crashes on empty input"), FeedbackKind::BugFix);
        assert_eq!(classify("please add a test for the error path"), FeedbackKind::Test);
        assert_eq!(classify("nit: trailing whitespace"), FeedbackKind::Style);
        assert_eq!(classify("why is this needed?"), FeedbackKind::Question);
    }

    #[test]
    fn security_and_ci_are_priority_one() {
        let parsed = parse_feedback(
            &feedback_with(
                vec![],
                vec![comment("alice", "possible credential leak here")],
                vec![CheckRun {
                    name: "ci/build".into(),
                    status: "completed".into(),
                    conclusion: Some("failure".into()),
                }],
            ),
            &[],
            &ConclusionMap::default(),
        );
        assert_eq!(parsed.items.len(), 2);
        assert!(parsed.items.iter().all(|i| i.priority == 1));
        assert!(parsed.needs_attention);
    }

    #[test]
    fn drops_bots_and_replies() {
        let mut reply = comment("alice", "agreed, will fix");
        reply.in_reply_to = Some(99);
        let parsed = parse_feedback(
            &feedback_with(
                vec![],
                vec![
                    comment("dependabot[bot]", "bump serde"),
                    comment("custom-bot", "automated nag"),
                    reply,
                    comment("bob", "please rename this function"),
                ],
                vec![],
            ),
            &["custom-bot".to_string()],
            &ConclusionMap::default(),
        );
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].author, "bob");
        assert_eq!(parsed.items[0].kind, FeedbackKind::CodeChange);
    }

    #[test]
    fn inline_comment_keeps_location() {
        let mut inline = comment("alice", "this loop is slow");
        inline.path = Some("src/engine.rs".into());
        inline.line = Some(120);
        let parsed =
            parse_feedback(&feedback_with(vec![], vec![inline], vec![]), &[], &ConclusionMap::default());
        assert_eq!(parsed.items[0].file.as_deref(), Some("src/engine.rs"));
        assert_eq!(parsed.items[0].line, Some(120));
        assert_eq!(parsed.items[0].kind, FeedbackKind::Performance);
    }

    #[test]
    fn approved_review_without_items_needs_no_attention() {
        let parsed = parse_feedback(
            &feedback_with(
                vec![Review {
                    author: "alice".into(),
                    body: "LGTM".into(),
                    state: "approved".into(),
                    submitted_at: None,
                }],
                vec![],
                vec![],
            ),
            &[],
            &ConclusionMap::default(),
        );
        assert!(!parsed.needs_attention);
        assert_eq!(parsed.summary, "no actionable feedback");
    }

    #[test]
    fn changes_requested_flags_attention_even_without_body() {
        let parsed = parse_feedback(
            &feedback_with(
                vec![Review {
                    author: "alice".into(),
                    body: String::new(),
                    state: "changes_requested".into(),
                    submitted_at: None,
                }],
                vec![],
                vec![],
            ),
            &[],
            &ConclusionMap::default(),
        );
        assert!(parsed.needs_attention);
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn prompt_lists_items_in_priority_order() {
        let parsed = parse_feedback(
            &feedback_with(
                vec![],
                vec![
                    comment("bob", "nit: typo in comment"),
                    comment("alice", "this crashes when the file is missing"),
                ],
                vec![],
            ),
            &[],
            &ConclusionMap::default(),
        );
        let prompt = feedback_prompt("https://github.com/acme/app/pull/7", &parsed.items);
        let crash_pos = prompt.find("crashes").unwrap();
        let typo_pos = prompt.find("typo").unwrap();
        assert!(crash_pos < typo_pos);
    }
}
