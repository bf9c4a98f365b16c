use std::time::Duration;

use chrono::TimeDelta;
use regex::Regex;
use serde_json::json;

use gradeline_types::{
    CheckDescriptor, CheckEntry, CheckKind, NamedCheck, Submission, Task, Verdict,
};

use crate::browser::{BrowserError, Document};
use crate::inspect::{ArtifactInspector, InspectError};
use crate::judge::Judge;

/// Reason recorded when the content-quality judge errors or times out.
pub const JUDGE_UNAVAILABLE: &str = "judge_unavailable";
/// Reason recorded for check shapes this evaluator does not know.
pub const UNRECOGNIZED_CHECK: &str = "unrecognized_check";
pub const BROWSER_UNAVAILABLE: &str = "browser_unavailable";
pub const CHECK_TIMEOUT: &str = "timeout";

/// Upper bound on the text handed to the judge.
const MAX_JUDGED_CHARS: usize = 20_000;

/// Everything one check may need. `page` is `Err(reason)` when the
/// submission's page could not be rendered.
pub struct CheckContext<'a> {
    pub task: &'a Task,
    pub submission: &'a Submission,
    pub inspector: &'a dyn ArtifactInspector,
    pub judge: &'a dyn Judge,
    pub page: Result<&'a dyn Document, &'a str>,
    pub timeout: Duration,
}

/// Single entry point for every check shape. Never fails: errors, timeouts
/// and unknown shapes all become a zero-score verdict.
pub async fn run_check(entry: &CheckEntry, ctx: &CheckContext<'_>) -> (CheckKind, Verdict) {
    let kind = match entry.check.family() {
        Some(family) => CheckKind::from(family),
        None => {
            tracing::warn!(
                task_id = %ctx.task.id,
                label = %entry.label,
                "Skipping unrecognized check"
            );
            let raw = serde_json::to_value(&entry.check).unwrap_or_default();
            return (
                CheckKind::Skipped,
                Verdict::fail(UNRECOGNIZED_CHECK).with_evidence(raw),
            );
        }
    };

    let verdict = match tokio::time::timeout(ctx.timeout, dispatch(&entry.check, ctx)).await {
        Ok(verdict) => verdict,
        Err(_) if kind == CheckKind::ContentQuality => Verdict::fail(JUDGE_UNAVAILABLE)
            .with_evidence(json!({ "error": "judge timed out" })),
        Err(_) => Verdict::fail(CHECK_TIMEOUT),
    };
    tracing::debug!(
        task_id = %ctx.task.id,
        label = %entry.label,
        score = verdict.score,
        "Check finished"
    );
    (kind, verdict)
}

async fn dispatch(check: &CheckDescriptor, ctx: &CheckContext<'_>) -> Verdict {
    match check {
        CheckDescriptor::Named(NamedCheck::LicensePresent { expected }) => {
            license_present(expected.as_deref(), ctx).await
        }
        CheckDescriptor::Named(NamedCheck::CreatedWithin { hours }) => {
            created_within(*hours, ctx).await
        }
        CheckDescriptor::Named(NamedCheck::FileExists { path }) => {
            match ctx.inspector.file_exists(&ctx.submission.artifact, path).await {
                Ok(exists) => Verdict::from_bool(
                    exists,
                    if exists {
                        format!("{path} exists")
                    } else {
                        format!("{path} not found")
                    },
                ),
                Err(e) => inspect_failed(e),
            }
        }
        CheckDescriptor::Named(NamedCheck::ContentQuality { path, rubric }) => {
            content_quality(path, rubric, ctx).await
        }
        CheckDescriptor::Expression(_) | CheckDescriptor::Named(_) => match ctx.page {
            Ok(document) => dynamic(check, document)
                .await
                .unwrap_or_else(|e| Verdict::fail(format!("script_error: {e}"))),
            Err(reason) => {
                Verdict::fail(BROWSER_UNAVAILABLE).with_evidence(json!({ "error": reason }))
            }
        },
        CheckDescriptor::Unrecognized(_) => Verdict::fail(UNRECOGNIZED_CHECK),
    }
}

fn inspect_failed(e: InspectError) -> Verdict {
    Verdict::fail(format!("inspect_failed: {e}"))
}

async fn license_present(expected: Option<&str>, ctx: &CheckContext<'_>) -> Verdict {
    match ctx.inspector.license(&ctx.submission.artifact).await {
        Ok(None) => Verdict::fail("no license file"),
        Ok(Some(found)) => match expected {
            Some(want) if !found.eq_ignore_ascii_case(want) => {
                Verdict::fail(format!("license is {found}, expected {want}"))
                    .with_evidence(json!({ "license": found }))
            }
            _ => Verdict::from_bool(true, format!("{found} license present"))
                .with_evidence(json!({ "license": found })),
        },
        Err(e) => inspect_failed(e),
    }
}

async fn created_within(hours: u32, ctx: &CheckContext<'_>) -> Verdict {
    let issued_at = ctx.task.issued_at;
    match ctx.inspector.created_at(&ctx.submission.artifact).await {
        Ok(Some(created)) => {
            let deadline = issued_at + TimeDelta::hours(i64::from(hours));
            let evidence = json!({
                "created_at": created,
                "issued_at": issued_at,
            });
            if created < issued_at {
                Verdict::fail("repository predates the task").with_evidence(evidence)
            } else if created > deadline {
                Verdict::fail(format!("repository created more than {hours}h after issuance"))
                    .with_evidence(evidence)
            } else {
                Verdict::from_bool(true, "repository created within the window")
                    .with_evidence(evidence)
            }
        }
        Ok(None) => Verdict::fail("creation time unknown"),
        Err(e) => inspect_failed(e),
    }
}

async fn content_quality(path: &str, rubric: &str, ctx: &CheckContext<'_>) -> Verdict {
    let content = match ctx.inspector.read_file(&ctx.submission.artifact, path).await {
        Ok(content) => content,
        Err(InspectError::NotFound(_)) => return Verdict::fail(format!("{path} not found")),
        Err(e) => return inspect_failed(e),
    };
    let content: String = content.chars().take(MAX_JUDGED_CHARS).collect();

    match ctx.judge.judge(&content, rubric).await {
        Ok(judgement) => Verdict::new(judgement.score, judgement.rationale.clone())
            .with_evidence(json!({ "path": path, "rationale": judgement.rationale })),
        Err(e) => {
            tracing::warn!(task_id = %ctx.task.id, "Content-quality judge failed: {e}");
            Verdict::fail(JUDGE_UNAVAILABLE).with_evidence(json!({ "error": e.to_string() }))
        }
    }
}

async fn dynamic(check: &CheckDescriptor, doc: &dyn Document) -> Result<Verdict, BrowserError> {
    let verdict = match check {
        CheckDescriptor::Expression(expression) => {
            let passed = doc.expression(expression).await?;
            Verdict::from_bool(passed, if passed { "expression true" } else { "expression false" })
                .with_evidence(json!({ "expression": expression }))
        }
        CheckDescriptor::Named(NamedCheck::TitleMatches { pattern }) => {
            let title = doc.title().await?;
            let passed = matches_pattern(pattern, &title);
            Verdict::from_bool(
                passed,
                if passed {
                    "title matches".to_string()
                } else {
                    format!("title '{title}' does not match '{pattern}'")
                },
            )
            .with_evidence(json!({ "title": title }))
        }
        CheckDescriptor::Named(NamedCheck::ElementExists { selector }) => {
            let found = doc.element_exists(selector).await?;
            Verdict::from_bool(
                found,
                if found {
                    format!("{selector} found")
                } else {
                    format!("no element matches {selector}")
                },
            )
            .with_evidence(json!({ "selector": selector }))
        }
        CheckDescriptor::Named(NamedCheck::TextMatches { selector, pattern }) => {
            match doc.text(selector).await? {
                None => Verdict::fail(format!("no element matches {selector}"))
                    .with_evidence(json!({ "selector": selector })),
                Some(text) => {
                    let passed = matches_pattern(pattern, &text);
                    Verdict::from_bool(
                        passed,
                        if passed {
                            "text matches".to_string()
                        } else {
                            format!("text of {selector} does not match '{pattern}'")
                        },
                    )
                    .with_evidence(json!({ "selector": selector, "text": text }))
                }
            }
        }
        CheckDescriptor::Named(NamedCheck::AttributePresent {
            selector,
            attribute,
            value,
        }) => match doc.attribute(selector, attribute).await? {
            None => Verdict::fail(format!("no element matches {selector}"))
                .with_evidence(json!({ "selector": selector })),
            Some(None) => Verdict::fail(format!("{selector} has no {attribute} attribute"))
                .with_evidence(json!({ "selector": selector })),
            Some(Some(actual)) => {
                let passed = value.as_deref().is_none_or(|want| want == actual);
                Verdict::from_bool(
                    passed,
                    if passed {
                        format!("{attribute} present")
                    } else {
                        format!("{attribute} is '{actual}'")
                    },
                )
                .with_evidence(json!({ "selector": selector, "value": actual }))
            }
        },
        CheckDescriptor::Named(NamedCheck::ClickThen {
            selector,
            expression,
        }) => {
            if !doc.click(selector).await? {
                Verdict::fail(format!("no element matches {selector}"))
                    .with_evidence(json!({ "selector": selector }))
            } else {
                let passed = doc.expression(expression).await?;
                Verdict::from_bool(
                    passed,
                    if passed {
                        "post-condition holds after click"
                    } else {
                        "post-condition false after click"
                    },
                )
                .with_evidence(json!({ "selector": selector, "expression": expression }))
            }
        }
        CheckDescriptor::Named(other) => {
            return Err(BrowserError::Script(format!(
                "{:?} is not a page check",
                other.family()
            )));
        }
        CheckDescriptor::Unrecognized(_) => Verdict::fail(UNRECOGNIZED_CHECK),
    };
    Ok(verdict)
}

/// Regex match, or a plain substring test when `pattern` is not a valid regex.
pub fn matches_pattern(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => text.contains(pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeInspector, FakeJudge, FakePage, sample_task};
    use gradeline_types::ArtifactReference;

    fn submission(task: &Task) -> Submission {
        Submission::new(
            task.id.clone(),
            task.nonce.clone(),
            ArtifactReference::new("https://github.com/a/site").with_pages_url("https://a.github.io/site/"),
        )
    }

    async fn run(check: CheckDescriptor, page: Result<&dyn Document, &str>) -> (CheckKind, Verdict) {
        let task = sample_task(Vec::new());
        let submission = submission(&task);
        let inspector = FakeInspector::complete(task.issued_at);
        let judge = FakeJudge::score(0.7);
        let ctx = CheckContext {
            task: &task,
            submission: &submission,
            inspector: &inspector,
            judge: &judge,
            page,
            timeout: Duration::from_secs(5),
        };
        run_check(&CheckEntry::new("check", check), &ctx).await
    }

    fn named(check: NamedCheck) -> CheckDescriptor {
        CheckDescriptor::Named(check)
    }

    #[tokio::test]
    async fn test_static_checks() {
        let (kind, v) = run(
            named(NamedCheck::LicensePresent { expected: Some("mit".into()) }),
            Err("unused"),
        )
        .await;
        assert_eq!(kind, CheckKind::Static);
        assert_eq!(v.score, 1.0);

        let (_, v) = run(
            named(NamedCheck::LicensePresent { expected: Some("Apache-2.0".into()) }),
            Err("unused"),
        )
        .await;
        assert_eq!(v.score, 0.0);

        let (_, v) = run(named(NamedCheck::CreatedWithin { hours: 24 }), Err("unused")).await;
        assert_eq!(v.score, 1.0);

        let (_, v) = run(named(NamedCheck::FileExists { path: "index.html".into() }), Err("unused")).await;
        assert_eq!(v.score, 1.0);
        let (_, v) = run(named(NamedCheck::FileExists { path: "nope.txt".into() }), Err("unused")).await;
        assert_eq!(v.score, 0.0);
    }

    #[tokio::test]
    async fn test_content_quality_uses_judge_score() {
        let (kind, v) = run(
            named(NamedCheck::ContentQuality {
                path: "README.md".into(),
                rubric: "explains".into(),
            }),
            Err("unused"),
        )
        .await;
        assert_eq!(kind, CheckKind::ContentQuality);
        assert_eq!(v.score, 0.7);
        assert!(v.evidence.unwrap()["rationale"].is_string());
    }

    #[tokio::test]
    async fn test_dynamic_named_and_expression_checks() {
        let page = FakePage::sales_page();
        let doc: &dyn Document = &page;

        let (kind, v) = run(named(NamedCheck::TitleMatches { pattern: "Sales Summary 1a2b3c4d".into() }), Ok(doc)).await;
        assert_eq!(kind, CheckKind::Dynamic);
        assert_eq!(v.score, 1.0);

        let (_, v) = run(named(NamedCheck::ElementExists { selector: "#total-sales".into() }), Ok(doc)).await;
        assert_eq!(v.score, 1.0);
        let (_, v) = run(named(NamedCheck::ElementExists { selector: "#missing".into() }), Ok(doc)).await;
        assert_eq!(v.score, 0.0);

        let (_, v) = run(
            named(NamedCheck::TextMatches { selector: "#total-currency".into(), pattern: "EUR".into() }),
            Ok(doc),
        )
        .await;
        assert_eq!(v.score, 1.0);

        let (_, v) = run(
            named(NamedCheck::AttributePresent {
                selector: "#currency-picker option".into(),
                attribute: "value".into(),
                value: Some("USD".into()),
            }),
            Ok(doc),
        )
        .await;
        assert_eq!(v.score, 0.0);
        assert!(v.reason.contains("EUR"));

        let (_, v) = run(
            named(NamedCheck::ClickThen {
                selector: "#region-filter-North".into(),
                expression: "region === 'North'".into(),
            }),
            Ok(doc),
        )
        .await;
        assert_eq!(v.score, 1.0);

        let (_, v) = run(CheckDescriptor::Expression("bootstrap".into()), Ok(doc)).await;
        assert_eq!(v.score, 1.0);
    }

    #[tokio::test]
    async fn test_script_error_is_zero_not_fault() {
        let page = FakePage::sales_page();
        let doc: &dyn Document = &page;
        let (kind, v) = run(CheckDescriptor::Expression("undefinedThing()".into()), Ok(doc)).await;
        assert_eq!(kind, CheckKind::Dynamic);
        assert_eq!(v.score, 0.0);
        assert!(v.reason.starts_with("script_error"));
    }

    #[tokio::test]
    async fn test_dynamic_without_page() {
        let (_, v) = run(named(NamedCheck::ElementExists { selector: "#x".into() }), Err("no browser configured")).await;
        assert_eq!(v.reason, BROWSER_UNAVAILABLE);
        assert_eq!(v.score, 0.0);
    }

    #[tokio::test]
    async fn test_unrecognized_is_skipped() {
        let (kind, v) = run(
            CheckDescriptor::Unrecognized(json!({ "type": "lighthouse", "min": 90 })),
            Err("unused"),
        )
        .await;
        assert_eq!(kind, CheckKind::Skipped);
        assert_eq!(v.reason, UNRECOGNIZED_CHECK);
        assert_eq!(v.score, 0.0);
    }

    #[test]
    fn test_matches_pattern_falls_back_to_literal() {
        assert!(matches_pattern("Sales Summary [0-9a-f]{8}", "Sales Summary 1a2b3c4d"));
        assert!(matches_pattern("cost (USD", "total cost (USD)"));
        assert!(!matches_pattern("EUR", "USD"));
    }
}
