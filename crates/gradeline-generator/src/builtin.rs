use gradeline_types::{GradelineError, Template};

const BUILTIN_SOURCES: [(&str, &str); 3] = [
    ("sum-of-sales", include_str!("../templates/sum-of-sales.json")),
    (
        "markdown-to-html",
        include_str!("../templates/markdown-to-html.json"),
    ),
    (
        "github-user-created",
        include_str!("../templates/github-user-created.json"),
    ),
];

/// Templates shipped with the binary.
pub fn builtin_templates() -> Result<Vec<Template>, GradelineError> {
    BUILTIN_SOURCES
        .iter()
        .map(|(name, source)| {
            serde_json::from_str::<Template>(source).map_err(|e| {
                GradelineError::Serialization(format!("built-in template {name}: {e}"))
            })
        })
        .collect()
}
