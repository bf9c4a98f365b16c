use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use gradeline_types::{GradelineError, Template};

use crate::builtin::builtin_templates;

/// Immutable template registry, built once at start and shared by reference.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Template>,
}

impl TemplateRegistry {
    /// Build a registry, validating every template. Later templates replace
    /// earlier ones with the same id.
    pub fn new(templates: impl IntoIterator<Item = Template>) -> Result<Self, GradelineError> {
        let mut map = BTreeMap::new();
        for template in templates {
            template.validate()?;
            map.insert(template.id.clone(), template);
        }
        Ok(Self { templates: map })
    }

    /// Built-in templates only.
    pub fn builtin() -> Result<Self, GradelineError> {
        Self::new(builtin_templates()?)
    }

    /// Built-in templates overlaid with every `*.json` file in `dir`.
    pub fn with_overrides(dir: &Path) -> Result<Self> {
        let mut templates = builtin_templates()?;
        templates.extend(load_dir(dir)?);
        Ok(Self::new(templates)?)
    }

    /// The registry for a configured `templates_dir`: built-ins alone when
    /// none is set.
    pub fn from_config_dir(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::with_overrides(dir),
            None => Ok(Self::builtin()?),
        }
    }

    pub fn get(&self, id: &str) -> Result<&Template, GradelineError> {
        self.templates
            .get(id)
            .ok_or_else(|| GradelineError::UnknownTemplate(id.to_string()))
    }

    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Parse every `*.json` template file in a directory, sorted by file name.
pub fn load_dir(dir: &Path) -> Result<Vec<Template>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read templates directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut templates = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        let template: Template = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse template {}", path.display()))?;
        tracing::info!("Loaded template '{}' from {}", template.id, path.display());
        templates.push(template);
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unknown_template() {
        let registry = TemplateRegistry::builtin().unwrap();
        assert!(matches!(
            registry.get("does-not-exist"),
            Err(GradelineError::UnknownTemplate(_))
        ));
        assert!(registry.get("sum-of-sales").is_ok());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_overrides_from_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("custom.json"),
            r#"{"id": "custom", "name": "Custom", "rounds": [{"round": 1, "brief": "Hello {{seed}}"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = TemplateRegistry::from_config_dir(Some(dir.path())).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get("custom").unwrap().max_rounds(), 1);

        let builtin = TemplateRegistry::from_config_dir(None).unwrap();
        assert_eq!(builtin.len(), 3);
        assert!(builtin.get("custom").is_err());
    }

    #[test]
    fn test_malformed_template_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{"id": "bad", "name": "Bad", "rounds": [{"round": 1, "brief": "Hello {{who}}"}]}"#,
        )
        .unwrap();
        let err = TemplateRegistry::with_overrides(dir.path()).unwrap_err();
        assert!(err.to_string().contains("who"));
    }
}
