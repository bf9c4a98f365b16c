use anyhow::Result;

use gradeline_server::GradelineConfig;

/// Handle the `templates` command.
pub fn handle(config: &GradelineConfig) -> Result<()> {
    let registry = config.template_registry()?;
    if registry.is_empty() {
        println!("No templates registered.");
        return Ok(());
    }

    for template in registry.templates() {
        let max = template.max_rounds().min(config.rounds.max_rounds);
        println!("{} ({}): {} round(s)", template.id, template.name, max);
        for round in template.rounds.iter().filter(|r| r.round <= max) {
            let placeholders: Vec<&str> = round.placeholders.keys().map(String::as_str).collect();
            println!(
                "  round {}: {} check(s), {} attachment(s){}",
                round.round,
                round.checks.len(),
                round.attachments.len(),
                if placeholders.is_empty() {
                    String::new()
                } else {
                    format!(", placeholders: {}", placeholders.join(", "))
                },
            );
        }
    }
    Ok(())
}
