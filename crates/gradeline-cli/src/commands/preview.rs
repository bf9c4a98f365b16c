use anyhow::Result;
use std::sync::Arc;

use gradeline_generator::{ResolvedRound, TaskGenerator, time_bucket};
use gradeline_server::GradelineConfig;
use gradeline_store::InMemoryStore;

/// Handle the `preview` command: resolve a round without issuing a task.
pub fn handle(
    config: &GradelineConfig,
    template_id: &str,
    email: &str,
    bucket: Option<String>,
    round: u8,
) -> Result<()> {
    let registry = Arc::new(config.template_registry()?);
    let generator = TaskGenerator::new(registry, Arc::new(InMemoryStore::new()))
        .with_round_cap(config.rounds.max_rounds);
    let bucket = bucket.unwrap_or_else(|| time_bucket(chrono::Utc::now()));
    let resolved = generator.resolve(template_id, email, round, &bucket)?;
    print_resolved(&resolved, email, &bucket)
}

fn print_resolved(resolved: &ResolvedRound, email: &str, bucket: &str) -> Result<()> {
    println!("Template:  {} round {}", resolved.template_id, resolved.round);
    println!("Recipient: {email} (bucket {bucket})");
    println!();
    println!("Brief:");
    println!("  {}", resolved.brief);

    println!();
    println!("Placeholders:");
    for (name, value) in &resolved.placeholders {
        println!("  {name} = {value}");
    }

    if !resolved.attachments.is_empty() {
        println!();
        println!("Attachments:");
        for attachment in &resolved.attachments {
            println!(
                "  {} ({}, {} bytes as data URI)",
                attachment.name,
                attachment.media_type,
                attachment.url.len()
            );
        }
    }

    println!();
    println!("Checks:");
    for (i, entry) in resolved.checks.iter().enumerate() {
        println!(
            "  {}. {} [weight {:.1}] {}",
            i + 1,
            entry.label,
            entry.weight,
            serde_json::to_string(&entry.check)?
        );
    }
    Ok(())
}
