use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use gradeline_store::Store;
use gradeline_types::{
    Attachment, AttachmentContent, CheckDescriptor, CheckEntry, DeliveryStatus, GradelineError,
    PlaceholderSource, Recipient, RoundDefinition, SEED_PLACEHOLDER, Task, TaskId, Template,
    substitute,
};

use crate::registry::TemplateRegistry;
use crate::seed::{IssuanceContext, Seed, generate_nonce, task_id_for};

/// Length of the seed token substituted for `{{seed}}`.
pub const SEED_TOKEN_LEN: usize = 8;

const PRODUCTS: [&str; 6] = ["Widget", "Gadget", "Doohickey", "Sprocket", "Gizmo", "Thingamajig"];
const REGIONS: [&str; 4] = ["North", "South", "East", "West"];

/// A template round with every placeholder resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRound {
    pub template_id: String,
    pub round: u8,
    pub brief: String,
    pub attachments: Vec<Attachment>,
    pub checks: Vec<CheckEntry>,
    pub placeholders: BTreeMap<String, String>,
}

/// Turns template rounds into per-recipient tasks.
pub struct TaskGenerator {
    registry: Arc<TemplateRegistry>,
    store: Arc<dyn Store>,
    /// Upper bound on rounds regardless of what a template declares.
    round_cap: u8,
}

impl TaskGenerator {
    pub fn new(registry: Arc<TemplateRegistry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            round_cap: 3,
        }
    }

    pub fn with_round_cap(mut self, cap: u8) -> Self {
        self.round_cap = cap.max(1);
        self
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Effective maximum round for a template.
    pub fn max_rounds(&self, template: &Template) -> u8 {
        template.max_rounds().min(self.round_cap)
    }

    /// Resolve a round without issuing anything.
    pub fn resolve(
        &self,
        template_id: &str,
        email: &str,
        round: u8,
        time_bucket: &str,
    ) -> Result<ResolvedRound, GradelineError> {
        let template = self.registry.get(template_id)?;
        let max = self.max_rounds(template);
        let definition = match template.round(round) {
            Some(def) if round >= 1 && round <= max => def,
            _ => {
                return Err(GradelineError::RoundLimitExceeded {
                    template_id: template_id.to_string(),
                    requested: round,
                    max,
                });
            }
        };
        resolve_round(template_id, definition, Seed::derive(email, time_bucket))
    }

    /// Generate a task for `recipient` and insert it in `pending` status.
    pub async fn generate(
        &self,
        template_id: &str,
        recipient: &Recipient,
        round: u8,
        context: &IssuanceContext,
    ) -> Result<Task, GradelineError> {
        if self.store.is_deprecated(template_id).await? {
            return Err(GradelineError::TemplateDeprecated(template_id.to_string()));
        }
        let resolved = self.resolve(template_id, &recipient.email, round, &context.time_bucket)?;

        let previous_task_id = if round > 1 {
            self.store
                .tasks_for_recipient(template_id, &recipient.email)
                .await?
                .into_iter()
                .rev()
                .find(|t| t.round == round - 1)
                .map(|t| t.id)
        } else {
            None
        };

        let task = Task {
            id: TaskId::new(task_id_for(
                template_id,
                &recipient.email,
                round,
                context.issued_at,
            )),
            template_id: template_id.to_string(),
            recipient: recipient.clone(),
            round,
            brief: resolved.brief,
            attachments: resolved.attachments,
            checks: resolved.checks,
            placeholders: resolved.placeholders,
            nonce: generate_nonce(),
            nonce_consumed: false,
            time_bucket: context.time_bucket.clone(),
            issued_at: context.issued_at,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            previous_task_id,
        };

        self.store.insert_task(task.clone()).await?;
        tracing::info!(
            task_id = %task.id,
            email = %recipient.email,
            round,
            "Generated task for template '{template_id}'"
        );
        Ok(task)
    }
}

fn resolve_round(
    template_id: &str,
    definition: &RoundDefinition,
    seed: Seed,
) -> Result<ResolvedRound, GradelineError> {
    let missing = |placeholder: String| GradelineError::MissingResolution {
        template_id: template_id.to_string(),
        round: definition.round,
        placeholder,
    };

    let mut values = BTreeMap::new();
    values.insert(SEED_PLACEHOLDER.to_string(), seed.token(SEED_TOKEN_LEN));
    for (name, source) in &definition.placeholders {
        let value = resolve_placeholder(&seed, name, source).ok_or_else(|| missing(name.clone()))?;
        values.insert(name.clone(), value);
    }

    let brief = substitute(&definition.brief, &values).map_err(missing)?;

    let mut attachments = Vec::with_capacity(definition.attachments.len());
    for descriptor in &definition.attachments {
        let name = substitute(&descriptor.name, &values).map_err(missing)?;
        let content = match &descriptor.content {
            AttachmentContent::Inline { text } => substitute(text, &values).map_err(missing)?,
            AttachmentContent::SalesCsv { rows } => sales_csv(&seed, &name, *rows),
        };
        attachments.push(Attachment {
            url: format!(
                "data:{};base64,{}",
                descriptor.media_type,
                BASE64.encode(content.as_bytes())
            ),
            name,
            media_type: descriptor.media_type.clone(),
        });
    }

    let mut checks = Vec::with_capacity(definition.checks.len());
    for entry in &definition.checks {
        checks.push(CheckEntry {
            label: substitute(&entry.label, &values).map_err(missing)?,
            weight: entry.weight,
            check: resolve_descriptor(&entry.check, &values).map_err(missing)?,
        });
    }

    Ok(ResolvedRound {
        template_id: template_id.to_string(),
        round: definition.round,
        brief,
        attachments,
        checks,
        placeholders: values,
    })
}

fn resolve_placeholder(seed: &Seed, name: &str, source: &PlaceholderSource) -> Option<String> {
    match source {
        PlaceholderSource::Choices { values } => {
            if values.is_empty() {
                return None;
            }
            let idx = (seed.draw(name) % values.len() as u64) as usize;
            values.get(idx).cloned()
        }
        PlaceholderSource::SeedToken { length } => {
            (*length > 0).then(|| seed.sub_token(name, *length))
        }
        PlaceholderSource::Integer { min, max } => {
            if min > max {
                return None;
            }
            let span = (*max as i128 - *min as i128 + 1) as u128;
            let offset = (seed.draw(name) as u128 % span) as i128;
            Some((*min as i128 + offset).to_string())
        }
    }
}

/// Substitute placeholders in every string of a check descriptor.
fn resolve_descriptor(
    descriptor: &CheckDescriptor,
    values: &BTreeMap<String, String>,
) -> Result<CheckDescriptor, String> {
    let value = serde_json::to_value(descriptor).map_err(|e| e.to_string())?;
    let resolved = substitute_json(value, values)?;
    // Untagged deserialization never fails: unknown shapes land in `Unrecognized`.
    serde_json::from_value(resolved).map_err(|e| e.to_string())
}

fn substitute_json(
    value: serde_json::Value,
    values: &BTreeMap<String, String>,
) -> Result<serde_json::Value, String> {
    use serde_json::Value;
    Ok(match value {
        Value::String(s) => Value::String(substitute(&s, values)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute_json(v, values))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| substitute_json(v, values).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
        other => other,
    })
}

/// Seeded `product,region,sales` CSV.
fn sales_csv(seed: &Seed, label: &str, rows: usize) -> String {
    let mut csv = String::from("product,region,sales\n");
    for row in 0..rows {
        let draw = seed.draw(&format!("{label}:{row}"));
        let product = PRODUCTS[(draw % PRODUCTS.len() as u64) as usize];
        let region = REGIONS[((draw >> 8) % REGIONS.len() as u64) as usize];
        let cents = (draw >> 16) % 100_000;
        csv.push_str(&format!("{product},{region},{}.{:02}\n", cents / 100, cents % 100));
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gradeline_store::InMemoryStore;
    use gradeline_types::NamedCheck;
    use proptest::prelude::*;

    fn generator() -> TaskGenerator {
        TaskGenerator::new(
            Arc::new(TemplateRegistry::builtin().unwrap()),
            Arc::new(InMemoryStore::new()),
        )
    }

    fn recipient() -> Recipient {
        Recipient::new("a@x.edu", "http://localhost:9/hook", "s3cret")
    }

    fn decode_attachment(attachment: &Attachment) -> String {
        let encoded = attachment.url.split(";base64,").nth(1).unwrap();
        String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap()
    }

    #[test]
    fn test_sum_of_sales_brief_and_title_check_share_seed() {
        let issuer = generator();
        let resolved = issuer
            .resolve("sum-of-sales", "a@x.edu", 1, "2025-10-17-12")
            .unwrap();
        let token = Seed::derive("a@x.edu", "2025-10-17-12").token(SEED_TOKEN_LEN);

        assert!(resolved.brief.contains(&format!("Sales Summary {token}")));
        let has_title_check = resolved.checks.iter().any(|c| {
            c.check
                == CheckDescriptor::Named(NamedCheck::TitleMatches {
                    pattern: format!("Sales Summary {token}"),
                })
        });
        assert!(has_title_check);
    }

    #[test]
    fn test_sales_csv_attachment_is_data_uri() {
        let issuer = generator();
        let resolved = issuer
            .resolve("sum-of-sales", "a@x.edu", 1, "2025-10-17-12")
            .unwrap();
        let csv = &resolved.attachments[0];
        assert_eq!(csv.name, "data.csv");
        assert!(csv.url.starts_with("data:text/csv;base64,"));
        let text = decode_attachment(csv);
        assert!(text.starts_with("product,region,sales\n"));
        assert_eq!(text.lines().count(), 13);
    }

    #[test]
    fn test_round_two_resolves_currency_in_checks() {
        let issuer = generator();
        let resolved = issuer
            .resolve("sum-of-sales", "a@x.edu", 2, "2025-10-17-12")
            .unwrap();
        let currency = resolved.placeholders.get("currency").unwrap();
        assert!(resolved.brief.contains(currency.as_str()));
        assert!(
            resolved
                .checks
                .iter()
                .any(|c| c.label == format!("Currency picker offers {currency}"))
        );
    }

    #[test]
    fn test_unknown_template_and_round_limit() {
        let issuer = generator();
        assert!(matches!(
            issuer.resolve("nope", "a@x.edu", 1, "b"),
            Err(GradelineError::UnknownTemplate(_))
        ));
        assert!(matches!(
            issuer.resolve("sum-of-sales", "a@x.edu", 4, "b"),
            Err(GradelineError::RoundLimitExceeded { max: 3, .. })
        ));
        assert!(matches!(
            issuer.resolve("sum-of-sales", "a@x.edu", 0, "b"),
            Err(GradelineError::RoundLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_round_cap_limits_template_rounds() {
        let issuer = generator().with_round_cap(2);
        assert!(matches!(
            issuer.resolve("sum-of-sales", "a@x.edu", 3, "b"),
            Err(GradelineError::RoundLimitExceeded { max: 2, .. })
        ));
    }

    #[test]
    fn test_integer_placeholder_in_range() {
        let issuer = generator();
        let resolved = issuer
            .resolve("markdown-to-html", "b@x.edu", 2, "2025-10-17-12")
            .unwrap();
        let n: i64 = resolved.placeholders["min_words"].parse().unwrap();
        assert!((5..=15).contains(&n));
    }

    #[tokio::test]
    async fn test_generate_inserts_pending_task() {
        let store = Arc::new(InMemoryStore::new());
        let issuer = TaskGenerator::new(Arc::new(TemplateRegistry::builtin().unwrap()), store.clone());
        let at = Utc.with_ymd_and_hms(2025, 10, 17, 12, 5, 0).unwrap();
        let task = issuer
            .generate("sum-of-sales", &recipient(), 1, &IssuanceContext::at(at))
            .await
            .unwrap();

        assert_eq!(task.status, DeliveryStatus::Pending);
        assert_eq!(task.nonce.len(), 64);
        assert_eq!(task.time_bucket, "2025-10-17-12");
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.nonce, task.nonce);
    }

    #[tokio::test]
    async fn test_later_round_links_previous_task() {
        let store = Arc::new(InMemoryStore::new());
        let issuer = TaskGenerator::new(Arc::new(TemplateRegistry::builtin().unwrap()), store.clone());
        let first = issuer
            .generate("sum-of-sales", &recipient(), 1, &IssuanceContext::now())
            .await
            .unwrap();
        let second = issuer
            .generate("sum-of-sales", &recipient(), 2, &IssuanceContext::now())
            .await
            .unwrap();
        assert_eq!(second.previous_task_id, Some(first.id.clone()));
        // Round 1 task is left intact.
        let first_again = store.get_task(&first.id).await.unwrap().unwrap();
        assert_eq!(first_again.round, 1);
    }

    #[tokio::test]
    async fn test_deprecated_template_refused() {
        let store = Arc::new(InMemoryStore::new());
        store.deprecate_template("sum-of-sales").await.unwrap();
        let issuer = TaskGenerator::new(Arc::new(TemplateRegistry::builtin().unwrap()), store);
        let err = issuer
            .generate("sum-of-sales", &recipient(), 1, &IssuanceContext::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GradelineError::TemplateDeprecated(_)));
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(
            email in "[a-z]{1,10}@[a-z]{1,6}\\.edu",
            hour in 0u32..24,
            round in 1u8..=3,
        ) {
            let issuer = generator();
            let bucket = format!("2025-10-17-{hour:02}");
            let a = issuer.resolve("sum-of-sales", &email, round, &bucket).unwrap();
            let b = issuer.resolve("sum-of-sales", &email, round, &bucket).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_builtins_never_miss_resolution(
            email in "[a-z]{1,10}@[a-z]{1,6}\\.edu",
            bucket in "[0-9]{4}-[0-9]{2}-[0-9]{2}-[0-9]{2}",
        ) {
            let issuer = generator();
            for template in issuer.registry().templates() {
                for round in 1..=issuer.max_rounds(template) {
                    let resolved = issuer.resolve(&template.id, &email, round, &bucket);
                    prop_assert!(resolved.is_ok(), "{} round {}: {:?}", template.id, round, resolved.err());
                }
            }
        }
    }
}
