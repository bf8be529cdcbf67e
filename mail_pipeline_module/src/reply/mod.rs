//! Retrieval-augmented reply generation.

mod parse;
mod prompt;
mod template;

use std::sync::Arc;

use model_gateway_module::{CompletionRequest, Generator};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{CharacterProfile, GenerationLimits};
use crate::dual_store::DualStore;

pub use parse::{parse_reply, ParsedReply};
pub use template::{sender_display_name, ResolvedTemplate};

pub const SAFE_DEFAULT_BODY: &str =
    "Thank you for your email. We have received your message and will get back to you shortly.";

/// A retrieved fact offered to the model, with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub source: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub email_id: Uuid,
    /// Owner of the email; attachment text is only read for this user.
    pub user_id: String,
    pub sender: String,
    pub subject: String,
    pub question: String,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeSnippet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedReply {
    pub subject: String,
    pub body: String,
    /// True when the canned reply was used because generation failed.
    pub fallback: bool,
}

#[derive(Clone)]
pub struct ReplyGenerator {
    store: DualStore,
    generator: Arc<dyn Generator>,
    character: CharacterProfile,
    limits: GenerationLimits,
}

impl ReplyGenerator {
    pub fn new(
        store: DualStore,
        generator: Arc<dyn Generator>,
        character: CharacterProfile,
        limits: GenerationLimits,
    ) -> Self {
        Self {
            store,
            generator,
            character,
            limits,
        }
    }

    pub fn character(&self) -> &CharacterProfile {
        &self.character
    }

    /// Always returns a sendable reply; generation failures yield the safe
    /// default body.
    pub async fn generate(&self, request: &ReplyRequest) -> GeneratedReply {
        let template = self.template().await;
        let attachments = self
            .store
            .attachment_texts(&request.user_id, request.email_id)
            .await;

        let system = prompt::build_system_prompt(&self.character);
        let fitted = prompt::build_fitted_prompt(
            &self.character,
            request,
            &attachments,
            system.len(),
            &self.limits,
        );
        let max_output_tokens =
            prompt::output_token_budget(fitted.prompt.len() + system.len(), &self.limits);
        if max_output_tokens == 0 {
            warn!("prompt for email {} leaves no room for a reply", request.email_id);
            return safe_default(&template, request);
        }
        if fitted.snippets < request.knowledge.len() || fitted.attachments < attachments.len() {
            info!(
                "trimmed prompt for email {} to {} snippet(s) and {} attachment(s)",
                request.email_id, fitted.snippets, fitted.attachments
            );
        }

        let completion = CompletionRequest {
            system: Some(system),
            prompt: fitted.prompt,
            max_output_tokens,
        };
        let output = match self.generator.complete(&completion).await {
            Ok(output) => output,
            Err(err) => {
                warn!("reply generation failed for email {}: {}", request.email_id, err);
                return safe_default(&template, request);
            }
        };

        let parsed = parse_reply(&output);
        let body = if parsed.body.trim().is_empty() {
            SAFE_DEFAULT_BODY.to_string()
        } else {
            parsed.body
        };
        let subject = parsed
            .subject
            .unwrap_or_else(|| reply_subject(&request.subject));

        info!(
            "generated reply for email {} ({} attachment text(s), {} snippet(s))",
            request.email_id, fitted.attachments, fitted.snippets
        );
        GeneratedReply {
            subject,
            body: template.render(&body, &request.sender),
            fallback: false,
        }
    }

    /// The canned reply, rendered with the character's template, without
    /// calling the model.
    pub async fn safe_default(&self, request: &ReplyRequest) -> GeneratedReply {
        safe_default(&self.template().await, request)
    }

    async fn template(&self) -> ResolvedTemplate {
        ResolvedTemplate::resolve(
            self.store.reply_template(&self.character.id).await,
            &self.character,
        )
    }
}

fn safe_default(template: &ResolvedTemplate, request: &ReplyRequest) -> GeneratedReply {
    GeneratedReply {
        subject: reply_subject(&request.subject),
        body: template.render(SAFE_DEFAULT_BODY, &request.sender),
        fallback: true,
    }
}

/// "Re: " prefixed subject, without stacking prefixes.
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.is_empty() {
        return "Re: your message".to_string();
    }
    if subject.to_ascii_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use chrono::Utc;

    use crate::blob_store::MemoryBlobStore;
    use crate::config::PipelineConfig;
    use crate::record::{AttachmentRecord, EmailRecord, ReplyTemplate, ATTACHMENT_TOO_LARGE};
    use crate::test_support::FakeGenerator;
    use crate::warehouse::{MemoryWarehouse, Warehouse};

    fn generator_with(
        fake: Arc<FakeGenerator>,
    ) -> (Arc<MemoryWarehouse>, ReplyGenerator) {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = PipelineConfig::default();
        let generator = ReplyGenerator::new(
            DualStore::new(Arc::new(MemoryBlobStore::new()), warehouse.clone()),
            fake,
            config.character,
            config.generation,
        );
        (warehouse, generator)
    }

    fn request(email_id: Uuid) -> ReplyRequest {
        ReplyRequest {
            email_id,
            user_id: "user-1".to_string(),
            sender: "Alice <alice@example.com>".to_string(),
            subject: "Budget".to_string(),
            question: "What is the Q3 budget?".to_string(),
            knowledge: vec![KnowledgeSnippet {
                source: "email from cfo@example.com".to_string(),
                text: "Q3 budget is 10k".to_string(),
            }],
        }
    }

    fn attachment(email_id: Uuid, name: &str, text: &str) -> AttachmentRecord {
        AttachmentRecord {
            email_id,
            file_name: name.to_string(),
            blob_uri: format!("memory://attachments/{}", name),
            content_type: "text/plain".to_string(),
            size: 10,
            uploaded_at: Utc::now(),
            attachment_ref: format!("attachments/{}", name),
            extracted_text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn table_output_is_parsed_and_rendered() {
        let fake = Arc::new(FakeGenerator::replying("| x | Re: hi | Thanks! |"));
        let (_warehouse, generator) = generator_with(fake.clone());

        let reply = generator.generate(&request(Uuid::new_v4())).await;
        assert_eq!(reply.subject, "Re: hi");
        assert_eq!(reply.body, "Hi Alice,\n\nThanks!\n\nBest regards,\nAssistant");
        assert!(!reply.fallback);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    fn owned_email(warehouse: &MemoryWarehouse, user_id: &str) -> Uuid {
        let record = EmailRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            from_address: "alice@example.com".to_string(),
            subject: "Budget".to_string(),
            body_text: "What is the Q3 budget?".to_string(),
            timestamp: Utc::now(),
            provider_message_id: None,
            thread_id: None,
            references: Vec::new(),
            body_blob_uri: "memory://body/x".to_string(),
            attachment_blob_uris: Vec::new(),
        };
        warehouse.insert_email(&record).expect("insert email");
        record.id
    }

    #[tokio::test]
    async fn prompt_includes_non_sentinel_attachment_text() {
        let fake = Arc::new(FakeGenerator::replying("It is 10k."));
        let (warehouse, generator) = generator_with(fake.clone());
        let email_id = owned_email(&warehouse, "user-1");
        warehouse
            .insert_attachment(&attachment(email_id, "plan.txt", "Line items: travel 2k"))
            .expect("insert");
        warehouse
            .insert_attachment(&attachment(email_id, "huge.bin", ATTACHMENT_TOO_LARGE))
            .expect("insert");

        let reply = generator.generate(&request(email_id)).await;
        let prompt = fake.last_prompt();
        assert!(prompt.contains("Line items: travel 2k"));
        assert!(!prompt.contains(ATTACHMENT_TOO_LARGE));
        assert!(prompt.contains("Q3 budget is 10k"));
        assert_eq!(reply.subject, "Re: Budget");

        let request = fake.last_request.lock().expect("lock").clone().expect("request");
        assert!(request.max_output_tokens <= 4096);
        assert!(request.system.unwrap_or_default().starts_with("You are Assistant."));
    }

    #[tokio::test]
    async fn attachment_text_of_another_users_email_is_not_prompted() {
        let fake = Arc::new(FakeGenerator::replying("ok"));
        let (warehouse, generator) = generator_with(fake.clone());
        let email_id = owned_email(&warehouse, "owner");
        warehouse
            .insert_attachment(&attachment(email_id, "salaries.txt", "TOP-SECRET-PAYROLL"))
            .expect("insert");

        generator.generate(&request(email_id)).await;
        assert!(!fake.last_prompt().contains("TOP-SECRET-PAYROLL"));
    }

    #[tokio::test]
    async fn safe_default_skips_the_model() {
        let fake = Arc::new(FakeGenerator::replying("unused"));
        let (_warehouse, generator) = generator_with(fake.clone());
        let reply = generator.safe_default(&request(Uuid::new_v4())).await;
        assert!(reply.fallback);
        assert!(reply.body.contains(SAFE_DEFAULT_BODY));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generation_failure_returns_safe_default() {
        let (_warehouse, generator) = generator_with(Arc::new(FakeGenerator::failing()));
        let reply = generator.generate(&request(Uuid::new_v4())).await;
        assert!(reply.fallback);
        assert_eq!(reply.subject, "Re: Budget");
        assert!(reply.body.contains(SAFE_DEFAULT_BODY));
    }

    #[tokio::test]
    async fn stored_template_is_applied() {
        let fake = Arc::new(FakeGenerator::replying("```json\n{\"reply_subject\":\"Re: Q3\",\"reply_body\":\"10k.\"}\n```"));
        let (warehouse, generator) = generator_with(fake);
        warehouse.put_reply_template(
            "default",
            ReplyTemplate {
                greeting: Some("Hello".to_string()),
                company: Some("Acme".to_string()),
                ..ReplyTemplate::default()
            },
        );

        let reply = generator.generate(&request(Uuid::new_v4())).await;
        assert_eq!(reply.subject, "Re: Q3");
        assert_eq!(
            reply.body,
            "Hello Alice,\n\n10k.\n\nBest regards,\nAssistant\nAcme"
        );
    }

    #[test]
    fn reply_subject_does_not_stack_prefixes() {
        assert_eq!(reply_subject("RE: Budget"), "RE: Budget");
        assert_eq!(reply_subject("Budget"), "Re: Budget");
        assert_eq!(reply_subject(" "), "Re: your message");
    }
}
