use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for ids derived from provider message ids.
const EMAIL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f3c_2a1e_9b7d_4c58_a2e1_5d0f_8c4b_13e7);

pub const NO_CONTENT_AVAILABLE: &str = "No content available";
pub const ATTACHMENT_NOT_FOUND: &str = "Attachment not found in storage";
pub const ATTACHMENT_TOO_LARGE: &str = "Attachment too large to process";
pub const EXTRACTION_FAILED: &str = "Failed to extract content from attachment";

/// True for placeholder texts that stand in for missing or failed content.
pub fn is_sentinel(text: &str) -> bool {
    matches!(
        text.trim(),
        NO_CONTENT_AVAILABLE | ATTACHMENT_NOT_FOUND | ATTACHMENT_TOO_LARGE | EXTRACTION_FAILED
    )
}

/// Inbound email as handed over by the mail-delivery collaborator, already
/// reduced to one provider-independent shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEmail {
    #[serde(default)]
    pub from_addresses: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAttachment {
    pub filename: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl InboundAttachment {
    pub fn byte_len(&self) -> u64 {
        self.size.unwrap_or(self.content.len() as u64)
    }
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: Uuid,
    pub user_id: String,
    pub from_address: String,
    pub subject: String,
    pub body_text: String,
    pub timestamp: DateTime<Utc>,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub references: Vec<String>,
    pub body_blob_uri: String,
    pub attachment_blob_uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub email_id: Uuid,
    pub file_name: String,
    pub blob_uri: String,
    pub content_type: String,
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
    pub attachment_ref: String,
    pub extracted_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub email_id: Uuid,
    pub body_text: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub id: Uuid,
    pub original_email_id: Uuid,
    pub reply_subject: String,
    pub reply_body: String,
    pub timestamp: DateTime<Utc>,
    pub sent_success: bool,
}

/// Per-character reply template row. Missing fields fall back to defaults at
/// render time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyTemplate {
    pub greeting: Option<String>,
    pub signature: Option<String>,
    pub company: Option<String>,
    pub agent_name: Option<String>,
    pub position: Option<String>,
    pub email: Option<String>,
    pub template: Option<String>,
}

/// Stable id for a provider message delivered to one user; random when the
/// provider gave none. The same message delivered to two users gets two ids.
pub fn derive_email_id(user_id: &str, provider_message_id: Option<&str>) -> Uuid {
    match provider_message_id.and_then(normalize_message_id) {
        Some(message_id) => {
            let mut name = Vec::with_capacity(user_id.len() + message_id.len() + 1);
            name.extend_from_slice(user_id.as_bytes());
            name.push(0);
            name.extend_from_slice(message_id.as_bytes());
            Uuid::new_v5(&EMAIL_ID_NAMESPACE, &name)
        }
        None => Uuid::new_v4(),
    }
}

pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|ch| matches!(ch, '<' | '>'));
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Lower-cased bare address from a `Name <addr>` or plain address string.
pub fn normalize_address(raw: &str) -> Option<String> {
    let mut value = raw.trim();
    if let (Some(start), Some(end)) = (value.rfind('<'), value.rfind('>')) {
        if start < end {
            value = &value[start + 1..end];
        }
    }
    if let Some(stripped) = value.strip_prefix("mailto:") {
        value = stripped;
    }
    let value = value.trim_matches(|ch: char| matches!(ch, '<' | '>' | '"' | '\'' | ',' | ';'));
    let (local, domain) = value.split_once('@')?;
    let (local, domain) = (local.trim(), domain.trim());
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(format!(
        "{}@{}",
        local.to_ascii_lowercase(),
        domain.to_ascii_lowercase()
    ))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let compact: String = encoded.chars().filter(|ch| !ch.is_whitespace()).collect();
        BASE64_STANDARD
            .decode(compact.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
