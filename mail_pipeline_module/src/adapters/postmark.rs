use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::record::{normalize_message_id, InboundAttachment, InboundEmail};

#[derive(Debug, thiserror::Error)]
pub enum PostmarkAdapterError {
    #[error("invalid postmark payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Postmark inbound webhook body.
#[derive(Debug, Clone, Deserialize)]
pub struct PostmarkInbound {
    #[serde(rename = "From")]
    pub from: Option<String>,
    #[serde(rename = "FromFull")]
    pub from_full: Option<PostmarkRecipient>,
    #[serde(rename = "ReplyTo")]
    pub reply_to: Option<String>,
    #[serde(rename = "Subject")]
    pub subject: Option<String>,
    #[serde(rename = "Date")]
    pub date: Option<String>,
    #[serde(rename = "TextBody")]
    pub text_body: Option<String>,
    #[serde(rename = "StrippedTextReply")]
    pub stripped_text_reply: Option<String>,
    #[serde(rename = "HtmlBody")]
    pub html_body: Option<String>,
    #[serde(rename = "MessageID", alias = "MessageId")]
    pub message_id: Option<String>,
    #[serde(rename = "Headers")]
    pub headers: Option<Vec<PostmarkHeader>>,
    #[serde(rename = "Attachments")]
    pub attachments: Option<Vec<PostmarkAttachment>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostmarkRecipient {
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Name")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostmarkHeader {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostmarkAttachment {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "ContentType")]
    pub content_type: Option<String>,
    #[serde(rename = "ContentLength")]
    pub content_length: Option<u64>,
}

impl PostmarkInbound {
    pub fn from_slice(body: &[u8]) -> Result<Self, PostmarkAdapterError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case(name))
                .map(|header| header.value.as_str())
        })
    }

    /// The RFC Message-ID header wins over Postmark's own id, which is only
    /// unique per Postmark account.
    pub fn external_message_id(&self) -> Option<String> {
        self.header_value("Message-ID")
            .or(self.message_id.as_deref())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn into_inbound(self) -> InboundEmail {
        let provider_message_id = self.external_message_id();

        let mut references: Vec<String> = self
            .header_value("References")
            .map(|value| {
                value
                    .split_whitespace()
                    .filter_map(normalize_message_id)
                    .collect()
            })
            .unwrap_or_default();
        let in_reply_to = self.header_value("In-Reply-To").and_then(normalize_message_id);
        if let Some(parent) = in_reply_to.as_ref() {
            if !references.contains(parent) {
                references.push(parent.clone());
            }
        }
        let thread_id = references.first().cloned();

        let mut from_addresses = Vec::new();
        if let Some(full) = self.from_full.as_ref() {
            from_addresses.push(full.email.clone());
        }
        if let Some(from) = self.from.as_ref() {
            if !from_addresses.iter().any(|known| from.contains(known.as_str())) {
                from_addresses.push(from.clone());
            }
        }
        if let Some(reply_to) = self.reply_to.as_ref().filter(|value| !value.trim().is_empty()) {
            from_addresses.push(reply_to.clone());
        }

        let date = self.date.as_deref().and_then(parse_postmark_date);

        let text = self
            .text_body
            .filter(|value| !value.trim().is_empty())
            .or(self.stripped_text_reply);

        let attachments = self
            .attachments
            .unwrap_or_default()
            .into_iter()
            .filter_map(decode_attachment)
            .collect();

        InboundEmail {
            from_addresses,
            subject: self.subject,
            text,
            html: self.html_body,
            date,
            provider_message_id,
            thread_id,
            references,
            attachments,
        }
    }
}

fn decode_attachment(attachment: PostmarkAttachment) -> Option<InboundAttachment> {
    let compact: String = attachment
        .content
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    match BASE64_STANDARD.decode(compact.as_bytes()) {
        Ok(content) => Some(InboundAttachment {
            filename: attachment.name,
            size: attachment.content_length.or(Some(content.len() as u64)),
            content,
            content_type: attachment
                .content_type
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        }),
        Err(err) => {
            warn!(
                "skipping postmark attachment {} with invalid base64: {}",
                attachment.name, err
            );
            None
        }
    }
}

/// Postmark sends RFC 2822 dates, sometimes with a `-04:00` style offset.
fn parse_postmark_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%a, %d %b %Y %H:%M:%S %:z"))
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
