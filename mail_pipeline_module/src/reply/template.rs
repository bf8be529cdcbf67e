use crate::config::CharacterProfile;
use crate::record::{normalize_address, ReplyTemplate};

const DEFAULT_GREETING: &str = "Hi";
const DEFAULT_SIGNATURE: &str = "Best regards,";
pub(crate) const DEFAULT_TEMPLATE: &str =
    "{{greeting}} {{sender_name}},\n\n{{body}}\n\n{{signature}}\n{{agent_name}}\n{{position}}\n{{company}}\n{{email}}";

/// Reply template with every field filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    pub greeting: String,
    pub signature: String,
    pub company: String,
    pub agent_name: String,
    pub position: String,
    pub email: String,
    pub template: String,
}

impl ResolvedTemplate {
    pub fn resolve(stored: Option<ReplyTemplate>, character: &CharacterProfile) -> Self {
        let stored = stored.unwrap_or_default();
        let pick = |value: Option<String>, default: &str| {
            value
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            greeting: pick(stored.greeting, DEFAULT_GREETING),
            signature: pick(stored.signature, DEFAULT_SIGNATURE),
            company: pick(stored.company, ""),
            agent_name: pick(stored.agent_name, &character.name),
            position: pick(stored.position, ""),
            email: pick(stored.email, ""),
            template: stored
                .template
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        }
    }

    /// Fills the placeholders. A template without `{{body}}` gets the body
    /// appended.
    pub fn render(&self, body: &str, sender: &str) -> String {
        let template = if self.template.contains("{{body}}") {
            self.template.clone()
        } else {
            format!("{}\n\n{{{{body}}}}", self.template.trim_end())
        };

        let mut lines: Vec<String> = Vec::new();
        for line in template.lines() {
            let had_placeholder = line.contains("{{");
            let rendered = line
                .replace("{{greeting}}", &self.greeting)
                .replace("{{sender_name}}", &sender_display_name(sender))
                .replace("{{agent_name}}", &self.agent_name)
                .replace("{{position}}", &self.position)
                .replace("{{company}}", &self.company)
                .replace("{{email}}", &self.email)
                .replace("{{signature}}", &self.signature)
                .replace("{{body}}", body.trim());
            let rendered = rendered.trim_end().to_string();
            // Lines that only held empty fields disappear entirely.
            if had_placeholder && rendered.trim().is_empty() {
                continue;
            }
            lines.push(rendered);
        }
        collapse_blank_lines(&lines).trim().to_string()
    }
}

/// "Alice Smith <alice@x.com>" -> "Alice Smith"; "bob.jones@x.com" -> "Bob Jones".
pub fn sender_display_name(sender: &str) -> String {
    let trimmed = sender.trim();
    if let Some(start) = trimmed.find('<') {
        let name = trimmed[..start].trim().trim_matches('"').trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    let Some(address) = normalize_address(trimmed) else {
        return if trimmed.is_empty() {
            "there".to_string()
        } else {
            trimmed.to_string()
        };
    };
    let local = address.split('@').next().unwrap_or_default();
    let local = local.split('+').next().unwrap_or_default();
    let words: Vec<String> = local
        .split(|ch: char| matches!(ch, '.' | '_' | '-'))
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        "there".to_string()
    } else {
        words.join(" ")
    }
}

fn collapse_blank_lines(lines: &[String]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.trim().is_empty() && out.last().map(|l| l.trim().is_empty()).unwrap_or(true) {
            continue;
        }
        out.push(line);
    }
    out.join("\n")
}
