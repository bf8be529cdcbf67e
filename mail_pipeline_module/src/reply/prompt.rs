use crate::config::{CharacterProfile, GenerationLimits};

use super::{KnowledgeSnippet, ReplyRequest};

const MAX_SNIPPET_CHARS: usize = 4000;

pub(super) fn build_system_prompt(character: &CharacterProfile) -> String {
    format!(
        "You are {name}. {persona}",
        name = character.name,
        persona = character.persona.trim()
    )
}

pub(super) fn build_prompt(
    character: &CharacterProfile,
    request: &ReplyRequest,
    attachments: &[(String, String)],
) -> String {
    let knowledge_section = if request.knowledge.is_empty() {
        "- (no related knowledge found)".to_string()
    } else {
        request
            .knowledge
            .iter()
            .enumerate()
            .map(|(idx, snippet)| format_snippet(idx + 1, snippet))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let attachment_section = if attachments.is_empty() {
        "- (no attachment text)".to_string()
    } else {
        attachments
            .iter()
            .enumerate()
            .map(|(idx, (file_name, text))| {
                format!(
                    "[{idx}] {file_name}:\n{text}",
                    idx = idx + 1,
                    file_name = file_name,
                    text = clip(text.trim(), MAX_SNIPPET_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are {name}, answering an email on behalf of the people you work for.

Incoming email:
- From: {sender}
- Subject: {subject}
- Question:
{question}

Relevant knowledge (numbered, with source):
{knowledge_section}

Attachment contents (numbered):
{attachment_section}

Instructions:
1. Answer the question directly, using the facts above. Cite nothing that is not in them.
2. Do not include a greeting or a signature; they are added separately.
3. Do not leave placeholders such as [Name] or TBD in the reply.
4. Return the reply as a JSON object in a ```json fenced block:
```json
{{"reply_subject": "<subject line>", "reply_body": "<plain text body>"}}
```"#,
        name = character.name,
        sender = request.sender.trim(),
        subject = request.subject.trim(),
        question = request.question.trim(),
        knowledge_section = knowledge_section,
        attachment_section = attachment_section,
    )
}

fn format_snippet(position: usize, snippet: &KnowledgeSnippet) -> String {
    format!(
        "[{position}] (source: {source})\n{text}",
        position = position,
        source = snippet.source,
        text = clip(snippet.text.trim(), MAX_SNIPPET_CHARS)
    )
}

fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

pub(super) fn estimate_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Output cap keeping prompt + reply inside the context window. Never exceeds
/// what the window has left, even when that is below `min_output_tokens`.
pub(super) fn output_token_budget(prompt_chars: usize, limits: &GenerationLimits) -> u32 {
    let available = limits
        .context_tokens
        .saturating_sub(estimate_tokens(prompt_chars))
        .saturating_sub(limits.safety_margin_tokens);
    limits.max_output_tokens.min(available)
}

pub(super) struct FittedPrompt {
    pub prompt: String,
    pub snippets: usize,
    pub attachments: usize,
}

/// Builds the prompt, dropping the trailing (least related) knowledge
/// snippets and then trailing attachments until at least
/// `min_output_tokens` remain for the reply.
pub(super) fn build_fitted_prompt(
    character: &CharacterProfile,
    request: &ReplyRequest,
    attachments: &[(String, String)],
    system_chars: usize,
    limits: &GenerationLimits,
) -> FittedPrompt {
    let mut snippets = request.knowledge.len();
    let mut attachment_count = attachments.len();
    loop {
        let trimmed = ReplyRequest {
            knowledge: request.knowledge[..snippets].to_vec(),
            ..request.clone()
        };
        let prompt = build_prompt(character, &trimmed, &attachments[..attachment_count]);
        let fits = output_token_budget(prompt.len() + system_chars, limits) >= limits.min_output_tokens;
        if fits || (snippets == 0 && attachment_count == 0) {
            return FittedPrompt {
                prompt,
                snippets,
                attachments: attachment_count,
            };
        }
        if snippets > 0 {
            snippets -= 1;
        } else {
            attachment_count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn limits() -> GenerationLimits {
        GenerationLimits {
            context_tokens: 10_000,
            max_output_tokens: 4096,
            safety_margin_tokens: 1000,
            min_output_tokens: 256,
        }
    }

    #[test]
    fn budget_is_capped_by_max_output() {
        assert_eq!(output_token_budget(400, &limits()), 4096);
    }

    #[test]
    fn budget_shrinks_with_long_prompts() {
        // 28_000 chars -> 7000 tokens; 10_000 - 7000 - 1000 = 2000
        assert_eq!(output_token_budget(28_000, &limits()), 2000);
        assert_eq!(estimate_tokens(5), 2);
    }

    #[test]
    fn budget_never_overflows_the_window() {
        // 34_000 chars -> 8500 tokens; only 500 remain after the margin.
        assert_eq!(output_token_budget(34_000, &limits()), 500);
        // 35_200 chars -> 8800 tokens; 200 remain, below the 256 floor.
        assert_eq!(output_token_budget(35_200, &limits()), 200);
        assert_eq!(output_token_budget(1_000_000, &limits()), 0);
        for chars in [0, 20_000, 35_000, 36_000, 50_000] {
            let budget = output_token_budget(chars, &limits());
            assert!(estimate_tokens(chars) + budget + 1000 <= 10_000 || budget == 0);
        }
    }

    #[test]
    fn fitted_prompt_drops_trailing_snippets_then_attachments() {
        let character = CharacterProfile {
            id: "mira".to_string(),
            name: "Mira".to_string(),
            persona: "Warm and precise.".to_string(),
        };
        let bulky = "x".repeat(3_900);
        let request = ReplyRequest {
            email_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            sender: "alice@example.com".to_string(),
            subject: "Budget".to_string(),
            question: "What is the Q3 budget?".to_string(),
            knowledge: (0..12)
                .map(|idx| KnowledgeSnippet {
                    source: format!("email {}", idx),
                    text: bulky.clone(),
                })
                .collect(),
        };
        let attachments = vec![("plan.pdf".to_string(), bulky.clone())];
        let tight = GenerationLimits {
            context_tokens: 8_000,
            max_output_tokens: 4096,
            safety_margin_tokens: 1000,
            min_output_tokens: 256,
        };

        let fitted = build_fitted_prompt(&character, &request, &attachments, 40, &tight);
        assert!(fitted.snippets < 12);
        assert_eq!(fitted.attachments, 1);
        assert!(fitted.prompt.contains("(source: email 0)"));
        assert!(!fitted.prompt.contains("(source: email 11)"));
        let budget = output_token_budget(fitted.prompt.len() + 40, &tight);
        assert!(budget >= 256);
        assert!(estimate_tokens(fitted.prompt.len() + 40) + budget + 1000 <= 8_000);

        let cramped = GenerationLimits {
            context_tokens: 2_000,
            ..tight
        };
        let fitted = build_fitted_prompt(&character, &request, &attachments, 40, &cramped);
        assert_eq!(fitted.snippets, 0);
        assert_eq!(fitted.attachments, 0);
        assert!(fitted.prompt.contains("(no attachment text)"));
    }

    #[test]
    fn prompt_numbers_knowledge_and_attachments() {
        let character = CharacterProfile {
            id: "mira".to_string(),
            name: "Mira".to_string(),
            persona: "Warm and precise.".to_string(),
        };
        let request = ReplyRequest {
            email_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            sender: "alice@example.com".to_string(),
            subject: "Budget".to_string(),
            question: "What is the Q3 budget?".to_string(),
            knowledge: vec![
                KnowledgeSnippet {
                    source: "email from cfo@example.com".to_string(),
                    text: "Q3 budget is 10k".to_string(),
                },
                KnowledgeSnippet {
                    source: "email from ops@example.com".to_string(),
                    text: "Travel freeze".to_string(),
                },
            ],
        };
        let prompt = build_prompt(
            &character,
            &request,
            &[("plan.pdf".to_string(), "Line items".to_string())],
        );
        assert!(prompt.contains("[1] (source: email from cfo@example.com)\nQ3 budget is 10k"));
        assert!(prompt.contains("[2] (source: email from ops@example.com)"));
        assert!(prompt.contains("[1] plan.pdf:\nLine items"));
        assert!(prompt.contains("What is the Q3 budget?"));
        assert!(prompt.contains("\"reply_subject\""));
        assert_eq!(build_system_prompt(&character), "You are Mira. Warm and precise.");
    }
}
