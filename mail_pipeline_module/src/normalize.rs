use std::sync::LazyLock;

use kuchiki::traits::*;
use kuchiki::NodeRef;
use regex::Regex;

pub const EMPTY_BODY_PLACEHOLDER: &str = "(no content)";

// "----- Original Message -----", "---------- Forwarded message ---------",
// "Begin forwarded message:" and friends, each on a line of its own.
static QUOTE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[ \t>]*(?:[-_=]{2,}[ \t]*)?(?:begin[ \t]+)?(?:original|forwarded)[ \t]+message[ \t]*(?:[-_=]{2,}|:)?[ \t]*$",
    )
    .expect("quote boundary regex")
});

/// Plain-text body with quoted/forwarded history removed. Never empty.
pub fn normalize_body(text: Option<&str>, html: Option<&str>, subject: Option<&str>) -> String {
    let raw = match text.filter(|value| !value.trim().is_empty()) {
        Some(text) => text.replace("\r\n", "\n"),
        None => html
            .filter(|value| !value.trim().is_empty())
            .map(html_to_text)
            .unwrap_or_default(),
    };

    let stripped = strip_quoted_content(&raw);
    if !stripped.is_empty() {
        return stripped;
    }
    subject
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| EMPTY_BODY_PLACEHOLDER.to_string())
}

/// Drop everything from the first quote boundary marker onward.
pub fn strip_quoted_content(body: &str) -> String {
    let head = match QUOTE_BOUNDARY.find(body) {
        Some(boundary) => &body[..boundary.start()],
        None => body,
    };
    head.trim().to_string()
}

pub fn html_to_text(html: &str) -> String {
    let document = kuchiki::parse_html().one(html);
    remove_elements_by_selector(&document, "head, script, style, meta, link, title, noscript");

    let mut out = String::new();
    collect_text(&document, &mut out);
    tidy_lines(&out)
}

fn remove_elements_by_selector(document: &NodeRef, selector: &str) {
    if let Ok(selection) = document.select(selector) {
        let nodes: Vec<NodeRef> = selection.map(|node| node.as_node().clone()).collect();
        for node in nodes {
            node.detach();
        }
    }
}

fn collect_text(node: &NodeRef, out: &mut String) {
    for child in node.children() {
        if let Some(text) = child.as_text() {
            out.push_str(&text.borrow());
            continue;
        }
        let Some(element) = child.as_element() else {
            collect_text(&child, out);
            continue;
        };
        let tag: &str = &element.name.local;
        if tag.eq_ignore_ascii_case("br") {
            out.push('\n');
            continue;
        }
        let block = is_block_tag(tag);
        if block && !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        collect_text(&child, out);
        if block && !out.ends_with('\n') {
            out.push('\n');
        }
    }
}

fn is_block_tag(tag: &str) -> bool {
    matches!(
        tag.to_ascii_lowercase().as_str(),
        "p" | "div"
            | "li"
            | "tr"
            | "table"
            | "ul"
            | "ol"
            | "blockquote"
            | "pre"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "hr"
    )
}

fn tidy_lines(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() && lines.last().map(|l| l.is_empty()).unwrap_or(true) {
            continue;
        }
        lines.push(collapsed);
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_original_message_block() {
        let body = "Hello\n\n----- Original Message -----\nOld stuff";
        assert_eq!(normalize_body(Some(body), None, None), "Hello");
    }

    #[test]
    fn strips_forwarded_message_block() {
        let body = "See below.\r\n\r\n---------- Forwarded message ---------\r\nFrom: someone";
        assert_eq!(normalize_body(Some(body), None, None), "See below.");
    }

    #[test]
    fn keeps_prose_mentioning_original_message() {
        let body = "I read the original message you sent yesterday.";
        assert_eq!(normalize_body(Some(body), None, None), body);
    }

    #[test]
    fn falls_back_to_subject_then_placeholder() {
        assert_eq!(
            normalize_body(Some("  "), None, Some("Invoice #42")),
            "Invoice #42"
        );
        assert_eq!(
            normalize_body(None, None, Some(" ")),
            EMPTY_BODY_PLACEHOLDER
        );
        let quoted_only = "-----Original Message-----\nprevious";
        assert_eq!(
            normalize_body(Some(quoted_only), None, Some("Re: plan")),
            "Re: plan"
        );
    }

    #[test]
    fn converts_html_when_text_missing() {
        let html = "<html><head><style>p{}</style></head><body><p>Hi  team,</p><div>Numbers<br>attached</div><script>x()</script></body></html>";
        let body = normalize_body(None, Some(html), None);
        assert_eq!(body, "Hi team,\nNumbers\nattached");
    }
}
