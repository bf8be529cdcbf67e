use serde_json::Value;

/// Subject/body pulled out of model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub subject: Option<String>,
    pub body: String,
}

const SUBJECT_KEYS: [&str; 2] = ["reply_subject", "subject"];
const BODY_KEYS: [&str; 2] = ["reply_body", "body"];

/// Reads model output as, in order: plain text, the first data row of a pipe
/// table, a fenced (or bare) JSON object, and finally the raw text.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let trimmed = raw.trim();
    let raw_reply = ParsedReply {
        subject: None,
        body: trimmed.to_string(),
    };

    if looks_like_plain_text(trimmed) {
        return raw_reply;
    }
    if let Some(parsed) = parse_table(trimmed) {
        return parsed;
    }
    if let Some(parsed) = parse_json(trimmed) {
        return parsed;
    }
    raw_reply
}

fn looks_like_plain_text(text: &str) -> bool {
    !text.contains("```") && !text.starts_with('{') && !text.lines().any(is_table_row)
}

fn is_table_row(line: &str) -> bool {
    let line = line.trim();
    line.len() > 1 && line.starts_with('|') && line.ends_with('|')
}

fn is_separator_row(cells: &[String]) -> bool {
    !cells.is_empty()
        && cells.iter().all(|cell| {
            !cell.is_empty() && cell.chars().all(|ch| matches!(ch, '-' | ':' | ' '))
        })
}

fn split_cells(line: &str) -> Vec<String> {
    let inner = line.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn header_column(cells: &[String], name: &str) -> Option<usize> {
    let suffix = format!("_{}", name);
    cells.iter().position(|cell| {
        let normalized = cell.to_ascii_lowercase().replace([' ', '-'], "_");
        normalized == name || normalized.ends_with(&suffix)
    })
}

fn looks_like_header(cells: &[String]) -> bool {
    header_column(cells, "subject").is_some() || header_column(cells, "body").is_some()
}

fn parse_table(text: &str) -> Option<ParsedReply> {
    let rows: Vec<Vec<String>> = text
        .lines()
        .filter(|line| is_table_row(line))
        .map(split_cells)
        .collect();
    if rows.is_empty() {
        return None;
    }

    let mut header: Option<&Vec<String>> = None;
    let mut data: Option<&Vec<String>> = None;
    for (idx, row) in rows.iter().enumerate() {
        if is_separator_row(row) {
            continue;
        }
        let followed_by_separator = rows.get(idx + 1).is_some_and(|next| is_separator_row(next));
        if header.is_none() && data.is_none() && (followed_by_separator || looks_like_header(row)) {
            header = Some(row);
            continue;
        }
        data = Some(row);
        break;
    }
    let row = data?;

    let located = header.and_then(|header| {
        let body = header_column(header, "body")?;
        Some((header_column(header, "subject"), body))
    });
    let (subject_idx, body_idx) = match located {
        Some(columns) => columns,
        None if row.len() >= 3 => (Some(1), 2),
        None if row.len() == 2 => (Some(0), 1),
        None => (None, 0),
    };

    let body = row.get(body_idx).map(|cell| unescape_cell(cell))?;
    if body.trim().is_empty() {
        return None;
    }
    let subject = subject_idx
        .and_then(|idx| row.get(idx))
        .map(|cell| unescape_cell(cell))
        .filter(|cell| !cell.trim().is_empty());
    Some(ParsedReply { subject, body })
}

fn unescape_cell(cell: &str) -> String {
    cell.replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("\\n", "\n")
        .trim()
        .to_string()
}

fn parse_json(text: &str) -> Option<ParsedReply> {
    let candidate = fenced_block(text).or_else(|| bare_object(text))?;
    let object: Value = serde_json::from_str(candidate).ok()?;
    let body = first_text(&object, &BODY_KEYS)?;
    Some(ParsedReply {
        subject: first_text(&object, &SUBJECT_KEYS),
        body,
    })
}

/// First non-blank string among `keys`, in order.
fn first_text(object: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let content_start = after_fence.find('\n').map(|idx| idx + 1).unwrap_or(0);
    let content = &after_fence[content_start..];
    let end = content.find("```").unwrap_or(content.len());
    let block = content[..end].trim();
    if block.starts_with('{') {
        Some(block)
    } else {
        None
    }
}

fn bare_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}
