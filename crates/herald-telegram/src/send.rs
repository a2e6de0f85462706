//! Message splitting for Telegram.
//!
//! Telegram's message limit is 4096 characters. We use 4090 for safety.

/// Maximum characters per Telegram message.
pub const CHUNK_MAX: usize = 4090;

/// Split `text` into chunks of at most `max` characters, breaking on line
/// boundaries where possible and on spaces otherwise. Lines longer than `max`
/// are hard-split on character boundaries.
pub fn split_chunks(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let cost = if current.is_empty() { line_len } else { 1 + line_len };

        if !current.is_empty() && current_len + cost > max {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > max {
            chunks.extend(split_long_line(line, max));
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long_line(line: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = line;
    while remaining.chars().count() > max {
        // Byte offset of the character just past the limit.
        let limit = remaining
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let split_at = match remaining[..limit].rfind(' ') {
            Some(i) if i > 0 => i,
            _ => limit,
        };
        out.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    if !remaining.is_empty() {
        out.push(remaining.to_string());
    }
    out
}
