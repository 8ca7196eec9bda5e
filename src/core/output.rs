//! Terminal rendering of event bodies and per-participant activity.

use crate::core::event::Event;
use crate::core::time::to_iso;

/// Fold `text` onto one line and cap it at `max_chars` characters, marking the cut with `…`.
pub fn one_line(text: &str, max_chars: usize) -> String {
    let mut folded = String::new();
    for word in text.split_whitespace() {
        if !folded.is_empty() {
            folded.push(' ');
        }
        folded.push_str(word);
    }
    match folded.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &folded[..cut]),
        None => folded,
    }
}

/// `<type> <ts>` for one record.
pub fn headline(event: &Event) -> String {
    format!("{} {}", event.kind.type_name(), to_iso(&event.ts))
}

/// Headlines of a participant's `events` in the order given, at most `max_items` of them.
pub fn activity_digest(events: &[&Event], max_items: usize) -> String {
    let mut digest = events
        .iter()
        .take(max_items)
        .map(|e| headline(e))
        .collect::<Vec<_>>()
        .join(" | ");
    let hidden = events.len().saturating_sub(max_items);
    if hidden > 0 {
        digest.push_str(&format!(" (+{} more)", hidden));
    }
    digest
}
