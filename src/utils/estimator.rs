//! Deterministic prompt-token heuristic used only for `usage` reporting.
//!
//! CJK characters count roughly one token per two characters, everything
//! else one per four. Message-array estimation adds a flat 4-token
//! per-message overhead; plain strings (already-concatenated prompts,
//! streamed completions) do not.

use crate::proxy::mappers::middle::MiddleMessage;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3000}'..='\u{303F}'
        | '\u{FF00}'..='\u{FFEF}'
    )
}

pub fn estimate_text(text: &str) -> u32 {
    let mut cjk: u32 = 0;
    let mut other: u32 = 0;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk.div_ceil(2) + other.div_ceil(4)
}

pub fn estimate_messages(messages: &[MiddleMessage]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_text(&m.content) + 4)
        .sum()
}
