//! Flattens the intermediate message list into the single prompt string the
//! DeepSeek completion endpoint expects.
//!
//! Rules: adjacent same-role messages merge (joined by a blank line);
//! assistant turns are wrapped in the chat template markers; the first
//! user/system turn is inlined raw and later ones carry the user marker;
//! tool outputs get their own marker with the originating call id.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::proxy::mappers::middle::MiddleMessage;

const ASSISTANT_OPEN: &str = "<\u{FF5C}Assistant\u{FF5C}>";
const END_OF_SENTENCE: &str = "<\u{FF5C}end\u{2581}of\u{2581}sentence\u{FF5C}>";
const USER_MARK: &str = "<\u{FF5C}User\u{FF5C}>";

static IMAGE_MARKDOWN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("image markdown regex"));

/// Markdown images survive as plain links so the upstream text model does
/// not choke on the `!` form.
fn rewrite_images(text: &str) -> String {
    IMAGE_MARKDOWN.replace_all(text, "[$1]($2)").to_string()
}

fn merge_adjacent(messages: &[MiddleMessage]) -> Vec<MiddleMessage> {
    let mut merged: Vec<MiddleMessage> = Vec::new();
    for msg in messages {
        if let Some(last) = merged.last_mut() {
            if last.role == msg.role && last.tool_call_id.is_none() && msg.tool_call_id.is_none() {
                if !msg.content.is_empty() {
                    if !last.content.is_empty() {
                        last.content.push_str("\n\n");
                    }
                    last.content.push_str(&msg.content);
                }
                continue;
            }
        }
        merged.push(msg.clone());
    }
    merged
}

pub fn build_prompt(messages: &[MiddleMessage]) -> String {
    let merged = merge_adjacent(messages);
    let mut prompt = String::new();
    let mut seen_user_or_system = false;

    for msg in &merged {
        let content = rewrite_images(&msg.content);
        match msg.role.as_str() {
            "assistant" => {
                prompt.push_str(ASSISTANT_OPEN);
                prompt.push_str(&content);
                prompt.push_str(END_OF_SENTENCE);
            }
            "tool" => {
                let id = msg.tool_call_id.as_deref().unwrap_or("unknown");
                prompt.push_str(&format!("<|tool_outputs id={}|>{}", id, content));
            }
            // user and system share the user channel.
            _ => {
                if seen_user_or_system {
                    prompt.push_str(USER_MARK);
                }
                prompt.push_str(&content);
                seen_user_or_system = true;
            }
        }
    }
    prompt
}
