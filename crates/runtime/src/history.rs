//! Message-history trimming shared by the dispatcher and the autonomous
//! loop.

use vigil_llm::ChatMessage;

/// Trim to at most `max_messages`, keeping the most recent and making sure
/// the result opens with a request (not a dangling response or tool
/// result). With `preserve_first`, the first message (the original task)
/// survives and the budget fills from the tail.
pub fn trim_message_history(
    messages: Vec<ChatMessage>,
    max_messages: usize,
    preserve_first: bool,
) -> Vec<ChatMessage> {
    if messages.len() <= max_messages {
        return messages;
    }

    if preserve_first && max_messages >= 2 {
        let mut iter = messages.into_iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };
        let rest: Vec<ChatMessage> = iter.collect();
        let tail_len = max_messages - 1;
        let mut tail: Vec<ChatMessage> = rest
            .into_iter()
            .rev()
            .take(tail_len)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        while tail.first().map(|m| !m.is_request()).unwrap_or(false) {
            tail.remove(0);
        }
        let mut result = vec![first];
        result.extend(tail);
        return result;
    }

    let skip = messages.len() - max_messages;
    let mut trimmed: Vec<ChatMessage> = messages.into_iter().skip(skip).collect();
    while trimmed.first().map(|m| !m.is_request()).unwrap_or(false) {
        trimmed.remove(0);
    }
    trimmed
}
