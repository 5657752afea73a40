//! Prompt assembly for one model call.
//!
//! Ordering is load-bearing: persona first, then the windowed history, then
//! the multimodal summaries, then the current user text. Later content is
//! weighted higher by the model.

use parrot_gateway::ChatMessage;
use parrot_store::{ConversationTurn, Role};

pub fn build_context(
    persona: &str,
    recent: &[ConversationTurn],
    summaries: &[String],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(recent.len() + 2);
    messages.push(ChatMessage::system(persona));

    for turn in recent {
        let message = match turn.role {
            Role::System => ChatMessage::system(turn.content.clone()),
            Role::User => ChatMessage::user(turn.content.clone()),
            Role::Assistant => ChatMessage::assistant(turn.content.clone()),
        };
        messages.push(message);
    }

    messages.push(ChatMessage::user(render_user_message(summaries, user_text)));
    messages
}

/// Summaries go one per line, each already tagged with its source kind, and
/// the raw user text closes the message.
fn render_user_message(summaries: &[String], user_text: &str) -> String {
    if summaries.is_empty() {
        return user_text.to_string();
    }

    let mut rendered = String::from("Multimodal inputs:\n");
    for summary in summaries {
        rendered.push_str(summary);
        rendered.push('\n');
    }
    rendered.push('\n');
    rendered.push_str(user_text);
    rendered
}

#[cfg(test)]
mod tests {
    use super::build_context;
    use parrot_store::ConversationTurn;

    #[test]
    fn persona_comes_first_and_user_text_last() {
        let recent = vec![
            ConversationTurn::user("earlier question"),
            ConversationTurn::assistant("earlier answer"),
        ];
        let messages = build_context("you are parrot", &recent, &[], "new question");

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "you are parrot");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].role, "user");
        assert_eq!(messages[3].content, "new question");
    }

    #[test]
    fn summaries_are_tagged_lines_before_the_user_text() {
        let summaries = vec![
            "[image] a green parrot".to_string(),
            "[audio] hello there".to_string(),
        ];
        let messages = build_context("persona", &[], &summaries, "what do you see?");

        let last = &messages[messages.len() - 1];
        assert_eq!(last.role, "user");
        assert!(last.content.contains("[image] a green parrot\n"));
        assert!(last.content.contains("[audio] hello there\n"));
        assert!(last.content.ends_with("what do you see?"));
        let image_pos = last.content.find("[image]").expect("image line");
        let text_pos = last.content.find("what do you see?").expect("user text");
        assert!(image_pos < text_pos);
    }
}
