//! Slash commands: /start registration and /stats status report.
//!
//! Both reach persisted state only through the ConversationStore contract.

use parrot_config::ContactsConfig;
use parrot_ipc::InlineButton;
use std::time::Duration;

pub const WELCOME_TEXT: &str = "Hi! I'm Parrot, a conversational assistant. \
Message me directly, or mention me in a group, and I'll answer. \
I can also describe images, voice notes and small text files you send me.";

pub fn start_keyboard(contacts: &ContactsConfig) -> Vec<Vec<InlineButton>> {
    let mut rows = Vec::new();
    if let Some(support) = &contacts.support_handle {
        rows.push(vec![InlineButton {
            text: "Support".to_string(),
            url: format!("https://t.me/{}", support.trim_start_matches('@')),
        }]);
    }
    if let Some(developer) = &contacts.developer_handle {
        rows.push(vec![InlineButton {
            text: "Developer".to_string(),
            url: format!("https://t.me/{}", developer.trim_start_matches('@')),
        }]);
    }
    rows
}

pub fn stats_text(user_count: usize, uptime: Duration, gateway_ok: Option<bool>) -> String {
    let mut text = format!(
        "Status\nUsers: {}\nUptime: {}",
        user_count,
        format_uptime(uptime)
    );
    if let Some(ok) = gateway_ok {
        text.push_str(if ok {
            "\nGateway: reachable"
        } else {
            "\nGateway: unreachable"
        });
    }
    text
}

fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}
