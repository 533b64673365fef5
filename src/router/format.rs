use crate::store::Message;
use regex::Regex;
use std::sync::OnceLock;

/// Render a pending batch as the XML block the agent consumes.
pub fn format_messages(messages: &[Message]) -> String {
    let mut out = String::from("<messages>\n");
    for msg in messages {
        out.push_str("  <message from=\"");
        out.push_str(&escape_xml(&msg.sender_name));
        out.push_str("\" ts=\"");
        out.push_str(&escape_xml(&msg.timestamp));
        out.push_str("\">\n    <content>");
        out.push_str(&escape_xml(&msg.content));
        out.push_str("</content>\n  </message>\n");
    }
    out.push_str("</messages>");
    out
}

pub fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Remove every `<internal>…</internal>` block (non-greedy, spans lines) and
/// trim. An empty result means nothing should reach the channel.
pub fn strip_internal(text: &str) -> String {
    static INTERNAL: OnceLock<Regex> = OnceLock::new();
    let re = INTERNAL.get_or_init(|| {
        Regex::new(r"(?s)<internal>.*?</internal>").expect("internal-block regex is valid")
    });
    re.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::user_message;

    fn unescape_xml(raw: &str) -> String {
        raw.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&")
    }

    #[test]
    fn formats_batch_with_sender_and_timestamp() {
        let messages = vec![
            user_message("m1", "tg:100", "hi", "2026-01-01T00:00:01.000Z"),
            user_message("m2", "tg:100", "how are you", "2026-01-01T00:00:02.000Z"),
        ];

        let formatted = format_messages(&messages);
        assert!(formatted.starts_with("<messages>"));
        assert!(formatted.ends_with("</messages>"));
        assert!(formatted.contains("from=\"Alice\""));
        assert!(formatted.contains("ts=\"2026-01-01T00:00:01.000Z\""));
        assert!(formatted.contains("<content>hi</content>"));
        assert!(formatted.contains("<content>how are you</content>"));
    }

    #[test]
    fn hostile_content_survives_escaping() {
        let content = r#"</content></message><script>alert("x & y")</script>"#;
        let messages = vec![user_message("m1", "tg:100", content, "2026-01-01T00:00:01.000Z")];

        let formatted = format_messages(&messages);
        // The raw markup must not appear unescaped anywhere in the prompt.
        assert!(!formatted.contains("<script>"));

        let escaped = formatted
            .split("<content>")
            .nth(1)
            .unwrap()
            .split("</content>")
            .next()
            .unwrap();
        assert_eq!(unescape_xml(escaped), content);
    }

    #[test]
    fn strip_internal_removes_blocks_across_lines() {
        let text = "before\n<internal>\nthinking\nmore thinking\n</internal>\nafter";
        assert_eq!(strip_internal(text), "before\n\nafter");
    }

    #[test]
    fn strip_internal_is_non_greedy() {
        let text = "<internal>a</internal>keep<internal>b</internal>";
        assert_eq!(strip_internal(text), "keep");
    }

    #[test]
    fn strip_internal_can_empty_the_message() {
        assert_eq!(strip_internal("<internal>only notes</internal>"), "");
        assert_eq!(strip_internal("   \n  "), "");
    }

    #[test]
    fn strip_internal_leaves_plain_text_alone() {
        assert_eq!(strip_internal("hello there"), "hello there");
    }
}
