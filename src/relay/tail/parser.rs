//! JSON-lines record parsing.

use tracing::warn;

use crate::relay::error::{RelayError, Result};
use crate::relay::types::LogEvent;

/// Parse one log line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<LogEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| RelayError::MalformedRecord(e.to_string()))
}

/// Parse lines in order, dropping (and logging) malformed ones.
pub fn parse_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<LogEvent> {
    let mut events = Vec::new();
    for line in lines {
        match parse_line(line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => warn!("Skipping log line: {}", e),
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::LogEventKind;

    mod lines {
        use super::*;

        #[test]
        fn test_parse_valid_line() {
            let event = parse_line(r#"{"type":"user","uuid":"u1","sessionId":"s"}"#)
                .unwrap()
                .unwrap();
            assert_eq!(event.kind, LogEventKind::User);
            assert_eq!(event.session_id.as_deref(), Some("s"));
        }

        #[test]
        fn test_blank_line_is_skipped() {
            assert!(parse_line("   ").unwrap().is_none());
        }

        #[test]
        fn test_malformed_line_is_error() {
            assert!(matches!(
                parse_line("{not json"),
                Err(RelayError::MalformedRecord(_))
            ));
            assert!(matches!(
                parse_line(r#"{"uuid":"missing type"}"#),
                Err(RelayError::MalformedRecord(_))
            ));
        }

        #[test]
        fn test_malformed_lines_do_not_abort_batch() {
            let events = parse_lines([
                r#"{"type":"user","uuid":"1"}"#,
                "garbage",
                "",
                r#"{"type":"assistant","uuid":"2"}"#,
            ]);
            let uuids: Vec<_> = events.iter().filter_map(|e| e.uuid.as_deref()).collect();
            assert_eq!(uuids, vec!["1", "2"]);
        }
    }
}
