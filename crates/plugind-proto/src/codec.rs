use serde::Deserialize;

/// Lines longer than this are reported through the error callback and
/// dropped without being parsed.
pub const MAX_LINE_LEN: usize = 5 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RawLine {
    Session {
        session_id: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    Heartbeat,
    Error {
        #[serde(default)]
        message: String,
    },
    Log {
        #[serde(default)]
        message: String,
    },
}

/// Decodes one newline-delimited envelope, firing exactly one of the four
/// callbacks. Never returns an error itself: malformed input is reported
/// through `on_error` so the stream stays open.
pub fn decode_line(
    line: &str,
    mut on_session: impl FnMut(&str, &serde_json::Value),
    mut on_heartbeat: impl FnMut(),
    mut on_error: impl FnMut(&str),
    mut on_log: impl FnMut(&str),
) {
    if line.len() > MAX_LINE_LEN {
        on_error(&format!(
            "line exceeds maximum length of {MAX_LINE_LEN} bytes, dropped"
        ));
        return;
    }

    match serde_json::from_str::<RawLine>(line) {
        Ok(RawLine::Session { session_id, data }) => on_session(&session_id, &data),
        Ok(RawLine::Heartbeat) => on_heartbeat(),
        Ok(RawLine::Error { message }) => on_error(&message),
        Ok(RawLine::Log { message }) => on_log(&message),
        Err(e) => on_error(&format!("malformed envelope: {e}")),
    }
}

/// Encodes a `session` event line.
pub fn encode_session(session_id: &str, data: &serde_json::Value) -> String {
    serde_json::json!({ "event": "session", "session_id": session_id, "data": data }).to_string()
}

/// Encodes a `heartbeat` event line.
pub fn encode_heartbeat() -> String {
    serde_json::json!({ "event": "heartbeat" }).to_string()
}

/// Encodes an `error` event line.
pub fn encode_error(message: &str) -> String {
    serde_json::json!({ "event": "error", "message": message }).to_string()
}

/// Encodes a `log` event line.
pub fn encode_log(message: &str) -> String {
    serde_json::json!({ "event": "log", "message": message }).to_string()
}
