//! Input validation for caller-supplied identifiers

use crate::error::SessionError;

pub const MAX_SESSION_ID_LEN: usize = 256;

pub fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    if session_id.is_empty() {
        return Err(SessionError::InvalidSessionId(
            "session id cannot be empty".to_string(),
        ));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::InvalidSessionId(format!(
            "session id too long (max {} chars)",
            MAX_SESSION_ID_LEN
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SessionError::InvalidSessionId(format!(
            "session id '{}' contains invalid characters",
            session_id
        )));
    }
    Ok(())
}
