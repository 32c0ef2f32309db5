//! Graph API transport error types.
//!
//! Failures here fall into two operational buckets: authentication problems
//! (the token endpoint refused us) and transport/status problems on the API
//! call itself. Neither is retried inline - the periodic renewal and sweep
//! loops provide the retry cadence, and push notifications are re-fetched by
//! the delta path if a one-off call fails.

use thiserror::Error;

/// Longest response-body excerpt included in error messages. Bodies can
/// contain tokens or message content; keep excerpts short.
const BODY_EXCERPT_MAX_LEN: usize = 200;

/// Errors from the authenticated Graph transport.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The OAuth token request could not be sent.
    #[error("token request failed: {0}")]
    TokenRequest(#[source] reqwest::Error),

    /// The OAuth token endpoint returned a non-success status.
    #[error("token endpoint returned HTTP {status}: {body}")]
    TokenStatus { status: u16, body: String },

    /// The OAuth token response was not the expected JSON.
    #[error("decode token response: {0}")]
    TokenDecode(#[source] serde_json::Error),

    /// The API request itself failed at the transport level.
    #[error("graph request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Truncates a response body for inclusion in logs and error messages.
pub fn body_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_EXCERPT_MAX_LEN {
        return trimmed.to_string();
    }
    let mut end = BODY_EXCERPT_MAX_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..end], trimmed.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_excerpt_passes_short_bodies_through() {
        assert_eq!(body_excerpt("  short  "), "short");
    }

    #[test]
    fn body_excerpt_truncates_long_bodies() {
        let long = "x".repeat(500);
        let excerpt = body_excerpt(&long);
        assert!(excerpt.starts_with(&"x".repeat(200)));
        assert!(excerpt.contains("truncated 500 bytes"));
    }

    #[test]
    fn body_excerpt_respects_char_boundaries() {
        let long = "é".repeat(300);
        let excerpt = body_excerpt(&long);
        assert!(excerpt.contains("truncated"));
    }
}
