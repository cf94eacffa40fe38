use thiserror::Error;
use url::Url;

use crate::types::OutgoingContent;

/// Maximum message length, in characters.
pub const MAX_BODY_LEN: usize = 500;

/// Reasons an outgoing message is rejected before any I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message is empty")]
    Empty,
    #[error("message is {len} characters long, the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("invalid media url: {0}")]
    InvalidMediaUrl(String),
}

/// Validate and normalize outgoing content.
///
/// Text and captions are trimmed; a whitespace-only caption is dropped.
pub fn validate_outgoing(
    content: OutgoingContent,
    max_len: usize,
) -> Result<OutgoingContent, ValidationError> {
    match content {
        OutgoingContent::Text(body) => {
            let body = body.trim();
            if body.is_empty() {
                return Err(ValidationError::Empty);
            }
            check_len(body, max_len)?;
            Ok(OutgoingContent::Text(body.to_owned()))
        }
        OutgoingContent::Media { url, kind, caption } => {
            let url = url.trim();
            if url.is_empty() {
                return Err(ValidationError::Empty);
            }
            let parsed =
                Url::parse(url).map_err(|err| ValidationError::InvalidMediaUrl(err.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError::InvalidMediaUrl(format!(
                    "unsupported scheme '{}'",
                    parsed.scheme()
                )));
            }

            let caption = caption
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty());
            if let Some(caption) = &caption {
                check_len(caption, max_len)?;
            }

            Ok(OutgoingContent::Media {
                url: parsed.to_string(),
                kind,
                caption,
            })
        }
    }
}

fn check_len(value: &str, max_len: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len > max_len {
        return Err(ValidationError::TooLong { len, max: max_len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    #[test]
    fn rejects_whitespace_only_text() {
        let err = validate_outgoing(OutgoingContent::Text("   \n\t".into()), MAX_BODY_LEN)
            .expect_err("blank text must be rejected");
        assert_eq!(err, ValidationError::Empty);
    }

    #[test]
    fn trims_text() {
        let content = validate_outgoing(OutgoingContent::Text("  hola  ".into()), MAX_BODY_LEN)
            .expect("text should pass");
        assert_eq!(content, OutgoingContent::Text("hola".into()));
    }

    #[test]
    fn counts_characters_not_bytes() {
        let body = "ñ".repeat(MAX_BODY_LEN);
        validate_outgoing(OutgoingContent::Text(body), MAX_BODY_LEN)
            .expect("500 multibyte chars should pass");

        let err = validate_outgoing(OutgoingContent::Text("a".repeat(501)), MAX_BODY_LEN)
            .expect_err("501 chars must fail");
        assert_eq!(err, ValidationError::TooLong { len: 501, max: 500 });
    }

    #[test]
    fn media_requires_http_url() {
        let err = validate_outgoing(
            OutgoingContent::Media {
                url: "ftp://files.example.org/a.png".into(),
                kind: MediaKind::Image,
                caption: None,
            },
            MAX_BODY_LEN,
        )
        .expect_err("ftp must be rejected");
        assert!(matches!(err, ValidationError::InvalidMediaUrl(_)));

        let err = validate_outgoing(
            OutgoingContent::Media {
                url: "not a url".into(),
                kind: MediaKind::Image,
                caption: None,
            },
            MAX_BODY_LEN,
        )
        .expect_err("garbage must be rejected");
        assert!(matches!(err, ValidationError::InvalidMediaUrl(_)));
    }

    #[test]
    fn media_drops_blank_caption() {
        let content = validate_outgoing(
            OutgoingContent::Media {
                url: "https://cdn.example.org/a.png".into(),
                kind: MediaKind::Image,
                caption: Some("  ".into()),
            },
            MAX_BODY_LEN,
        )
        .expect("media should pass");
        assert_eq!(
            content,
            OutgoingContent::Media {
                url: "https://cdn.example.org/a.png".into(),
                kind: MediaKind::Image,
                caption: None,
            }
        );
    }
}
