//! Options shared by every transformer.

use thiserror::Error;

const MAX_STYLE_HINT_LEN: usize = 32;

/// Options recognised by every transformer. Validated on construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOptions {
    annotate: bool,
    style_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("style hint must not be empty")]
    EmptyStyleHint,

    #[error("style hint longer than 32 characters")]
    StyleHintTooLong,

    #[error("style hint contains invalid character {0:?}")]
    InvalidStyleHint(char),
}

impl TransformOptions {
    pub fn new(annotate: bool, style_hint: Option<String>) -> Result<Self, OptionsError> {
        if let Some(hint) = &style_hint {
            validate_style_hint(hint)?;
        }
        Ok(Self {
            annotate,
            style_hint,
        })
    }

    pub fn annotate(&self) -> bool {
        self.annotate
    }

    pub fn style_hint(&self) -> Option<&str> {
        self.style_hint.as_deref()
    }

    /// Same options with annotation switched off.
    pub(crate) fn without_annotation(&self) -> Self {
        Self {
            annotate: false,
            style_hint: self.style_hint.clone(),
        }
    }
}

fn validate_style_hint(hint: &str) -> Result<(), OptionsError> {
    if hint.is_empty() {
        return Err(OptionsError::EmptyStyleHint);
    }
    if hint.len() > MAX_STYLE_HINT_LEN {
        return Err(OptionsError::StyleHintTooLong);
    }
    match hint
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        Some(c) => Err(OptionsError::InvalidStyleHint(c)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_options() {
        let options = TransformOptions::new(true, Some("code-block_2".to_string())).unwrap();
        assert!(options.annotate());
        assert_eq!(options.style_hint(), Some("code-block_2"));

        let options = TransformOptions::new(false, None).unwrap();
        assert_eq!(options, TransformOptions::default());
    }

    #[test]
    fn test_invalid_style_hints() {
        assert_eq!(
            TransformOptions::new(true, Some(String::new())),
            Err(OptionsError::EmptyStyleHint)
        );
        assert_eq!(
            TransformOptions::new(true, Some("x".repeat(33))),
            Err(OptionsError::StyleHintTooLong)
        );
        assert_eq!(
            TransformOptions::new(false, Some("bad hint".to_string())),
            Err(OptionsError::InvalidStyleHint(' '))
        );
    }
}
