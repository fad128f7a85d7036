//! Built-in transformers.

use super::{annotate, require_utf8, TransformOptions, Transformer};
use crate::error::InvalidInput;
use bytes::Bytes;

/// Returns the input unchanged. Accepts arbitrary bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transformer for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn transform(&self, input: &[u8], options: &TransformOptions) -> Result<Bytes, InvalidInput> {
        Ok(annotate(self.name(), Bytes::copy_from_slice(input), options))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Uppercase;

impl Transformer for Uppercase {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn transform(&self, input: &[u8], options: &TransformOptions) -> Result<Bytes, InvalidInput> {
        let text = require_utf8(input)?;
        Ok(annotate(self.name(), Bytes::from(text.to_uppercase()), options))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Lowercase;

impl Transformer for Lowercase {
    fn name(&self) -> &str {
        "lowercase"
    }

    fn transform(&self, input: &[u8], options: &TransformOptions) -> Result<Bytes, InvalidInput> {
        let text = require_utf8(input)?;
        Ok(annotate(self.name(), Bytes::from(text.to_lowercase()), options))
    }
}

/// Escapes the five HTML-significant characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlEscape;

impl Transformer for HtmlEscape {
    fn name(&self) -> &str {
        "html-escape"
    }

    fn transform(&self, input: &[u8], options: &TransformOptions) -> Result<Bytes, InvalidInput> {
        let text = require_utf8(input)?;
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                _ => out.push(c),
            }
        }
        Ok(annotate(self.name(), Bytes::from(out), options))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Trim;

impl Transformer for Trim {
    fn name(&self) -> &str {
        "trim"
    }

    fn transform(&self, input: &[u8], options: &TransformOptions) -> Result<Bytes, InvalidInput> {
        let text = require_utf8(input)?;
        Ok(annotate(
            self.name(),
            Bytes::copy_from_slice(text.trim().as_bytes()),
            options,
        ))
    }
}
