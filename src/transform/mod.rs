//! Content transformation.
//!
//! A [`Transformer`] maps request bytes to response bytes. Implementations
//! are pure: no I/O, no interior state, identical output for identical
//! input. This keeps the only business logic in the server testable without
//! a socket.
//!
//! ## Built-in transformers
//!
//! | name          | input        | effect                              |
//! |---------------|--------------|-------------------------------------|
//! | `identity`    | any bytes    | returned unchanged                  |
//! | `uppercase`   | UTF-8        | Unicode upper-casing                |
//! | `lowercase`   | UTF-8        | Unicode lower-casing                |
//! | `html-escape` | UTF-8        | `& < > " '` replaced with entities  |
//! | `trim`        | UTF-8        | surrounding whitespace removed      |
//!
//! Several names can be chained into a [`Pipeline`].

mod builtin;
mod options;

pub use builtin::{HtmlEscape, Identity, Lowercase, Trim, Uppercase};
pub use options::{OptionsError, TransformOptions};

use crate::error::InvalidInput;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// A pure content transformation.
pub trait Transformer: Send + Sync {
    /// Short name used in configuration and annotations.
    fn name(&self) -> &str;

    /// Transform `input` according to `options`.
    fn transform(&self, input: &[u8], options: &TransformOptions) -> Result<Bytes, InvalidInput>;
}

/// Look up a built-in transformer by name.
pub fn builtin(name: &str) -> Option<Arc<dyn Transformer>> {
    let transformer: Arc<dyn Transformer> = match name {
        "identity" => Arc::new(Identity),
        "uppercase" => Arc::new(Uppercase),
        "lowercase" => Arc::new(Lowercase),
        "html-escape" => Arc::new(HtmlEscape),
        "trim" => Arc::new(Trim),
        _ => return None,
    };
    Some(transformer)
}

/// Transformers applied in sequence, each one fed the previous output.
///
/// Annotation is applied once, by the pipeline, after the last stage.
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn Transformer>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Transformer>>) -> Self {
        let name = stages
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join("+");
        Self { name, stages }
    }

    /// Build a pipeline from built-in names, failing on the first unknown one.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let stages = names
            .iter()
            .map(|n| builtin(n.as_ref()).ok_or_else(|| n.as_ref().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(stages))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Transformer for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, input: &[u8], options: &TransformOptions) -> Result<Bytes, InvalidInput> {
        let plain = options.without_annotation();
        let mut current = Bytes::copy_from_slice(input);
        for stage in &self.stages {
            current = stage.transform(&current, &plain)?;
        }
        Ok(annotate(&self.name, current, options))
    }
}

/// Prefix `body` with `[hint] ` when annotation is enabled.
///
/// Falls back to the transformer's name when no style hint is set.
pub fn annotate(name: &str, body: Bytes, options: &TransformOptions) -> Bytes {
    if !options.annotate() {
        return body;
    }
    let label = options.style_hint().unwrap_or(name);
    let mut out = BytesMut::with_capacity(label.len() + 3 + body.len());
    out.extend_from_slice(b"[");
    out.extend_from_slice(label.as_bytes());
    out.extend_from_slice(b"] ");
    out.extend_from_slice(&body);
    out.freeze()
}

/// Borrow `input` as UTF-8, reporting the offset of the first bad byte.
pub(crate) fn require_utf8(input: &[u8]) -> Result<&str, InvalidInput> {
    std::str::from_utf8(input).map_err(|e| InvalidInput::Encoding(e.valid_up_to()))
}
