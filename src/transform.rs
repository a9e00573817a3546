//! Pre-diff content transforms.
//!
//! A transform rewrites entry bytes before they are diffed and before the
//! base checksum is taken, e.g. a class-file constant-pool optimizer. The
//! patcher must run the same transform over its base entries, otherwise
//! the recorded checksums will not match.

use std::borrow::Cow;

use crate::error::Result;

/// Suffix of entries the constant-pool optimizer understands.
pub const CLASS_SUFFIX: &str = ".class";

pub trait ContentTransform: Send + Sync {
    /// Whether this transform rewrites the entry at `path`.
    fn applies_to(&self, path: &str) -> bool;

    fn transform(&self, path: &str, data: &[u8]) -> Result<Vec<u8>>;
}

/// Adapts a closure into a transform selected by path suffix.
pub struct SuffixTransform<F> {
    suffix: String,
    rewrite: F,
}

impl<F> SuffixTransform<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    pub fn new(suffix: impl Into<String>, rewrite: F) -> Self {
        Self {
            suffix: suffix.into(),
            rewrite,
        }
    }

    /// Transform for `.class` entries.
    pub fn class_files(rewrite: F) -> Self {
        Self::new(CLASS_SUFFIX, rewrite)
    }
}

impl<F> ContentTransform for SuffixTransform<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn applies_to(&self, path: &str) -> bool {
        path.ends_with(&self.suffix)
    }

    fn transform(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>> {
        (self.rewrite)(data)
    }
}

/// Run `transform` over `data` if one is set and it claims `path`.
pub fn prepare<'a>(
    transform: Option<&dyn ContentTransform>,
    path: &str,
    data: &'a [u8],
) -> Result<Cow<'a, [u8]>> {
    match transform {
        Some(t) if t.applies_to(path) => Ok(Cow::Owned(t.transform(path, data)?)),
        _ => Ok(Cow::Borrowed(data)),
    }
}
