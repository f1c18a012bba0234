//! Source candidates: where a group's encoded audio comes from.

use bytes::Bytes;

/// One candidate source for a group's audio asset.
///
/// Candidates are tried in order during load; the first whose extension the
/// codec probe accepts wins. `data` holds the already-resolved encoded
/// payload, so no fetching happens inside the engine.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    /// Identifier of the asset, e.g. `"sfx/laser.mp3"`. Also the buffer
    /// cache key.
    pub key: String,
    /// Explicit container format hint. When absent the extension is derived
    /// from `key`.
    pub format: Option<String>,
    /// Encoded payload bytes.
    pub data: Bytes,
}

impl SourceSpec {
    pub fn new(key: impl Into<String>, data: Bytes) -> Self {
        Self {
            key: key.into(),
            format: None,
            data,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// The container extension used for codec negotiation: the explicit
    /// format hint if given, else derived from the key.
    pub fn extension(&self) -> Option<String> {
        if let Some(fmt) = &self.format {
            return Some(fmt.to_ascii_lowercase());
        }
        extension_of(&self.key)
    }
}

/// Extract a container extension from a source key, ignoring any trailing
/// query string.
pub fn extension_of(key: &str) -> Option<String> {
    let path = key.split('?').next().unwrap_or(key);
    let (_, ext) = path.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
