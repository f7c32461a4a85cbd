//! Payload formats a gateway can speak, chosen per connection.

use std::sync::Arc;

use super::{JsonFormat, MsgPackFormat, PayloadFormat};
use crate::error::{CallwireError, Result};

const WILDCARD: &str = "*/*";

/// Formats keyed by content type. The first registered one is the default.
#[derive(Clone)]
pub struct PayloadFormats {
    formats: Vec<Arc<dyn PayloadFormat>>,
}

impl PayloadFormats {
    /// Registry holding only `default`.
    pub fn new(default: impl PayloadFormat) -> Self {
        Self {
            formats: vec![Arc::new(default)],
        }
    }

    /// Make `format` the default, keeping the others.
    pub fn set_default(&mut self, format: impl PayloadFormat) {
        let format: Arc<dyn PayloadFormat> = Arc::new(format);
        self.formats
            .retain(|existing| existing.content_type() != format.content_type());
        self.formats.insert(0, format);
    }

    /// Add `format`, replacing one registered under the same content type.
    pub fn register(&mut self, format: impl PayloadFormat) {
        let format: Arc<dyn PayloadFormat> = Arc::new(format);
        match self
            .formats
            .iter_mut()
            .find(|existing| existing.content_type() == format.content_type())
        {
            Some(existing) => *existing = format,
            None => self.formats.push(format),
        }
    }

    pub fn default_format(&self) -> Arc<dyn PayloadFormat> {
        self.formats[0].clone()
    }

    pub fn content_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.formats.iter().map(|format| format.content_type())
    }

    /// Pick the format for a connection.
    ///
    /// `content_type` may list several types with `q` weights, as in an
    /// HTTP `Accept` header. The best supported one wins and `*/*` picks the
    /// default. `None` also picks the default.
    pub fn resolve(&self, content_type: Option<&str>) -> Result<Arc<dyn PayloadFormat>> {
        let Some(requested) = content_type else {
            return Ok(self.default_format());
        };

        for kind in parse_content_types(requested) {
            if kind == WILDCARD {
                return Ok(self.default_format());
            }
            if let Some(format) = self
                .formats
                .iter()
                .find(|format| format.content_type().eq_ignore_ascii_case(&kind))
            {
                return Ok(format.clone());
            }
        }
        Err(CallwireError::UnsupportedFormat(requested.to_string()))
    }
}

impl Default for PayloadFormats {
    /// MessagePack by default, JSON on request.
    fn default() -> Self {
        let mut formats = Self::new(MsgPackFormat);
        formats.register(JsonFormat);
        formats
    }
}

impl std::fmt::Debug for PayloadFormats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.content_types()).finish()
    }
}

/// Split a content type list, drop parameters and order by `q`.
///
/// Wildcards sort last. Entries with `q=0` are refused.
fn parse_content_types(types: &str) -> Vec<String> {
    let mut parsed: Vec<(String, f32)> = types
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let kind = parts.next()?.trim();
            if kind.is_empty() {
                return None;
            }
            let q = parts
                .filter_map(|param| param.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (q > 0.0).then(|| (kind.to_ascii_lowercase(), q))
        })
        .collect();

    // Stable, so equal weights keep their listed order
    parsed.sort_by(|(a, qa), (b, qb)| {
        (a == WILDCARD)
            .cmp(&(b == WILDCARD))
            .then(qb.total_cmp(qa))
    });
    parsed.into_iter().map(|(kind, _)| kind).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_by_weight() {
        assert_eq!(
            parse_content_types("application/json;q=0.2, text/plain, */*;q=0.1"),
            vec!["text/plain", "application/json", "*/*"]
        );
        assert_eq!(parse_content_types("*/*"), vec!["*/*"]);
        assert_eq!(parse_content_types("*/*, application/json"), vec!["application/json", "*/*"]);
        assert!(parse_content_types("application/json;q=0").is_empty());
    }

    #[test]
    fn test_resolve() {
        let formats = PayloadFormats::default();
        assert_eq!(formats.resolve(None).unwrap().content_type(), "application/msgpack");
        assert_eq!(
            formats.resolve(Some("application/json")).unwrap().content_type(),
            "application/json"
        );
        assert_eq!(
            formats
                .resolve(Some("text/plain, Application/JSON; charset=utf-8"))
                .unwrap()
                .content_type(),
            "application/json"
        );
        assert_eq!(
            formats.resolve(Some("text/plain, */*")).unwrap().content_type(),
            "application/msgpack"
        );
    }

    #[test]
    fn test_resolve_unsupported() {
        let formats = PayloadFormats::new(JsonFormat);
        assert!(matches!(
            formats.resolve(Some("application/msgpack")),
            Err(CallwireError::UnsupportedFormat(t)) if t == "application/msgpack"
        ));
        assert!(formats.resolve(Some("")).is_err());
    }

    #[test]
    fn test_set_default_and_register() {
        let mut formats = PayloadFormats::default();
        formats.set_default(JsonFormat);
        assert_eq!(
            formats.content_types().collect::<Vec<_>>(),
            vec!["application/json", "application/msgpack"]
        );

        formats.register(MsgPackFormat);
        assert_eq!(formats.content_types().count(), 2);
    }
}
