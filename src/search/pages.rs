//! Page-by-page navigation over a search. The `after` token of each page is
//! kept so any earlier page can be requested again, and the whole history
//! can be carried in a URL parameter: zlib-deflated JSON, base64 encoded.

use std::io::{self, Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

/// Prefix the server puts on the resource component of an `after` token.
const RESOURCE_PREFIX: &str = "nhm-";

/// Resource index written for a token whose resource is unknown.
const NO_RESOURCE: i64 = -1;

#[derive(Debug, thiserror::Error)]
pub enum PageParamError {
    #[error("page parameter is not base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("page parameter cannot be inflated: {0}")]
    Compression(#[from] io::Error),
    #[error("page parameter is not a page list: {0}")]
    Json(#[from] serde_json::Error),
}

/// An `after` token whose trailing resource component has been replaced by
/// an index into the query's sorted resource ids. The server's resource
/// order need not match ours, so the id travels as a position instead.
///
/// On the wire a marker is the token's parts followed by the index, `-1`
/// when there is none; tokens that are not lists are written as they are.
#[derive(Debug, Clone, PartialEq)]
pub struct PageMarker {
    pub token: Value,
    pub resource: Option<usize>,
}

impl PageMarker {
    pub fn from_after(after: &Value, sorted_ids: &[String]) -> Self {
        if let Value::Array(parts) = after {
            if let Some((Value::String(last), head)) = parts.split_last() {
                let id = last.strip_prefix(RESOURCE_PREFIX).unwrap_or(last);
                if let Some(ix) = sorted_ids.iter().position(|r| r == id) {
                    return Self {
                        token: Value::Array(head.to_vec()),
                        resource: Some(ix),
                    };
                }
            }
        }
        Self {
            token: after.clone(),
            resource: None,
        }
    }

    /// The token to send back, or `None` when the resource index no longer
    /// points into `sorted_ids`.
    pub fn to_after(&self, sorted_ids: &[String]) -> Option<Value> {
        let Some(ix) = self.resource else {
            return Some(self.token.clone());
        };
        let id = sorted_ids.get(ix)?;
        let mut parts = self.token.as_array().cloned().unwrap_or_default();
        parts.push(Value::String(format!("{RESOURCE_PREFIX}{id}")));
        Some(Value::Array(parts))
    }

    fn to_wire(&self) -> Value {
        let Value::Array(parts) = &self.token else {
            return self.token.clone();
        };
        let mut parts = parts.clone();
        parts.push(match self.resource {
            Some(ix) => Value::from(ix),
            None => Value::from(NO_RESOURCE),
        });
        Value::Array(parts)
    }

    fn from_wire(wire: Value) -> Self {
        if let Value::Array(parts) = &wire {
            if let Some((Value::Number(n), head)) = parts.split_last() {
                let resource = if n.as_i64() == Some(NO_RESOURCE) {
                    Some(None)
                } else {
                    n.as_u64()
                        .and_then(|ix| usize::try_from(ix).ok())
                        .map(Some)
                };
                if let Some(resource) = resource {
                    return Self {
                        token: Value::Array(head.to_vec()),
                        resource,
                    };
                }
            }
        }
        Self {
            token: wire,
            resource: None,
        }
    }
}

impl Serialize for PageMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PageMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_wire)
    }
}

fn deflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn inflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// `markers[n]` continues from the end of page `n`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageHistory {
    markers: Vec<PageMarker>,
    page: usize,
}

impl PageHistory {
    pub fn page(&self) -> usize {
        self.page
    }

    pub fn known_pages(&self) -> usize {
        self.markers.len() + 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.markers.len()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
        self.page = 0;
    }

    /// Move to `page`. Going past the last known page is refused.
    pub fn set_page(&mut self, page: usize) -> bool {
        if page > self.markers.len() {
            return false;
        }
        self.page = page;
        true
    }

    /// Remember the `after` returned for the current page.
    pub fn record(&mut self, after: &Value, sorted_ids: &[String]) {
        let marker = PageMarker::from_after(after, sorted_ids);
        if self.markers.get(self.page) == Some(&marker) {
            return;
        }
        self.markers.truncate(self.page);
        self.markers.push(marker);
    }

    /// The `after` to request the current page with.
    pub fn after(&self, sorted_ids: &[String]) -> Option<Value> {
        let previous = self.page.checked_sub(1)?;
        self.markers.get(previous)?.to_after(sorted_ids)
    }

    /// The markers up to the current page, for a URL parameter. Empty if
    /// they cannot be compressed.
    pub fn to_param(&self) -> String {
        let end = (self.page + 1).min(self.markers.len());
        let json = serde_json::to_vec(&self.markers[..end]).unwrap_or_default();
        match deflate(&json) {
            Ok(compressed) => STANDARD.encode(compressed),
            Err(e) => {
                warn!("cannot compress the page history: {e}");
                String::new()
            }
        }
    }

    /// Restore a history, positioned on its last page.
    pub fn from_param(param: &str) -> Result<Self, PageParamError> {
        let compressed = STANDARD.decode(param.trim())?;
        let markers: Vec<PageMarker> = serde_json::from_slice(&inflate(&compressed)?)?;
        if markers.len() <= 1 {
            return Ok(Self::default());
        }
        let page = markers.len() - 1;
        Ok(Self { markers, page })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sorted() -> Vec<String> {
        vec!["R1".to_string(), "R2".to_string(), "R3".to_string()]
    }

    #[test]
    fn resource_component_becomes_index() {
        let after = json!([1.5, "12345678901234567890", "nhm-R2"]);
        let marker = PageMarker::from_after(&after, &sorted());
        assert_eq!(
            marker,
            PageMarker {
                token: json!([1.5, "12345678901234567890"]),
                resource: Some(1)
            }
        );
        assert_eq!(marker.to_after(&sorted()), Some(after));
        assert_eq!(marker.to_after(&sorted()[..1]), None);
    }

    #[test]
    fn unknown_shapes_pass_through() {
        for after in [json!("opaque"), json!([1, 2, "nhm-R9"]), json!([1, 2, 3])] {
            let marker = PageMarker::from_after(&after, &sorted());
            assert_eq!(marker.resource, None);
            assert_eq!(marker.to_after(&sorted()), Some(after));
        }
    }

    #[test]
    fn history_threads_after_between_pages() {
        let mut history = PageHistory::default();
        assert_eq!(history.after(&sorted()), None);

        history.record(&json!([1, "a", "nhm-R1"]), &sorted());
        assert!(history.set_page(1));
        assert_eq!(history.after(&sorted()), Some(json!([1, "a", "nhm-R1"])));
        history.record(&json!([2, "b", "nhm-R3"]), &sorted());
        assert_eq!(history.known_pages(), 3);

        // Re-running page 0 with the same answer keeps later pages.
        history.set_page(0);
        history.record(&json!([1, "a", "nhm-R1"]), &sorted());
        assert_eq!(history.known_pages(), 3);

        // A different answer invalidates them.
        history.record(&json!([9, "z", "nhm-R2"]), &sorted());
        assert_eq!(history.known_pages(), 2);
        assert!(!history.set_page(2));
    }

    #[test]
    fn param_restores_last_page() {
        let mut history = PageHistory::default();
        history.record(&json!([1, "a", "nhm-R1"]), &sorted());
        history.set_page(1);
        history.record(&json!([2, "b", "nhm-R2"]), &sorted());

        let param = history.to_param();
        let json: Value =
            serde_json::from_slice(&inflate(&STANDARD.decode(&param).unwrap()).unwrap()).unwrap();
        assert_eq!(json, json!([[1, "a", 0], [2, "b", 1]]));
        let restored = PageHistory::from_param(&param).unwrap();
        assert_eq!(restored.page(), 1);
        assert_eq!(restored.after(&sorted()), Some(json!([1, "a", "nhm-R1"])));
        assert!(restored.has_next());
    }

    #[test]
    fn short_or_broken_params_start_over() {
        let mut history = PageHistory::default();
        history.record(&json!([1, "a", "nhm-R1"]), &sorted());
        let restored = PageHistory::from_param(&history.to_param()).unwrap();
        assert_eq!(restored, PageHistory::default());

        assert!(matches!(
            PageHistory::from_param("%%%"),
            Err(PageParamError::Encoding(_))
        ));
        assert!(matches!(
            PageHistory::from_param(&STANDARD.encode(b"[]")),
            Err(PageParamError::Compression(_))
        ));
        // deflated `{}`
        assert!(matches!(
            PageHistory::from_param("eJyrrgUAAXUA+Q=="),
            Err(PageParamError::Json(_))
        ));
    }

    #[test]
    fn reads_links_from_the_web_app() {
        // deflated `[[3,"x",0],[7,"y",2]]`
        let history = PageHistory::from_param("eJyLjjbWUapQ0jGI1Yk211GqVNIxio0FADoJBUo=").unwrap();
        assert_eq!(history.page(), 1);
        assert_eq!(history.after(&sorted()), Some(json!([3, "x", "nhm-R1"])));
        assert!(history.has_next());
    }

    #[test]
    fn markers_without_resource_keep_their_shape() {
        for after in [json!("opaque"), json!([1, 2, 3]), json!([1, 2, "nhm-R9"])] {
            let marker = PageMarker::from_after(&after, &sorted());
            let wire = serde_json::to_value(&marker).unwrap();
            let back: PageMarker = serde_json::from_value(wire).unwrap();
            assert_eq!(back, marker);
        }
        let lost: PageMarker = serde_json::from_value(json!([4, "q", -1])).unwrap();
        assert_eq!(lost.resource, None);
        assert_eq!(lost.token, json!([4, "q"]));
    }
}
