//! Wire types of the portal's action API.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The envelope every action responds with.
#[derive(Debug, Deserialize)]
pub struct ActionResponse<T> {
    pub success: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl<T> ActionResponse<T> {
    /// The server's explanation of a `success: false` response.
    pub(crate) fn error_message(&self) -> String {
        match &self.error {
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "no error detail".to_string(),
        }
    }
}

/// The `query` member of a multisearch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryBody {
    #[serde(
        default,
        deserialize_with = "deserialize_search",
        skip_serializing_if = "Option::is_none"
    )]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

/// A multisearch request body, also the shape stored behind a slug.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub query: QueryBody,
    #[serde(default)]
    pub resource_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

impl RequestBody {
    /// The same request without paging state, as persisted behind a slug.
    pub fn shareable(&self) -> Self {
        Self {
            after: None,
            size: None,
            ..self.clone()
        }
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }
}

/// Accept any JSON scalar as search text; numbers are stringified.
fn deserialize_search<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "search must be a scalar, got {other}"
            )))
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultisearchResult {
    #[serde(default)]
    pub records: Vec<RecordData>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub after: Option<Value>,
}

/// One search hit: the resource it came from and its opaque field data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    pub resource: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iiif: Option<Value>,
}

impl RecordData {
    /// `<resource>_<_id>`, the key records are addressed by.
    pub fn key(&self) -> String {
        match self.data.get("_id") {
            Some(Value::String(id)) => format!("{}_{id}", self.resource),
            Some(id) => format!("{}_{id}", self.resource),
            None => format!("{}_", self.resource),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutocompleteRequest {
    pub query: QueryBody,
    pub resource_ids: Vec<String>,
    pub field: String,
    pub prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutocompleteResult {
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub after: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResolveSlugRequest<'a> {
    pub(crate) slug: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EditSlugRequest<'a> {
    pub(crate) current_slug: &'a str,
    pub(crate) new_reserved_slug: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlugInfo {
    pub slug: String,
    #[serde(default)]
    pub is_reserved: bool,
}

/// One group of fields suggested by `datastore_guess_fields`.
#[derive(Debug, Clone, Deserialize)]
pub struct GuessedFields {
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageData {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub resources: Vec<Map<String, Value>>,
}
