pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub use self::types::{
    AutocompleteRequest, AutocompleteResult, GuessedFields, MultisearchResult, PackageData,
    QueryBody, RecordData, RequestBody, SlugInfo,
};
use self::types::{ActionResponse, EditSlugRequest, ResolveSlugRequest};
use crate::settings::PortalSettings;

const API_BASE_PATH: &str = "/api/3/action/";
const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

pub const MULTISEARCH: &str = "datastore_multisearch";
pub const VALUE_AUTOCOMPLETE: &str = "datastore_value_autocomplete";
pub const RESOLVE_SLUG: &str = "datastore_resolve_slug";
pub const CREATE_SLUG: &str = "datastore_create_slug";
pub const EDIT_SLUG: &str = "datastore_edit_slug";
pub const GUESS_FIELDS: &str = "datastore_guess_fields";
pub const PACKAGE_LIST: &str = "current_package_list_with_resources";
pub const RESOURCE_SHOW: &str = "resource_show";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response, including timeouts.
    #[error("request to {action} failed: {source}")]
    Transport {
        action: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{action} responded with HTTP {status}")]
    Status { action: String, status: u16 },
    #[error("could not decode the {action} response: {source}")]
    Decode {
        action: String,
        #[source]
        source: serde_json::Error,
    },
    /// The action answered `success: false`.
    #[error("{action} reported a failure: {message}")]
    Rejected {
        action: String,
        status: u16,
        message: String,
    },
}

impl ApiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Transport { source, .. } if source.is_timeout())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ApiError::Status { status: 404, .. } | ApiError::Rejected { status: 404, .. }
        )
    }
}

/// The remote actions this crate consumes.
#[async_trait]
pub trait Portal: Send + Sync {
    async fn multisearch(&self, body: &RequestBody) -> Result<MultisearchResult, ApiError>;

    async fn value_autocomplete(
        &self,
        request: &AutocompleteRequest,
    ) -> Result<AutocompleteResult, ApiError>;

    async fn resolve_slug(&self, slug: &str) -> Result<RequestBody, ApiError>;

    async fn create_slug(&self, body: &RequestBody) -> Result<SlugInfo, ApiError>;

    async fn edit_slug(&self, current_slug: &str, new_slug: &str) -> Result<(), ApiError>;

    async fn guess_fields(&self, body: &RequestBody) -> Result<Vec<GuessedFields>, ApiError>;

    async fn package_list(&self, limit: u32) -> Result<Vec<PackageData>, ApiError>;

    async fn resource_show(&self, id: &str) -> Result<Map<String, Value>, ApiError>;

    /// Fetch a IIIF image information document from an absolute URL.
    async fn image_info(&self, url: &str) -> Result<Value, ApiError>;
}

/// `Portal` over HTTP.
#[derive(Clone, Debug)]
pub struct PortalClient {
    client: Client,
    base_url: String,
}

impl PortalClient {
    pub fn new(settings: &PortalSettings) -> anyhow::Result<Self> {
        Self::with_timeout(&settings.base_url, settings.timeout())
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}{API_BASE_PATH}{action}", self.base_url)
    }

    async fn post<B, T>(&self, action: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let request = self.client.post(self.action_url(action)).json(body);
        send_action(action, request).await
    }

    async fn get<Q, T>(&self, action: &str, params: &Q) -> Result<T, ApiError>
    where
        Q: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.client.get(self.action_url(action)).query(params);
        send_action(action, request).await
    }
}

/// Send an action request and unwrap its envelope.
async fn send_action<T>(action: &str, request: RequestBuilder) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    let (status, bytes) = send(action, request).await?;
    let envelope: ActionResponse<T> = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(source) => {
            if !(200..300).contains(&status) {
                return Err(ApiError::Status {
                    action: action.to_string(),
                    status,
                });
            }
            return Err(ApiError::Decode {
                action: action.to_string(),
                source,
            });
        }
    };
    if !envelope.success {
        let message = envelope.error_message();
        warn!("{action} reported a failure: {message}");
        return Err(ApiError::Rejected {
            action: action.to_string(),
            status,
            message,
        });
    }
    envelope.result.ok_or_else(|| ApiError::Rejected {
        action: action.to_string(),
        status,
        message: "response carried no result".to_string(),
    })
}

async fn send(action: &str, request: RequestBuilder) -> Result<(u16, Vec<u8>), ApiError> {
    let transport = |source| ApiError::Transport {
        action: action.to_string(),
        source,
    };
    let response = request.send().await.map_err(transport)?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(transport)?;
    debug!("{action} answered HTTP {status} with {} bytes", bytes.len());
    Ok((status, bytes.to_vec()))
}

#[async_trait]
impl Portal for PortalClient {
    async fn multisearch(&self, body: &RequestBody) -> Result<MultisearchResult, ApiError> {
        self.post(MULTISEARCH, body).await
    }

    async fn value_autocomplete(
        &self,
        request: &AutocompleteRequest,
    ) -> Result<AutocompleteResult, ApiError> {
        self.post(VALUE_AUTOCOMPLETE, request).await
    }

    async fn resolve_slug(&self, slug: &str) -> Result<RequestBody, ApiError> {
        self.post(RESOLVE_SLUG, &ResolveSlugRequest { slug }).await
    }

    async fn create_slug(&self, body: &RequestBody) -> Result<SlugInfo, ApiError> {
        self.post(CREATE_SLUG, body).await
    }

    async fn edit_slug(&self, current_slug: &str, new_slug: &str) -> Result<(), ApiError> {
        let request = EditSlugRequest {
            current_slug,
            new_reserved_slug: new_slug,
        };
        let _: Value = self.post(EDIT_SLUG, &request).await?;
        Ok(())
    }

    async fn guess_fields(&self, body: &RequestBody) -> Result<Vec<GuessedFields>, ApiError> {
        self.post(GUESS_FIELDS, body).await
    }

    async fn package_list(&self, limit: u32) -> Result<Vec<PackageData>, ApiError> {
        self.get(PACKAGE_LIST, &[("limit", limit)]).await
    }

    async fn resource_show(&self, id: &str) -> Result<Map<String, Value>, ApiError> {
        self.get(RESOURCE_SHOW, &[("id", id)]).await
    }

    async fn image_info(&self, url: &str) -> Result<Value, ApiError> {
        let (status, bytes) = send(url, self.client.get(url)).await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::Status {
                action: url.to_string(),
                status,
            });
        }
        serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
            action: url.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    async fn client(server: &MockServer) -> PortalClient {
        PortalClient::with_timeout(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn multisearch_posts_body_and_keeps_big_ints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/3/action/datastore_multisearch"))
            .and(body_json(json!({"query": {"search": "Pieris"}, "resource_ids": ["R1"], "size": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"success": true, "result": {"total": 3, "after": [1, "x", "nhm-R1"],
                    "records": [{"resource": "R1", "data": {"_id": 9007199254740993}}]}}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let body = RequestBody {
            query: QueryBody {
                search: Some("Pieris".to_string()),
                filters: None,
            },
            resource_ids: vec!["R1".to_string()],
            ..Default::default()
        }
        .with_size(2);
        let result = client(&server).await.multisearch(&body).await.unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].key(), "R1_9007199254740993");
        assert_eq!(result.after, Some(json!([1, "x", "nhm-R1"])));
    }

    #[tokio::test]
    async fn unsuccessful_envelope_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/3/action/datastore_resolve_slug"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "success": false,
                "error": {"message": "Not found", "__type": "Not Found Error"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .resolve_slug("abc123")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, ApiError::Rejected { ref message, .. } if message == "Not found"));
    }

    #[tokio::test]
    async fn non_json_error_page_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/3/action/datastore_multisearch"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .multisearch(&RequestBody::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn package_list_sends_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/3/action/current_package_list_with_resources"))
            .and(query_param("limit", "10000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": [{"id": "p1", "title": "Specimens", "resources": [{"id": "R1"}]}]
            })))
            .mount(&server)
            .await;

        let packages = client(&server).await.package_list(10_000).await.unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].title.as_deref(), Some("Specimens"));
    }

    #[tokio::test]
    async fn slow_responses_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/3/action/resource_show"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "result": {}}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = PortalClient::with_timeout(&server.uri(), Duration::from_millis(50)).unwrap();
        let err = client.resource_show("R1").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn edit_slug_posts_both_names() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/3/action/datastore_edit_slug"))
            .and(body_json(json!({"current_slug": "abc", "new_reserved_slug": "pieris"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": true, "result": {}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .edit_slug("abc", "pieris")
            .await
            .unwrap();
    }
}
