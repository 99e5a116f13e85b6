//! JSON-over-HTTP reasoning client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use knowledgeforge_shared::config::ReasoningConfig;
use knowledgeforge_shared::{KnowledgeForgeError, Result, SchemaFragment};

use crate::{ReasoningClient, ReasoningRequest, ReasoningResponse};

/// User-Agent string for reasoning requests.
const USER_AGENT: &str = concat!("KnowledgeForge/", env!("CARGO_PKG_VERSION"));

/// Body posted to the endpoint.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    unit_id: &'a str,
    context: &'a str,
    schema: &'a SchemaFragment,
}

/// Posts each request as JSON to a single endpoint.
#[derive(Debug, Clone)]
pub struct HttpReasoningClient {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl HttpReasoningClient {
    pub fn new(endpoint: Url, model: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                KnowledgeForgeError::config(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            api_key,
        })
    }

    /// Build from the `[reasoning]` section. The key is optional; local
    /// endpoints usually do not require one.
    pub fn from_config(config: &ReasoningConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            KnowledgeForgeError::config(format!("invalid reasoning endpoint: {e}"))
        })?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::new(endpoint, config.model.clone(), api_key)
    }
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    #[instrument(skip_all, fields(unit = %request.unit_id))]
    async fn propose(&self, request: &ReasoningRequest) -> Result<ReasoningResponse> {
        let body = WireRequest {
            model: &self.model,
            unit_id: &request.unit_id,
            context: &request.context,
            schema: &request.schema,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            KnowledgeForgeError::reasoning_transient(format!("{}: {e}", self.endpoint))
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("{}: HTTP {status}", self.endpoint);
            return Err(if is_retryable(status) {
                KnowledgeForgeError::reasoning_transient(message)
            } else {
                KnowledgeForgeError::reasoning_fatal(message)
            });
        }

        let text = response.text().await.map_err(|e| {
            KnowledgeForgeError::reasoning_transient(format!(
                "{}: failed to read body: {e}",
                self.endpoint
            ))
        })?;

        let parsed: ReasoningResponse = serde_json::from_str(&text).map_err(|e| {
            KnowledgeForgeError::reasoning_fatal(format!(
                "undecodable response: {e} (got: {})",
                text.chars().take(200).collect::<String>()
            ))
        })?;

        debug!(
            entities = parsed.entities.len(),
            relations = parsed.relations.len(),
            "reasoning response decoded"
        );
        Ok(parsed)
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ReasoningRequest {
        ReasoningRequest {
            unit_id: "S1#s1.p1".into(),
            context: "Alice works on Apollo.".into(),
            schema: SchemaFragment {
                entity_types: vec!["Person".into(), "Project".into()],
                relations: vec![],
                focus_predicates: vec![],
            },
        }
    }

    fn client_for(server: &MockServer, key: Option<&str>) -> HttpReasoningClient {
        let endpoint = Url::parse(&format!("{}/v1/propose", server.uri())).unwrap();
        HttpReasoningClient::new(endpoint, "test-model", key.map(String::from)).unwrap()
    }

    #[tokio::test]
    async fn decodes_proposals() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/propose"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entities": [
                    {"name": "Alice", "type": "Person", "confidence": 0.95},
                    {"name": "Apollo", "type": "Project", "confidence": 0.9}
                ],
                "relations": [
                    {"subject": "Alice", "predicate": "worksOn", "object": "Apollo", "confidence": 0.9}
                ],
                "confidence": 0.9
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server, Some("secret"))
            .propose(&request())
            .await
            .unwrap();
        assert_eq!(response.entities.len(), 2);
        assert_eq!(response.relations[0].predicate, "worksOn");
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server, None).propose(&request()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_and_bad_bodies_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/propose"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let err = client_for(&server, None).propose(&request()).await.unwrap_err();
        assert!(!err.is_transient());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;
        let err = client_for(&server, None).propose(&request()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("undecodable"));
    }

    #[test]
    fn from_config_rejects_bad_endpoint() {
        let config = ReasoningConfig {
            endpoint: "::nope::".into(),
            ..ReasoningConfig::default()
        };
        assert!(HttpReasoningClient::from_config(&config).is_err());
    }
}
