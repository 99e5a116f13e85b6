//! Client for the external reasoning service.
//!
//! The extractor sends one [`ReasoningRequest`] per anchored text unit and
//! receives typed entity and relation proposals back. The service is a black
//! box behind [`ReasoningClient`]; [`call_with_policy`] wraps every call in
//! a timeout and retries transient failures with exponential backoff.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use knowledgeforge_shared::{CallPolicy, KnowledgeForgeError, Result, SchemaFragment};

pub use http::HttpReasoningClient;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One inference request: a text unit plus the schema slice to extract against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    /// Anchor id of the unit, echoed back for correlation.
    pub unit_id: String,
    /// Unit text with its heading prepended when it has one.
    pub context: String,
    pub schema: SchemaFragment,
}

/// An entity the service believes the unit mentions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub confidence: f64,
}

/// A relation the service believes the unit asserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedRelation {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f64,
}

/// The service's proposals for one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResponse {
    #[serde(default)]
    pub entities: Vec<ProposedEntity>,
    #[serde(default)]
    pub relations: Vec<ProposedRelation>,
    /// Overall confidence of the response.
    #[serde(default)]
    pub confidence: f64,
}

impl ReasoningResponse {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Anything that can turn a text unit into typed proposals.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Propose entities and relations for one unit. Errors should be marked
    /// transient when a retry could help.
    async fn propose(&self, request: &ReasoningRequest) -> Result<ReasoningResponse>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "reasoning"
    }
}

/// A client backed by a synchronous function. Used for embedding a local
/// rule-based proposer and for tests.
pub struct FnReasoningClient<F> {
    name: String,
    f: F,
}

impl<F> FnReasoningClient<F>
where
    F: Fn(&ReasoningRequest) -> Result<ReasoningResponse> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ReasoningClient for FnReasoningClient<F>
where
    F: Fn(&ReasoningRequest) -> Result<ReasoningResponse> + Send + Sync,
{
    async fn propose(&self, request: &ReasoningRequest) -> Result<ReasoningResponse> {
        (self.f)(request)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Call policy
// ---------------------------------------------------------------------------

/// A successful call and how many attempts it took.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub response: ReasoningResponse,
    pub attempts: u32,
}

/// A call that failed after exhausting its attempts (or on a fatal error).
#[derive(Debug)]
pub struct CallFailure {
    pub error: KnowledgeForgeError,
    pub attempts: u32,
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

/// Call `client` under `policy`: each attempt is bounded by `policy.timeout`,
/// transient failures are retried up to `policy.max_attempts` with doubling
/// backoff, fatal failures return immediately.
pub async fn call_with_policy(
    client: &dyn ReasoningClient,
    request: &ReasoningRequest,
    policy: &CallPolicy,
) -> std::result::Result<Proposal, CallFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.timeout, client.propose(request)).await {
            Ok(result) => result,
            Err(_) => Err(KnowledgeForgeError::Timeout {
                operation: format!("{} propose {}", client.name(), request.unit_id),
                after_ms: u64::try_from(policy.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match outcome {
            Ok(response) => {
                debug!(unit = %request.unit_id, attempt, "reasoning call succeeded");
                return Ok(Proposal {
                    response,
                    attempts: attempt,
                });
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                warn!(
                    unit = %request.unit_id,
                    attempt,
                    error = %error,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient reasoning failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(error) => {
                return Err(CallFailure {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

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

    fn fast_policy(max_attempts: u32) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(200),
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let client = FnReasoningClient::new("flaky", |_req: &ReasoningRequest| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(KnowledgeForgeError::reasoning_transient("503"))
            } else {
                Ok(ReasoningResponse::default())
            }
        });
        let proposal = call_with_policy(&client, &request(), &fast_policy(3))
            .await
            .expect("third attempt succeeds");
        assert_eq!(proposal.attempts, 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let client = FnReasoningClient::new("broken", |_req: &ReasoningRequest| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(KnowledgeForgeError::reasoning_fatal("bad request"))
        });
        let failure = call_with_policy(&client, &request(), &fast_policy(3))
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct Slow;

    #[async_trait]
    impl ReasoningClient for Slow {
        async fn propose(&self, _request: &ReasoningRequest) -> Result<ReasoningResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ReasoningResponse::default())
        }
    }

    #[tokio::test]
    async fn timeouts_count_as_transient() {
        let policy = CallPolicy {
            timeout: Duration::from_millis(20),
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let failure = call_with_policy(&Slow, &request(), &policy).await.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert!(matches!(failure.error, KnowledgeForgeError::Timeout { .. }));
    }

    #[test]
    fn response_uses_type_key_on_the_wire() {
        let json = r#"{"entities":[{"name":"Alice","type":"Person","confidence":0.9}],"confidence":0.8}"#;
        let response: ReasoningResponse = serde_json::from_str(json).expect("parse");
        assert_eq!(response.entities[0].entity_type, "Person");
        assert!(response.relations.is_empty());
    }
}
