//! Service Promotion Engine: staged A/B rollout of a candidate against the
//! service currently holding its role.
//!
//! Each evaluation scores both services on the same tasks, derives parity
//! (candidate quality over baseline quality) and moves the rollout one step:
//!
//! ```text
//! Off ─▶ Canary (10%) ─▶ Half (50%) ─▶ Full (100%) ─▶ promoted
//!           │               │              │
//!           └───────────────┴──────────────┴──────▶ rollback (0%, retired)
//! ```
//!
//! A stage advances only after its observation window has elapsed with
//! enough evaluations and a rolling mean parity at or above the threshold.
//! Any single evaluation below the threshold rolls back at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use knowledgeforge_scenarios::{Expectation, TestSuite};
use knowledgeforge_shared::{
    Answer, AuditEvent, Decision, KnowledgeForgeError, PromotionDecision, Query, Result,
    RolloutPolicy, RolloutStage, ServiceId, ServiceStatus,
};
use knowledgeforge_storage::Storage;

use crate::audit::AuditLog;
use crate::service::KnowledgeService;

// ---------------------------------------------------------------------------
// Tasks and scoring
// ---------------------------------------------------------------------------

/// One held-out query with its reference answer.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalTask {
    pub id: String,
    pub query: Query,
    pub reference: Answer,
}

/// Evaluation tasks derived from a suite's scenarios.
pub fn tasks_from_suite(suite: &TestSuite) -> Vec<EvalTask> {
    suite
        .scenarios
        .iter()
        .map(|scenario| EvalTask {
            id: scenario.id.clone(),
            query: scenario.query.clone(),
            reference: match &scenario.expect {
                Expectation::Known {
                    objects,
                    provenance,
                } => Answer::Known {
                    objects: objects.iter().map(|k| k.as_str().to_string()).collect(),
                    provenance: provenance.iter().cloned().collect(),
                },
                Expectation::Unknown => Answer::Unknown,
            },
        })
        .collect()
}

/// Scores one answer against a task, in [0, 1].
pub trait QualityRubric: Send + Sync {
    fn id(&self) -> &str;

    fn score(&self, task: &EvalTask, answer: &Answer) -> f64;
}

/// Jaccard overlap of normalized objects with the reference. Declining to
/// answer scores 1 only when the reference declines too.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceMatch;

impl QualityRubric for ReferenceMatch {
    fn id(&self) -> &str {
        "reference-match"
    }

    fn score(&self, task: &EvalTask, answer: &Answer) -> f64 {
        match (&task.reference, answer) {
            (Answer::Unknown, Answer::Unknown) => 1.0,
            (Answer::Unknown, Answer::Known { .. }) | (Answer::Known { .. }, Answer::Unknown) => 0.0,
            (reference, answer) => {
                let expected = reference.object_keys();
                let actual = answer.object_keys();
                let union = expected.union(&actual).count();
                if union == 0 {
                    return 1.0;
                }
                expected.intersection(&actual).count() as f64 / union as f64
            }
        }
    }
}

/// Candidate quality relative to baseline, clamped to [0, 1].
///
/// A baseline that scores zero gives parity 1 to any candidate that scores
/// above zero, and 0 otherwise.
pub fn parity(candidate: f64, baseline: f64) -> f64 {
    if baseline <= 0.0 {
        return if candidate > 0.0 { 1.0 } else { 0.0 };
    }
    (candidate / baseline).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Traffic router
// ---------------------------------------------------------------------------

/// How one role's traffic is divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    /// Serves everything not routed to the canary.
    pub stable: Option<ServiceId>,
    pub canary: Option<ServiceId>,
    /// Buckets (out of 100) routed to the canary.
    pub percent: u8,
}

/// Sticky percentage routing: a request key always lands in the same bucket.
#[derive(Debug, Default)]
pub struct TrafficRouter {
    splits: RwLock<HashMap<String, Split>>,
}

impl TrafficRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket in `0..100` for a request key.
    pub fn bucket(key: &str) -> u8 {
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % 100) as u8
    }

    pub fn set_split(&self, role: &str, split: Split) {
        let mut splits = self.splits.write().unwrap_or_else(|p| p.into_inner());
        splits.insert(role.to_string(), split);
    }

    pub fn split(&self, role: &str) -> Option<Split> {
        self.splits
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(role)
            .copied()
    }

    /// The service that should answer `key` for `role`, if any is routed.
    pub fn route(&self, role: &str, key: &str) -> Option<ServiceId> {
        let split = self.split(role)?;
        match split.canary {
            Some(canary) if Self::bucket(key) < split.percent => Some(canary),
            Some(canary) => split.stable.or(Some(canary)),
            None => split.stable,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Rollout {
    stage: RolloutStage,
    stage_started: DateTime<Utc>,
    observations: Vec<f64>,
}

/// Where a candidate's rollout currently stands.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutStatus {
    pub stage: RolloutStage,
    pub stage_started: DateTime<Utc>,
    pub observations: usize,
    pub mean_parity: Option<f64>,
}

pub struct PromotionEngine {
    storage: Arc<Storage>,
    audit: AuditLog,
    rubric: Arc<dyn QualityRubric>,
    router: Arc<TrafficRouter>,
    policy: RolloutPolicy,
    rollouts: Mutex<HashMap<ServiceId, Rollout>>,
}

impl PromotionEngine {
    pub fn new(storage: Arc<Storage>, audit: AuditLog, policy: RolloutPolicy) -> Self {
        Self {
            storage,
            audit,
            rubric: Arc::new(ReferenceMatch),
            router: Arc::new(TrafficRouter::new()),
            policy,
            rollouts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rubric(mut self, rubric: Arc<dyn QualityRubric>) -> Self {
        self.rubric = rubric;
        self
    }

    pub fn with_router(mut self, router: Arc<TrafficRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn router(&self) -> &Arc<TrafficRouter> {
        &self.router
    }

    pub fn policy(&self) -> &RolloutPolicy {
        &self.policy
    }

    pub fn rollout_status(&self, candidate: ServiceId) -> Option<RolloutStatus> {
        let rollouts = self.rollouts.lock().unwrap_or_else(|p| p.into_inner());
        rollouts.get(&candidate).map(|r| RolloutStatus {
            stage: r.stage,
            stage_started: r.stage_started,
            observations: r.observations.len(),
            mean_parity: mean(&r.observations),
        })
    }

    /// Candidates with a rollout in progress.
    pub fn active_rollouts(&self) -> Vec<ServiceId> {
        let rollouts = self.rollouts.lock().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<ServiceId> = rollouts.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn evaluate(
        &self,
        candidate: &dyn KnowledgeService,
        baseline: &dyn KnowledgeService,
        tasks: &[EvalTask],
    ) -> Result<PromotionDecision> {
        self.evaluate_at(candidate, baseline, tasks, Utc::now()).await
    }

    /// Score both services on `tasks` and advance, hold or roll back the
    /// candidate's rollout as of `now`.
    #[instrument(skip_all, fields(candidate = %candidate.id(), baseline = %baseline.id(), tasks = tasks.len()))]
    pub async fn evaluate_at(
        &self,
        candidate: &dyn KnowledgeService,
        baseline: &dyn KnowledgeService,
        tasks: &[EvalTask],
        now: DateTime<Utc>,
    ) -> Result<PromotionDecision> {
        if tasks.is_empty() {
            return Err(KnowledgeForgeError::validation("promotion needs at least one task"));
        }
        let candidate_id = candidate.id();
        let baseline_id = baseline.id();
        let record = self
            .storage
            .get_service_record(candidate_id)
            .await?
            .ok_or_else(|| {
                KnowledgeForgeError::validation(format!("no service record for {candidate_id}"))
            })?;
        if record.status != ServiceStatus::Candidate {
            return Err(KnowledgeForgeError::validation(format!(
                "service {candidate_id} is {}, not a candidate",
                record.status.as_str()
            )));
        }

        let scores = join_all(tasks.iter().map(|task| async move {
            let (c, b) = futures::join!(candidate.answer(&task.query), baseline.answer(&task.query));
            (self.score(task, c), self.score(task, b))
        }))
        .await;
        let n = scores.len() as f64;
        let candidate_quality = scores.iter().map(|(c, _)| c).sum::<f64>() / n;
        let baseline_quality = scores.iter().map(|(_, b)| b).sum::<f64>() / n;
        let parity = parity(candidate_quality, baseline_quality);

        let (stage, decision, terminal) = self.step(candidate_id, parity, now);
        info!(
            rubric = self.rubric.id(),
            candidate_quality,
            baseline_quality,
            parity,
            stage = stage.as_str(),
            decision = decision.as_str(),
            terminal,
            "promotion evaluated"
        );

        let role = record.role_id.as_str();
        match (decision, terminal) {
            (Decision::Rollback, _) => {
                warn!(parity, threshold = self.policy.parity_threshold, "rolling back candidate");
                self.router.set_split(
                    role,
                    Split {
                        stable: Some(baseline_id),
                        canary: None,
                        percent: 0,
                    },
                );
                self.transition(candidate_id, ServiceStatus::Retired, "rolled back")
                    .await?;
            }
            (Decision::Promote, true) => {
                self.router.set_split(
                    role,
                    Split {
                        stable: Some(candidate_id),
                        canary: None,
                        percent: 0,
                    },
                );
                self.transition(candidate_id, ServiceStatus::Promoted, "rollout complete")
                    .await?;
                let previous = self.storage.get_service_record(baseline_id).await?;
                if previous.is_some_and(|r| r.status.can_transition_to(ServiceStatus::Retired)) {
                    self.transition(baseline_id, ServiceStatus::Retired, "superseded")
                        .await?;
                }
            }
            _ => self.router.set_split(
                role,
                Split {
                    stable: Some(baseline_id),
                    canary: Some(candidate_id),
                    percent: stage.percent(),
                },
            ),
        }

        let decision = PromotionDecision {
            id: Uuid::now_v7(),
            candidate_id,
            baseline_id,
            parity,
            stage,
            decision,
            terminal,
            tasks_evaluated: tasks.len(),
            evaluator_id: self.policy.evaluator_id.clone(),
            decided_at: now,
        };
        self.storage.insert_promotion_decision(&decision).await?;
        self.audit
            .record(AuditEvent::PromotionDecided(decision.clone()))
            .await?;
        Ok(decision)
    }

    /// End `candidate`'s rollout without a decision: its traffic returns to
    /// `baseline` and the candidate is retired.
    pub async fn withdraw(
        &self,
        candidate: ServiceId,
        baseline: ServiceId,
        reason: &str,
    ) -> Result<()> {
        let record = self
            .storage
            .get_service_record(candidate)
            .await?
            .ok_or_else(|| {
                KnowledgeForgeError::validation(format!("no service record for {candidate}"))
            })?;
        {
            let mut rollouts = self.rollouts.lock().unwrap_or_else(|p| p.into_inner());
            rollouts.remove(&candidate);
        }
        if self
            .router
            .split(&record.role_id)
            .is_some_and(|split| split.canary == Some(candidate))
        {
            self.router.set_split(
                &record.role_id,
                Split {
                    stable: Some(baseline),
                    canary: None,
                    percent: 0,
                },
            );
        }
        if record.status.can_transition_to(ServiceStatus::Retired) {
            self.transition(candidate, ServiceStatus::Retired, reason)
                .await?;
        }
        info!(%candidate, reason, "rollout withdrawn");
        Ok(())
    }

    fn score(&self, task: &EvalTask, answer: Result<Answer>) -> f64 {
        match answer {
            Ok(answer) => self.rubric.score(task, &answer),
            Err(e) => {
                warn!(task = %task.id, error = %e, "service failed a task");
                0.0
            }
        }
    }

    /// Apply one parity observation to the candidate's rollout state.
    fn step(&self, candidate: ServiceId, parity: f64, now: DateTime<Utc>) -> (RolloutStage, Decision, bool) {
        let threshold = self.policy.parity_threshold;
        let mut rollouts = self.rollouts.lock().unwrap_or_else(|p| p.into_inner());
        if parity < threshold {
            rollouts.remove(&candidate);
            return (RolloutStage::Off, Decision::Rollback, true);
        }

        let rollout = rollouts.entry(candidate).or_insert_with(|| Rollout {
            stage: RolloutStage::Off,
            stage_started: now,
            observations: Vec::new(),
        });

        if rollout.stage == RolloutStage::Off {
            rollout.stage = RolloutStage::Canary;
            rollout.stage_started = now;
            rollout.observations.clear();
            return (RolloutStage::Canary, Decision::Promote, false);
        }

        rollout.observations.push(parity);
        let window_elapsed = now - rollout.stage_started >= self.policy.observation_window;
        let enough = rollout.observations.len() >= self.policy.min_observations;
        let sustained = mean(&rollout.observations).is_some_and(|m| m >= threshold);
        if !(window_elapsed && enough && sustained) {
            return (rollout.stage, Decision::Hold, false);
        }

        match rollout.stage.next() {
            Some(next) => {
                rollout.stage = next;
                rollout.stage_started = now;
                rollout.observations.clear();
                (next, Decision::Promote, false)
            }
            None => {
                rollouts.remove(&candidate);
                (RolloutStage::Full, Decision::Promote, true)
            }
        }
    }

    async fn transition(&self, id: ServiceId, to: ServiceStatus, reason: &str) -> Result<()> {
        let from = self.storage.transition_service(id, to, reason).await?;
        self.audit
            .record(AuditEvent::ServiceStatusChanged {
                service_id: id,
                from,
                to,
            })
            .await?;
        Ok(())
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{service_record, temp_storage};
    use async_trait::async_trait;
    use chrono::Duration;

    /// Answers a fixed share of tasks correctly.
    struct Scripted {
        id: ServiceId,
        right: usize,
    }

    #[async_trait]
    impl KnowledgeService for Scripted {
        fn id(&self) -> ServiceId {
            self.id
        }

        async fn answer(&self, query: &Query) -> Result<Answer> {
            let n: usize = query.subject.trim_start_matches("q").parse().unwrap_or(usize::MAX);
            if n < self.right {
                Ok(Answer::Known {
                    objects: vec![format!("a{n}")],
                    provenance: vec![],
                })
            } else {
                Ok(Answer::Known {
                    objects: vec!["wrong".into()],
                    provenance: vec![],
                })
            }
        }
    }

    fn tasks(n: usize) -> Vec<EvalTask> {
        (0..n)
            .map(|i| EvalTask {
                id: format!("t{i}"),
                query: Query::recall(&format!("q{i}"), "answers"),
                reference: Answer::Known {
                    objects: vec![format!("a{i}")],
                    provenance: vec![],
                },
            })
            .collect()
    }

    fn policy() -> RolloutPolicy {
        RolloutPolicy {
            parity_threshold: 0.90,
            observation_window: Duration::hours(1),
            min_observations: 1,
            evaluator_id: "test".into(),
        }
    }

    async fn setup() -> (PromotionEngine, Arc<Storage>, Scripted, Scripted) {
        let storage = temp_storage().await;
        let baseline = service_record("eng", ServiceStatus::Promoted);
        let candidate = service_record("eng", ServiceStatus::Candidate);
        storage.insert_service_record(&baseline).await.unwrap();
        storage.insert_service_record(&candidate).await.unwrap();
        let engine = PromotionEngine::new(storage.clone(), AuditLog::new(storage.clone()), policy());
        (
            engine,
            storage,
            Scripted {
                id: candidate.id,
                right: 10,
            },
            Scripted {
                id: baseline.id,
                right: 10,
            },
        )
    }

    #[test]
    fn parity_is_clamped() {
        assert_eq!(parity(0.8, 1.0), 0.8);
        assert_eq!(parity(1.0, 0.5), 1.0);
        assert_eq!(parity(0.3, 0.0), 1.0);
        assert_eq!(parity(0.0, 0.0), 0.0);
    }

    #[test]
    fn reference_match_scores_overlap() {
        let task = &tasks(1)[0];
        let both = Answer::Known {
            objects: vec!["a0".into(), "extra".into()],
            provenance: vec![],
        };
        assert_eq!(ReferenceMatch.score(task, &both), 0.5);
        assert_eq!(ReferenceMatch.score(task, &Answer::Unknown), 0.0);

        let negative = EvalTask {
            reference: Answer::Unknown,
            ..task.clone()
        };
        assert_eq!(ReferenceMatch.score(&negative, &Answer::Unknown), 1.0);
        assert_eq!(ReferenceMatch.score(&negative, &both), 0.0);
    }

    #[test]
    fn routing_is_sticky_and_proportional() {
        let router = TrafficRouter::new();
        let stable = ServiceId::new();
        let canary = ServiceId::new();
        router.set_split(
            "eng",
            Split {
                stable: Some(stable),
                canary: Some(canary),
                percent: 50,
            },
        );

        let first = router.route("eng", "req-42");
        assert_eq!(first, router.route("eng", "req-42"));
        let to_canary = (0..1000)
            .filter(|i| router.route("eng", &format!("req-{i}")) == Some(canary))
            .count();
        assert!((400..600).contains(&to_canary), "{to_canary}");
        assert_eq!(router.route("finance", "req-1"), None);
    }

    #[tokio::test]
    async fn sustained_parity_promotes_through_every_stage() {
        let (engine, storage, candidate, baseline) = setup().await;
        let tasks = tasks(10);
        let t0 = Utc::now();
        let hour = Duration::hours(1);

        let steps = [
            (t0, RolloutStage::Canary, Decision::Promote),
            (t0 + Duration::minutes(5), RolloutStage::Canary, Decision::Hold),
            (t0 + hour, RolloutStage::Half, Decision::Promote),
            (t0 + hour * 2, RolloutStage::Full, Decision::Promote),
        ];
        for (at, stage, decision) in steps {
            let d = engine.evaluate_at(&candidate, &baseline, &tasks, at).await.unwrap();
            assert_eq!((d.stage, d.decision, d.terminal), (stage, decision, false));
        }
        assert_eq!(engine.router().split("eng").unwrap().percent, 100);

        let last = engine
            .evaluate_at(&candidate, &baseline, &tasks, t0 + hour * 3)
            .await
            .unwrap();
        assert!(last.terminal);
        assert_eq!(last.decision, Decision::Promote);
        assert_eq!(engine.router().route("eng", "any"), Some(candidate.id));

        let promoted = storage.get_service_record(candidate.id).await.unwrap().unwrap();
        assert_eq!(promoted.status, ServiceStatus::Promoted);
        let retired = storage.get_service_record(baseline.id).await.unwrap().unwrap();
        assert_eq!(retired.status, ServiceStatus::Retired);
        assert_eq!(storage.list_promotion_decisions(candidate.id).await.unwrap().len(), 5);

        // Finished rollouts do not evaluate again.
        assert!(engine.evaluate_at(&candidate, &baseline, &tasks, t0 + hour * 4).await.is_err());
    }

    #[tokio::test]
    async fn parity_drop_at_half_rolls_back() {
        let (engine, storage, mut candidate, baseline) = setup().await;
        let tasks = tasks(10);
        let t0 = Utc::now();

        engine.evaluate_at(&candidate, &baseline, &tasks, t0).await.unwrap();
        let half = engine
            .evaluate_at(&candidate, &baseline, &tasks, t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(half.stage, RolloutStage::Half);

        candidate.right = 8;
        let d = engine
            .evaluate_at(&candidate, &baseline, &tasks, t0 + Duration::minutes(70))
            .await
            .unwrap();
        assert!((d.parity - 0.8).abs() < 1e-9);
        assert_eq!(d.decision, Decision::Rollback);
        assert_eq!(d.stage, RolloutStage::Off);
        assert!(d.terminal);

        assert_eq!(engine.router().route("eng", "any"), Some(baseline.id));
        let rolled_back = storage.get_service_record(candidate.id).await.unwrap().unwrap();
        assert_eq!(rolled_back.status, ServiceStatus::Retired);
        let kept = storage.get_service_record(baseline.id).await.unwrap().unwrap();
        assert_eq!(kept.status, ServiceStatus::Promoted);
        assert!(engine.rollout_status(candidate.id).is_none());
    }

    #[tokio::test]
    async fn below_threshold_at_entry_never_ships() {
        let (engine, _storage, mut candidate, baseline) = setup().await;
        candidate.right = 5;
        let d = engine.evaluate(&candidate, &baseline, &tasks(10)).await.unwrap();
        assert_eq!(d.decision, Decision::Rollback);
        assert_eq!(d.tasks_evaluated, 10);
    }

    #[tokio::test]
    async fn empty_task_set_is_rejected() {
        let (engine, _storage, candidate, baseline) = setup().await;
        assert!(engine.evaluate(&candidate, &baseline, &[]).await.is_err());
    }
}
