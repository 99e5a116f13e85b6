//! Fleet runner: many domains at once, one orchestrator run per domain, with
//! successful candidates handed to the promotion engine.
//!
//! Runs are independent tokio tasks. A failed, cancelled or panicked run is
//! reported for its own domain and never stops the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use knowledgeforge_shared::{
    AuditEvent, Decision, KnowledgeForgeError, PromotionDecision, Result, ServiceId,
    ServiceStatus,
};
use knowledgeforge_storage::Storage;

use crate::audit::AuditLog;
use crate::orchestrator::{Orchestrator, RunOutcome, RunReport, RunRequest};
use crate::promotion::{EvalTask, PromotionEngine, Split, tasks_from_suite};
use crate::service::KnowledgeService;

/// What happened to a run's candidate after the run.
#[derive(Debug, Clone, PartialEq)]
pub enum Deployment {
    /// The role had no serving service; the candidate took it directly.
    Promoted(ServiceId),
    /// A staged rollout against the serving baseline has begun.
    Evaluated(PromotionDecision),
    /// The run produced no candidate.
    NotDeployed,
}

/// One domain's result from [`Fleet::run_all`].
#[derive(Debug)]
pub struct FleetRun {
    pub domain: String,
    pub result: Result<RunReport>,
    pub deployment: Deployment,
}

struct PendingRollout {
    role: String,
    candidate: Arc<dyn KnowledgeService>,
    tasks: Vec<EvalTask>,
}

pub struct Fleet {
    orchestrator: Arc<Orchestrator>,
    promotion: Arc<PromotionEngine>,
    storage: Arc<Storage>,
    audit: AuditLog,
    baselines: RwLock<HashMap<String, Arc<dyn KnowledgeService>>>,
    pending: Mutex<HashMap<ServiceId, PendingRollout>>,
}

impl Fleet {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        promotion: Arc<PromotionEngine>,
        storage: Arc<Storage>,
        audit: AuditLog,
    ) -> Self {
        Self {
            orchestrator,
            promotion,
            storage,
            audit,
            baselines: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Make `service` the serving baseline for `role`.
    pub fn register_baseline(&self, role: &str, service: Arc<dyn KnowledgeService>) {
        self.promotion.router().set_split(
            role,
            Split {
                stable: Some(service.id()),
                canary: None,
                percent: 0,
            },
        );
        let mut baselines = self.baselines.write().unwrap_or_else(|p| p.into_inner());
        baselines.insert(role.to_string(), service);
    }

    pub fn baseline(&self, role: &str) -> Option<Arc<dyn KnowledgeService>> {
        self.baselines
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(role)
            .cloned()
    }

    /// Candidates whose rollout has not finished.
    pub fn pending_rollouts(&self) -> Vec<ServiceId> {
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<ServiceId> = pending.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Run every request concurrently and deploy the successful candidates.
    /// Results come back in request order.
    #[instrument(skip_all, fields(runs = requests.len()))]
    pub async fn run_all(&self, requests: Vec<RunRequest>, cancel: CancellationToken) -> Vec<FleetRun> {
        let domains: Vec<String> = requests.iter().map(|r| r.domain().to_string()).collect();
        let mut set = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let orchestrator = self.orchestrator.clone();
            let token = cancel.child_token();
            set.spawn(async move { (index, orchestrator.run(request, token).await) });
        }

        let mut results: Vec<Option<Result<RunReport>>> = domains.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "orchestrator task aborted"),
            }
        }

        let mut runs = Vec::with_capacity(domains.len());
        for (domain, result) in domains.into_iter().zip(results) {
            let result = result.unwrap_or_else(|| {
                Err(KnowledgeForgeError::validation(format!(
                    "orchestrator task for {domain} aborted"
                )))
            });
            let deployment = match &result {
                Ok(report) => match self.deploy(report).await {
                    Ok(deployment) => deployment,
                    Err(e) => {
                        warn!(%domain, error = %e, "deploying candidate failed");
                        Deployment::NotDeployed
                    }
                },
                Err(e) => {
                    warn!(%domain, error = %e, "orchestrator run errored");
                    Deployment::NotDeployed
                }
            };
            runs.push(FleetRun {
                domain,
                result,
                deployment,
            });
        }

        info!(
            succeeded = runs.iter().filter(|r| matches!(&r.result, Ok(rep) if rep.succeeded())).count(),
            total = runs.len(),
            "fleet runs finished"
        );
        runs
    }

    async fn deploy(&self, report: &RunReport) -> Result<Deployment> {
        let RunOutcome::Succeeded {
            record,
            suite,
            service,
            ..
        } = &report.outcome
        else {
            return Ok(Deployment::NotDeployed);
        };

        let Some(baseline) = self.baseline(&record.role_id) else {
            let from = self
                .storage
                .transition_service(record.id, ServiceStatus::Promoted, "no serving baseline")
                .await?;
            self.audit
                .record(AuditEvent::ServiceStatusChanged {
                    service_id: record.id,
                    from,
                    to: ServiceStatus::Promoted,
                })
                .await?;
            self.register_baseline(&record.role_id, service.clone());
            info!(role = %record.role_id, service = %record.id, "promoted without a baseline");
            return Ok(Deployment::Promoted(record.id));
        };

        if let Some(previous) = self.take_pending_for_role(&record.role_id) {
            self.promotion
                .withdraw(previous, baseline.id(), "superseded")
                .await?;
            info!(role = %record.role_id, superseded = %previous, candidate = %record.id, "newer candidate replaces rollout");
        }

        let tasks = tasks_from_suite(suite);
        let decision = self
            .promotion
            .evaluate(service.as_ref(), baseline.as_ref(), &tasks)
            .await?;
        if !decision.terminal {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.insert(
                record.id,
                PendingRollout {
                    role: record.role_id.clone(),
                    candidate: service.clone(),
                    tasks,
                },
            );
        }
        Ok(Deployment::Evaluated(decision))
    }

    /// Evaluate every pending rollout as of `now`. Finished rollouts leave
    /// the pending set; a promoted candidate becomes its role's baseline. A
    /// rollout whose evaluation errors stays pending and is skipped.
    pub async fn evaluate_rollouts(&self, now: DateTime<Utc>) -> Result<Vec<PromotionDecision>> {
        let ids = self.pending_rollouts();
        let mut decisions = Vec::with_capacity(ids.len());
        for id in ids {
            let (role, candidate, tasks) = {
                let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                match pending.get(&id) {
                    Some(p) => (p.role.clone(), p.candidate.clone(), p.tasks.clone()),
                    None => continue,
                }
            };
            let Some(baseline) = self.baseline(&role) else {
                warn!(%role, candidate = %id, "baseline vanished, dropping rollout");
                self.remove_pending(id);
                continue;
            };

            let decision = match self
                .promotion
                .evaluate_at(candidate.as_ref(), baseline.as_ref(), &tasks, now)
                .await
            {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(%role, candidate = %id, error = %e, "rollout evaluation failed");
                    continue;
                }
            };
            if decision.terminal {
                self.remove_pending(id);
                if decision.decision == Decision::Promote {
                    let mut baselines = self.baselines.write().unwrap_or_else(|p| p.into_inner());
                    baselines.insert(role.clone(), candidate);
                }
            }
            decisions.push(decision);
        }
        Ok(decisions)
    }

    /// Remove and return the role's unfinished rollout, if any.
    fn take_pending_for_role(&self, role: &str) -> Option<ServiceId> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let id = pending
            .iter()
            .find(|(_, p)| p.role == role)
            .map(|(id, _)| *id)?;
        pending.remove(&id);
        Some(id)
    }

    fn remove_pending(&self, id: ServiceId) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.remove(&id);
    }
}
