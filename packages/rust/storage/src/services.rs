//! Knowledge service records, their status history, and promotion decisions.

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use serde::Serialize;
use tracing::{debug, instrument};

use knowledgeforge_shared::{
    Decision, KnowledgeForgeError, KnowledgeServiceRecord, PromotionDecision, Result,
    RevisionRange, RolloutStage, ServiceId, ServiceStatus,
};

use crate::{Storage, finish, parse_ts, storage_err, to_i64, to_u64};

const RECORD_COLUMNS: &str = "id, role_id, revision_from, revision_to, test_suite_id, pass_rate, \
     completeness, semantic_version, lineage_json, status, created_at";

const DECISION_COLUMNS: &str = "id, candidate_id, baseline_id, parity, stage, decision, terminal, \
     tasks_evaluated, evaluator_id, decided_at";

/// One entry of a service's status history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceTransition {
    pub service_id: ServiceId,
    pub from: ServiceStatus,
    pub to: ServiceStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Service records
    // -----------------------------------------------------------------------

    /// Persist a new record. Records are immutable apart from their status.
    #[instrument(skip_all, fields(service = %record.id, role = %record.role_id))]
    pub async fn insert_service_record(&self, record: &KnowledgeServiceRecord) -> Result<()> {
        let lineage_json = serde_json::to_string(&record.lineage)?;
        self.write(
            &format!(
                "INSERT INTO service_records ({RECORD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.id.to_string(),
                record.role_id.as_str(),
                to_i64(record.revisions.from),
                to_i64(record.revisions.to),
                record.test_suite_id.as_str(),
                record.pass_rate,
                record.completeness,
                record.semantic_version.as_str(),
                lineage_json,
                record.status.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_service_record(&self, id: ServiceId) -> Result<Option<KnowledgeServiceRecord>> {
        let mut rows = self
            .reader
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM service_records WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// All records for a role, oldest first.
    pub async fn list_service_records(&self, role_id: &str) -> Result<Vec<KnowledgeServiceRecord>> {
        let mut rows = self
            .reader
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM service_records
                     WHERE role_id = ?1 ORDER BY created_at, rowid"
                ),
                params![role_id],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    pub async fn count_service_records(&self, role_id: &str) -> Result<u64> {
        let mut rows = self
            .reader
            .query(
                "SELECT COUNT(*) FROM service_records WHERE role_id = ?1",
                params![role_id],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(to_u64(row.get::<i64>(0).map_err(storage_err)?)),
            None => Ok(0),
        }
    }

    /// The role's currently promoted service, if any.
    pub async fn promoted_service(&self, role_id: &str) -> Result<Option<KnowledgeServiceRecord>> {
        let mut rows = self
            .reader
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM service_records
                     WHERE role_id = ?1 AND status = 'promoted'
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![role_id],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Move a service to `to`, appending the change to its history.
    ///
    /// Returns the previous status. Transitions that
    /// [`ServiceStatus::can_transition_to`] forbids are rejected.
    #[instrument(skip_all, fields(service = %id, to = to.as_str()))]
    pub async fn transition_service(
        &self,
        id: ServiceId,
        to: ServiceStatus,
        reason: &str,
    ) -> Result<ServiceStatus> {
        let conn = self.begin().await?;
        let outcome = apply_transition(&conn, id, to, reason)
            .await
            .map(|from| (from, true));
        finish(&conn, outcome).await
    }

    /// Status history of one service, oldest first.
    pub async fn list_transitions(&self, id: ServiceId) -> Result<Vec<ServiceTransition>> {
        let mut rows = self
            .reader
            .query(
                "SELECT service_id, from_status, to_status, reason, at
                 FROM service_transitions WHERE service_id = ?1 ORDER BY id",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut transitions = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let service_id: String = row.get(0).map_err(storage_err)?;
            let from: String = row.get(1).map_err(storage_err)?;
            let to: String = row.get(2).map_err(storage_err)?;
            let at: String = row.get(4).map_err(storage_err)?;
            transitions.push(ServiceTransition {
                service_id: service_id.parse().map_err(storage_err)?,
                from: from.parse().map_err(storage_err)?,
                to: to.parse().map_err(storage_err)?,
                reason: row.get(3).map_err(storage_err)?,
                at: parse_ts(&at)?,
            });
        }
        Ok(transitions)
    }

    // -----------------------------------------------------------------------
    // Promotion decisions
    // -----------------------------------------------------------------------

    pub async fn insert_promotion_decision(&self, decision: &PromotionDecision) -> Result<()> {
        self.write(
            &format!(
                "INSERT INTO promotion_decisions ({DECISION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                decision.id.to_string(),
                decision.candidate_id.to_string(),
                decision.baseline_id.to_string(),
                decision.parity,
                decision.stage.as_str(),
                decision.decision.as_str(),
                i64::from(decision.terminal),
                to_i64(decision.tasks_evaluated as u64),
                decision.evaluator_id.as_str(),
                decision.decided_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Decisions taken about `candidate_id`, in order.
    pub async fn list_promotion_decisions(
        &self,
        candidate_id: ServiceId,
    ) -> Result<Vec<PromotionDecision>> {
        let mut rows = self
            .reader
            .query(
                &format!(
                    "SELECT {DECISION_COLUMNS} FROM promotion_decisions
                     WHERE candidate_id = ?1 ORDER BY decided_at, rowid"
                ),
                params![candidate_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut decisions = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            decisions.push(row_to_decision(&row)?);
        }
        Ok(decisions)
    }
}

async fn apply_transition(
    conn: &Connection,
    id: ServiceId,
    to: ServiceStatus,
    reason: &str,
) -> Result<ServiceStatus> {
    let mut rows = conn
        .query(
            "SELECT status FROM service_records WHERE id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(storage_err)?;
    let from: ServiceStatus = match rows.next().await.map_err(storage_err)? {
        Some(row) => row
            .get::<String>(0)
            .map_err(storage_err)?
            .parse()
            .map_err(storage_err)?,
        None => {
            return Err(KnowledgeForgeError::validation(format!(
                "no service record {id}"
            )));
        }
    };
    drop(rows);

    if !from.can_transition_to(to) {
        return Err(KnowledgeForgeError::validation(format!(
            "service {id} cannot move from {} to {}",
            from.as_str(),
            to.as_str()
        )));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE service_records SET status = ?2 WHERE id = ?1",
        params![id.to_string(), to.as_str()],
    )
    .await
    .map_err(storage_err)?;
    conn.execute(
        "INSERT INTO service_transitions (service_id, from_status, to_status, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.to_string(), from.as_str(), to.as_str(), reason, now],
    )
    .await
    .map_err(storage_err)?;
    debug!(from = from.as_str(), "service status changed");
    Ok(from)
}

fn row_to_record(row: &libsql::Row) -> Result<KnowledgeServiceRecord> {
    let id: String = row.get(0).map_err(storage_err)?;
    let lineage_json: String = row.get(8).map_err(storage_err)?;
    let status: String = row.get(9).map_err(storage_err)?;
    let created_at: String = row.get(10).map_err(storage_err)?;
    Ok(KnowledgeServiceRecord {
        id: id.parse().map_err(storage_err)?,
        role_id: row.get(1).map_err(storage_err)?,
        revisions: RevisionRange {
            from: to_u64(row.get::<i64>(2).map_err(storage_err)?),
            to: to_u64(row.get::<i64>(3).map_err(storage_err)?),
        },
        test_suite_id: row.get(4).map_err(storage_err)?,
        pass_rate: row.get(5).map_err(storage_err)?,
        completeness: row.get(6).map_err(storage_err)?,
        semantic_version: row.get(7).map_err(storage_err)?,
        lineage: serde_json::from_str(&lineage_json)?,
        status: status.parse().map_err(storage_err)?,
        created_at: parse_ts(&created_at)?,
    })
}

fn row_to_decision(row: &libsql::Row) -> Result<PromotionDecision> {
    let id: String = row.get(0).map_err(storage_err)?;
    let candidate: String = row.get(1).map_err(storage_err)?;
    let baseline: String = row.get(2).map_err(storage_err)?;
    let stage: String = row.get(4).map_err(storage_err)?;
    let decision: String = row.get(5).map_err(storage_err)?;
    let decided_at: String = row.get(9).map_err(storage_err)?;
    Ok(PromotionDecision {
        id: id.parse().map_err(storage_err)?,
        candidate_id: candidate.parse().map_err(storage_err)?,
        baseline_id: baseline.parse().map_err(storage_err)?,
        parity: row.get(3).map_err(storage_err)?,
        stage: parse_stage(&stage)?,
        decision: parse_decision(&decision)?,
        terminal: row.get::<i64>(6).map_err(storage_err)? != 0,
        tasks_evaluated: usize::try_from(row.get::<i64>(7).map_err(storage_err)?).unwrap_or(0),
        evaluator_id: row.get(8).map_err(storage_err)?,
        decided_at: parse_ts(&decided_at)?,
    })
}

fn parse_stage(s: &str) -> Result<RolloutStage> {
    match s {
        "off" => Ok(RolloutStage::Off),
        "canary" => Ok(RolloutStage::Canary),
        "half" => Ok(RolloutStage::Half),
        "full" => Ok(RolloutStage::Full),
        other => Err(KnowledgeForgeError::Storage(format!(
            "unknown rollout stage: {other}"
        ))),
    }
}

fn parse_decision(s: &str) -> Result<Decision> {
    match s {
        "promote" => Ok(Decision::Promote),
        "hold" => Ok(Decision::Hold),
        "rollback" => Ok(Decision::Rollback),
        other => Err(KnowledgeForgeError::Storage(format!(
            "unknown decision: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use knowledgeforge_shared::{SourceId, SourceLineage};
    use uuid::Uuid;

    fn record(role: &str, status: ServiceStatus) -> KnowledgeServiceRecord {
        KnowledgeServiceRecord {
            id: ServiceId::new(),
            role_id: role.into(),
            revisions: RevisionRange { from: 1, to: 4 },
            test_suite_id: "suite".into(),
            pass_rate: 0.96,
            completeness: 0.92,
            semantic_version: "1.0.0".into(),
            lineage: vec![SourceLineage {
                source_id: SourceId::from("S1"),
                content_hash: "abc".into(),
            }],
            status,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_round_trip_through_the_table() {
        let storage = test_storage().await;
        let rec = record("eng", ServiceStatus::Candidate);
        storage.insert_service_record(&rec).await.unwrap();

        let loaded = storage.get_service_record(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.revisions, rec.revisions);
        assert_eq!(loaded.lineage, rec.lineage);
        assert_eq!(loaded.status, ServiceStatus::Candidate);

        assert_eq!(storage.count_service_records("eng").await.unwrap(), 1);
        assert_eq!(storage.count_service_records("finance").await.unwrap(), 0);
        assert!(storage.promoted_service("eng").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_follow_the_lifecycle() {
        let storage = test_storage().await;
        let rec = record("eng", ServiceStatus::Candidate);
        storage.insert_service_record(&rec).await.unwrap();

        let from = storage
            .transition_service(rec.id, ServiceStatus::Promoted, "rollout complete")
            .await
            .unwrap();
        assert_eq!(from, ServiceStatus::Candidate);
        assert_eq!(
            storage.promoted_service("eng").await.unwrap().map(|r| r.id),
            Some(rec.id)
        );

        let back = storage
            .transition_service(rec.id, ServiceStatus::Candidate, "nope")
            .await;
        assert!(back.is_err());

        storage
            .transition_service(rec.id, ServiceStatus::Retired, "superseded")
            .await
            .unwrap();
        let history = storage.list_transitions(rec.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from, ServiceStatus::Promoted);
        assert_eq!(history[1].to, ServiceStatus::Retired);
        assert_eq!(history[1].reason, "superseded");
    }

    #[tokio::test]
    async fn unknown_service_cannot_transition() {
        let storage = test_storage().await;
        let err = storage
            .transition_service(ServiceId::new(), ServiceStatus::Retired, "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no service record"));
    }

    #[tokio::test]
    async fn decisions_are_listed_per_candidate() {
        let storage = test_storage().await;
        let candidate = ServiceId::new();
        let decision = PromotionDecision {
            id: Uuid::now_v7(),
            candidate_id: candidate,
            baseline_id: ServiceId::new(),
            parity: 0.8,
            stage: RolloutStage::Off,
            decision: Decision::Rollback,
            terminal: true,
            tasks_evaluated: 5,
            evaluator_id: "reference-match".into(),
            decided_at: Utc::now(),
        };
        storage.insert_promotion_decision(&decision).await.unwrap();

        let listed = storage.list_promotion_decisions(candidate).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].decision, Decision::Rollback);
        assert_eq!(listed[0].stage, RolloutStage::Off);
        assert!(listed[0].terminal);
        assert!(
            storage
                .list_promotion_decisions(ServiceId::new())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
