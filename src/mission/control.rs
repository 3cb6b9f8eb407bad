//! Human gating: applying control-action patches to a mission.
//!
//! The CRUD layer stays a thin shim; it parses the request body into a
//! [`ControlPatch`] and calls [`apply_control`]. Validation against the
//! current status happens here, and every accepted patch re-projects the
//! mission onto its job. The controller observes the new status on its next
//! poll.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    job_status_for_mission, ControlAction, ControlPatch, JobStatus, LogKind, Mission, MissionLog,
    MissionStatus, PlanAction, ReviewAction,
};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Mission {0} not found")]
    NotFound(Uuid),

    #[error("Action is not valid while the mission is {status}")]
    InvalidState { status: MissionStatus },

    #[error("controlAction=input requires a non-empty message")]
    MissingMessage,

    #[error("Store error: {0}")]
    Store(String),
}

impl From<String> for ControlError {
    fn from(message: String) -> Self {
        Self::Store(message)
    }
}

/// Apply one human control action. Returns the patched mission.
pub async fn apply_control(
    store: &dyn Store,
    mission_id: Uuid,
    patch: ControlPatch,
) -> Result<Mission, ControlError> {
    let mut mission = store
        .get_mission(mission_id)
        .await?
        .ok_or(ControlError::NotFound(mission_id))?;

    match patch {
        ControlPatch::Plan(action) => {
            if mission.status != MissionStatus::WaitingPlanApproval {
                return Err(ControlError::InvalidState { status: mission.status });
            }
            match action {
                PlanAction::Approve => mission.status = MissionStatus::Executing,
                PlanAction::Reject => {
                    mission.status = MissionStatus::Failed;
                    mission.fail_reason = Some("Plan rejected by user".to_string());
                    mission.mark_finished();
                }
            }
        }
        ControlPatch::Review(action) => {
            if mission.status != MissionStatus::WaitingReview {
                return Err(ControlError::InvalidState { status: mission.status });
            }
            match action {
                ReviewAction::Approve => {
                    mission.status = MissionStatus::Completed;
                    if mission.result_summary.is_none() {
                        mission.result_summary = Some("Changes approved by user".to_string());
                    }
                    mission.mark_finished();
                }
                ReviewAction::Reject => {
                    mission.status = MissionStatus::Failed;
                    mission.fail_reason = Some("Changes rejected by user".to_string());
                    mission.mark_finished();
                }
            }
        }
        ControlPatch::Control { action, message } => match action {
            ControlAction::Pause => {
                if mission.status != MissionStatus::Executing {
                    return Err(ControlError::InvalidState { status: mission.status });
                }
                mission.status = MissionStatus::Paused;
            }
            ControlAction::Resume => {
                if !matches!(
                    mission.status,
                    MissionStatus::Paused | MissionStatus::WaitingInput
                ) {
                    return Err(ControlError::InvalidState { status: mission.status });
                }
                mission.status = MissionStatus::Executing;
            }
            ControlAction::Input => {
                let message = message
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .ok_or(ControlError::MissingMessage)?;
                mission.latest_user_input = Some(message);
                // Unconditional transition, even from review states.
                mission.status = MissionStatus::Planning;
            }
        },
    }

    store.update_mission(&mission).await?;
    sync_job_for_mission(store, &mission).await?;
    Ok(mission)
}

/// Mirror a mission's status onto its job per the projection table. Terminal
/// job states also pick up `finished_at`/`last_error`.
pub async fn sync_job_for_mission(store: &dyn Store, mission: &Mission) -> Result<(), String> {
    let Some(projected) = job_status_for_mission(mission.status) else {
        return Ok(());
    };
    let Some(mut job) = store.find_job_for_mission(mission.id).await? else {
        return Ok(());
    };
    if job.status == projected {
        return Ok(());
    }
    job.status = projected;
    match projected {
        JobStatus::Completed => {
            job.finished_at = Some(Utc::now());
            job.last_error = None;
        }
        JobStatus::Failed => {
            job.finished_at = Some(Utc::now());
            job.last_error = mission.fail_reason.clone();
        }
        _ => {}
    }
    store.update_job(&job).await
}

/// Record a consumed out-of-band user input in the mission log.
pub async fn log_user_input(
    store: &dyn Store,
    mission_id: Uuid,
    input: &str,
) -> Result<(), String> {
    store
        .append_log(&MissionLog::new(
            mission_id,
            None,
            LogKind::Thought,
            format!("User input: {input}"),
        ))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, JobPayload};
    use crate::store::InMemoryStore;

    async fn seeded(status: MissionStatus) -> (InMemoryStore, Mission, Job) {
        let store = InMemoryStore::new();
        let mut mission = Mission::new(Uuid::new_v4(), "goal", None);
        mission.status = status;
        store.create_mission(&mission).await.expect("create mission");

        let mut job = Job::new(mission.project_id, JobPayload::default());
        job.mission_id = Some(mission.id);
        job.status = JobStatus::Running;
        store.create_job(&job).await.expect("create job");

        (store, mission, job)
    }

    #[tokio::test]
    async fn plan_approval_moves_to_executing() {
        let (store, mission, _job) = seeded(MissionStatus::WaitingPlanApproval).await;
        let patched = apply_control(&store, mission.id, ControlPatch::Plan(PlanAction::Approve))
            .await
            .expect("approve");
        assert_eq!(patched.status, MissionStatus::Executing);
    }

    #[tokio::test]
    async fn plan_rejection_fails_the_mission_and_job() {
        let (store, mission, job) = seeded(MissionStatus::WaitingPlanApproval).await;
        let patched = apply_control(&store, mission.id, ControlPatch::Plan(PlanAction::Reject))
            .await
            .expect("reject");
        assert_eq!(patched.status, MissionStatus::Failed);
        assert!(patched.fail_reason.is_some());

        let job = store.get_job(job.id).await.expect("get job").expect("job exists");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.finished_at.is_some());
        assert_eq!(job.last_error, patched.fail_reason);
    }

    #[tokio::test]
    async fn plan_actions_require_waiting_plan_approval() {
        let (store, mission, _job) = seeded(MissionStatus::Executing).await;
        let err = apply_control(&store, mission.id, ControlPatch::Plan(PlanAction::Approve))
            .await
            .expect_err("invalid state");
        assert!(matches!(err, ControlError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn review_approval_completes_with_summary() {
        let (store, mission, job) = seeded(MissionStatus::WaitingReview).await;
        let patched =
            apply_control(&store, mission.id, ControlPatch::Review(ReviewAction::Approve))
                .await
                .expect("approve review");
        assert_eq!(patched.status, MissionStatus::Completed);
        assert!(patched.result_summary.is_some());

        let job = store.get_job(job.id).await.expect("get job").expect("job exists");
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let (store, mission, job) = seeded(MissionStatus::Executing).await;
        let paused = apply_control(
            &store,
            mission.id,
            ControlPatch::Control { action: ControlAction::Pause, message: None },
        )
        .await
        .expect("pause");
        assert_eq!(paused.status, MissionStatus::Paused);
        let job_row = store.get_job(job.id).await.expect("get job").expect("job exists");
        assert_eq!(job_row.status, JobStatus::WaitingReview);

        let resumed = apply_control(
            &store,
            mission.id,
            ControlPatch::Control { action: ControlAction::Resume, message: None },
        )
        .await
        .expect("resume");
        assert_eq!(resumed.status, MissionStatus::Executing);
    }

    #[tokio::test]
    async fn input_requires_message_and_moves_to_planning() {
        let (store, mission, _job) = seeded(MissionStatus::WaitingPlanApproval).await;

        let err = apply_control(
            &store,
            mission.id,
            ControlPatch::Control { action: ControlAction::Input, message: Some("  ".to_string()) },
        )
        .await
        .expect_err("blank message rejected");
        assert!(matches!(err, ControlError::MissingMessage));

        let patched = apply_control(
            &store,
            mission.id,
            ControlPatch::Control {
                action: ControlAction::Input,
                message: Some("use TypeScript".to_string()),
            },
        )
        .await
        .expect("input accepted");
        assert_eq!(patched.status, MissionStatus::Planning);
        assert_eq!(patched.latest_user_input.as_deref(), Some("use TypeScript"));
    }

    #[tokio::test]
    async fn input_transitions_unconditionally_even_from_review() {
        let (store, mission, _job) = seeded(MissionStatus::WaitingReview).await;
        let patched = apply_control(
            &store,
            mission.id,
            ControlPatch::Control {
                action: ControlAction::Input,
                message: Some("one more change".to_string()),
            },
        )
        .await
        .expect("input accepted");
        assert_eq!(patched.status, MissionStatus::Planning);
    }
}
