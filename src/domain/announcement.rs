use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use super::bid::{AgentId, Bid};
use super::task::Task;
use crate::error::{ContractNetError, Result};

/// Priority assumed when an announcement does not set one
pub const DEFAULT_PRIORITY: u8 = 5;

/// Optional eligibility filters attached to an announcement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub skills: BTreeSet<String>,
    pub max_distance: Option<f64>,
    pub min_proficiency: Option<f64>,
    pub priority: Option<u8>,
}

impl Requirements {
    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skills.insert(skill.into());
        self
    }

    pub fn with_max_distance(mut self, distance: f64) -> Self {
        self.max_distance = Some(distance);
        self
    }

    pub fn with_min_proficiency(mut self, proficiency: f64) -> Self {
        self.min_proficiency = Some(proficiency);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Construction parameters for an [`Announcement`]
#[derive(Debug, Clone)]
pub struct AnnouncementParams {
    pub task: Task,
    pub requester_id: AgentId,
    /// Bidding window measured from creation
    pub deadline_in: Duration,
    pub requirements: Requirements,
}

/// Work put out for bid. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    id: String,
    task: Task,
    requester_id: AgentId,
    created_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    requirements: Requirements,
}

impl Announcement {
    pub fn new(params: AnnouncementParams) -> Result<Self> {
        Self::new_at(params, Utc::now())
    }

    /// Build an announcement as if created at `now`
    pub fn new_at(params: AnnouncementParams, now: DateTime<Utc>) -> Result<Self> {
        if params.task.action.trim().is_empty() {
            return Err(ContractNetError::invalid("task action cannot be blank"));
        }
        if params.requester_id.is_nil() {
            return Err(ContractNetError::invalid("requester id cannot be nil"));
        }
        if params.deadline_in.is_zero() {
            return Err(ContractNetError::invalid("deadline must be in the future"));
        }
        let window = chrono::Duration::from_std(params.deadline_in)
            .map_err(|e| ContractNetError::invalid(format!("deadline out of range: {e}")))?;

        let r = &params.requirements;
        if let Some(d) = r.max_distance {
            if d.is_nan() || d < 0.0 {
                return Err(ContractNetError::invalid(format!(
                    "max distance cannot be negative, got {d}"
                )));
            }
        }
        if let Some(p) = r.min_proficiency {
            if !(0.0..=1.0).contains(&p) {
                return Err(ContractNetError::invalid(format!(
                    "min proficiency must be between 0 and 1, got {p}"
                )));
            }
        }

        Ok(Self {
            id: generate_id(),
            task: params.task,
            requester_id: params.requester_id,
            created_at: now,
            deadline: now + window,
            requirements: params.requirements,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn requester_id(&self) -> AgentId {
        self.requester_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Time left until the deadline, zero once expired
    pub fn remaining_time(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn requires_skill(&self, skill: &str) -> bool {
        self.requirements.skills.contains(skill)
    }

    /// Unbounded when not set
    pub fn max_distance(&self) -> f64 {
        self.requirements.max_distance.unwrap_or(f64::MAX)
    }

    pub fn min_proficiency(&self) -> f64 {
        self.requirements.min_proficiency.unwrap_or(0.0)
    }

    pub fn priority(&self) -> u8 {
        self.requirements.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Whether a bid's reported distance is inside the announcement's range.
    /// Bids without a distance are only in reach of unbounded announcements.
    pub fn is_within_reach(&self, bid: &Bid) -> bool {
        match (bid.distance(), self.requirements.max_distance) {
            (_, None) => true,
            (Some(d), Some(max)) => d <= max,
            (None, Some(_)) => false,
        }
    }
}

impl std::fmt::Display for Announcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Announcement[{}: {} from {}, deadline {}]",
            self.id,
            self.task.action,
            self.requester_id,
            self.deadline.format("%H:%M:%S%.3f")
        )
    }
}

fn generate_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("announce_{}", &uuid[..8])
}
