//! Filtering, sorting and pagination for `find_by_query`.

use crate::session::aggregate::GenerationSession;
use crate::session::types::{SessionStatus, WorldGeneratorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFilter {
    pub statuses: Option<Vec<SessionStatus>>,
    pub world_generator_id: Option<WorldGeneratorId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_priority: Option<u8>,
    pub min_progress: Option<f64>,
}

impl SessionFilter {
    pub fn matches(&self, session: &GenerationSession) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&session.status()) {
                return false;
            }
        }
        if let Some(world) = &self.world_generator_id {
            if &session.world_generator_id != world {
                return false;
            }
        }
        if self.created_after.is_some_and(|after| session.created_at < after) {
            return false;
        }
        if self.created_before.is_some_and(|before| session.created_at >= before) {
            return false;
        }
        if self
            .min_priority
            .is_some_and(|priority| session.request.priority < priority)
        {
            return false;
        }
        if self
            .min_progress
            .is_some_and(|progress| session.progress.overall_progress < progress)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedAt,
    LastActivity,
    Priority,
    Progress,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            field: SortField::CreatedAt,
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionQuery {
    pub filter: SessionFilter,
    pub sort: SortOrder,
    pub pagination: Pagination,
}

impl SessionQuery {
    pub fn with_statuses(mut self, statuses: Vec<SessionStatus>) -> Self {
        self.filter.statuses = Some(statuses);
        self
    }

    pub fn with_world(mut self, world_generator_id: impl Into<WorldGeneratorId>) -> Self {
        self.filter.world_generator_id = Some(world_generator_id.into());
        self
    }

    pub fn sorted_by(mut self, field: SortField, direction: SortDirection) -> Self {
        self.sort = SortOrder { field, direction };
        self
    }

    pub fn paginate(mut self, offset: usize, limit: usize) -> Self {
        self.pagination = Pagination { offset, limit };
        self
    }

    /// Filter, sort and slice `sessions`
    pub fn apply<'a>(&self, sessions: impl Iterator<Item = &'a GenerationSession>) -> SessionPage {
        let mut matched: Vec<&GenerationSession> =
            sessions.filter(|session| self.filter.matches(session)).collect();

        matched.sort_by(|a, b| {
            let ordering = compare(a, b, self.sort.field).then_with(|| a.id.cmp(&b.id));
            match self.sort.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });

        let total_count = matched.len();
        let sessions: Vec<GenerationSession> = matched
            .into_iter()
            .skip(self.pagination.offset)
            .take(self.pagination.limit)
            .cloned()
            .collect();
        let has_more = self.pagination.offset + sessions.len() < total_count;

        SessionPage {
            sessions,
            total_count,
            offset: self.pagination.offset,
            limit: self.pagination.limit,
            has_more,
        }
    }
}

fn compare(a: &GenerationSession, b: &GenerationSession, field: SortField) -> Ordering {
    match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::LastActivity => a.last_activity.cmp(&b.last_activity),
        SortField::Priority => a.request.priority.cmp(&b.request.priority),
        SortField::Progress => a
            .progress
            .overall_progress
            .total_cmp(&b.progress.overall_progress),
        SortField::Status => a.status().cmp(&b.status()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPage {
    pub sessions: Vec<GenerationSession>,
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}
