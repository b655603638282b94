use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::holder::JobHolder;
use crate::job::JobId;

/// Connectivity level, ordered from nothing to everything.
///
/// A job requiring `Metered` runs on `Metered` or `Unmetered`; a job
/// requiring `Unmetered` only runs on `Unmetered`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum NetworkStatus {
    Disconnected = 0,
    Metered = 1,
    Unmetered = 2,
}

impl NetworkStatus {
    pub fn satisfies(self, required: NetworkStatus) -> bool {
        self >= required
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TagMatch {
    /// At least one of the query tags is on the job.
    Any,
    /// Every query tag is on the job.
    All,
}

/// Tag predicate used by cancel requests and public queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagQuery {
    pub match_type: TagMatch,
    pub tags: HashSet<String>,
}

impl TagQuery {
    pub fn any(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            match_type: TagMatch::Any,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn all(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            match_type: TagMatch::All,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, job_tags: &HashSet<String>) -> bool {
        match self.match_type {
            TagMatch::Any => self.tags.iter().any(|t| job_tags.contains(t)),
            TagMatch::All => self.tags.iter().all(|t| job_tags.contains(t)),
        }
    }
}

/// Query describing which queued jobs qualify for an operation.
///
/// Every field narrows the result; the default constraint matches any job
/// that needs no network and no further waiting.
#[derive(Clone, Debug)]
pub struct Constraint {
    /// Jobs whose readiness time is at or before this instant qualify.
    /// `None` admits any readiness time.
    pub time_limit_ns: Option<u64>,
    /// Connectivity currently on offer.
    pub network: NetworkStatus,
    /// Groups whose jobs must be skipped, typically because a sibling is
    /// running or cooling down.
    pub exclude_groups: HashSet<String>,
    /// Specific jobs to skip, typically the ones already running.
    pub exclude_job_ids: HashSet<JobId>,
    pub tags: Option<TagQuery>,
}

impl Constraint {
    pub fn new(network: NetworkStatus) -> Self {
        Self {
            time_limit_ns: None,
            network,
            exclude_groups: HashSet::new(),
            exclude_job_ids: HashSet::new(),
            tags: None,
        }
    }

    pub fn ready_by(mut self, time_limit_ns: u64) -> Self {
        self.time_limit_ns = Some(time_limit_ns);
        self
    }

    pub fn excluding_groups(mut self, groups: impl IntoIterator<Item = String>) -> Self {
        self.exclude_groups.extend(groups);
        self
    }

    pub fn excluding_jobs(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.exclude_job_ids.extend(ids);
        self
    }

    pub fn with_tags(mut self, tags: TagQuery) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn matches(&self, holder: &JobHolder) -> bool {
        if let Some(limit) = self.time_limit_ns {
            if holder.delay_until_ns > limit {
                return false;
            }
        }
        if !self.network.satisfies(holder.required_network()) {
            return false;
        }
        if let Some(group) = &holder.job.group_id {
            if self.exclude_groups.contains(group) {
                return false;
            }
        }
        if self.exclude_job_ids.contains(&holder.job.id) {
            return false;
        }
        if let Some(tags) = &self.tags {
            if !tags.matches(&holder.job.tags) {
                return false;
            }
        }
        true
    }
}

impl Default for Constraint {
    fn default() -> Self {
        Self::new(NetworkStatus::Disconnected)
    }
}
