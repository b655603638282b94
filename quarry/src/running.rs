use std::collections::{HashMap, HashSet};

use crate::job::JobId;

/// Tracks which jobs are running and which groups are busy.
///
/// A group stays excluded from dispatch while one of its jobs runs, and
/// optionally for a cool-down window after a failed attempt so retries in
/// the same group do not hammer a struggling resource.
#[derive(Debug, Default)]
pub struct RunningJobSet {
    running_ids: HashSet<JobId>,
    /// Groups with an active job. Value is the count of running jobs,
    /// which stays at one unless callers bypass group exclusion.
    active_groups: HashMap<String, usize>,
    /// Groups parked until the given engine time.
    cooling_groups: HashMap<String, u64>,
}

impl RunningJobSet {
    pub fn add(&mut self, id: JobId, group: Option<&str>) {
        self.running_ids.insert(id);
        if let Some(group) = group {
            *self.active_groups.entry(group.to_string()).or_insert(0) += 1;
        }
    }

    pub fn remove(&mut self, id: JobId, group: Option<&str>) {
        self.running_ids.remove(&id);
        if let Some(group) = group {
            if let Some(count) = self.active_groups.get_mut(group) {
                *count -= 1;
                if *count == 0 {
                    self.active_groups.remove(group);
                }
            }
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.running_ids.contains(&id)
    }

    pub fn running_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.running_ids.iter().copied()
    }

    pub fn running_count(&self) -> usize {
        self.running_ids.len()
    }

    /// Park `group` until `until_ns`. An existing later deadline wins; a
    /// cool-down never shortens.
    pub fn cool_down_group(&mut self, group: &str, until_ns: u64) {
        let entry = self.cooling_groups.entry(group.to_string()).or_insert(0);
        *entry = (*entry).max(until_ns);
    }

    /// Groups to exclude from dispatch at `now_ns`. Expired cool-downs are
    /// dropped on the way.
    pub fn blocked_groups(&mut self, now_ns: u64) -> HashSet<String> {
        self.cooling_groups.retain(|_, until| *until > now_ns);
        self.active_groups
            .keys()
            .chain(self.cooling_groups.keys())
            .cloned()
            .collect()
    }

    /// Earliest time a cooling group unblocks, if any are parked.
    pub fn next_cool_down_expiry_ns(&self) -> Option<u64> {
        self.cooling_groups.values().copied().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_group_blocks_until_removed() {
        let mut set = RunningJobSet::default();
        let id = JobId::new();
        set.add(id, Some("sync"));
        assert!(set.contains(id));
        assert!(set.blocked_groups(0).contains("sync"));

        set.remove(id, Some("sync"));
        assert!(!set.contains(id));
        assert!(set.blocked_groups(0).is_empty());
    }

    #[test]
    fn test_cool_down_expires() {
        let mut set = RunningJobSet::default();
        set.cool_down_group("sync", 5_000);
        assert!(set.blocked_groups(4_999).contains("sync"));
        assert!(set.blocked_groups(5_000).is_empty());
    }

    #[test]
    fn test_cool_down_never_shortens() {
        let mut set = RunningJobSet::default();
        set.cool_down_group("sync", 9_000);
        set.cool_down_group("sync", 2_000);
        assert!(set.blocked_groups(8_000).contains("sync"));
        assert_eq!(set.next_cool_down_expiry_ns(), Some(9_000));
    }

    #[test]
    fn test_ungrouped_jobs_do_not_block_groups() {
        let mut set = RunningJobSet::default();
        set.add(JobId::new(), None);
        assert_eq!(set.running_count(), 1);
        assert!(set.blocked_groups(0).is_empty());
    }
}
