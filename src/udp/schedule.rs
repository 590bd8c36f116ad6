use std::collections::BTreeMap;
use rustc_hash::FxHashSet;
use crate::channel_id::ChannelId;
use crate::util::clock::time_diff;

/// Keeps track of when channels need their next protocol update, so a service's update loop
///  touches only channels that are due instead of polling all of them.
///
/// Entries are not removed when a channel goes away; the service looks ids up when they are due
///  and skips ids that no longer resolve to a channel.
pub struct UpdateSchedule {
    /// keyed by due time on a 64 bit time line that does not wrap
    timers: BTreeMap<u64, Vec<ChannelId>>,
    immediate: FxHashSet<ChannelId>,
    now: u32,
    now_extended: u64,
}

impl UpdateSchedule {
    pub fn new(now: u32) -> UpdateSchedule {
        UpdateSchedule {
            timers: BTreeMap::new(),
            immediate: FxHashSet::default(),
            now,
            now_extended: 0,
        }
    }

    /// Move the time base forward, so relative due times of later [UpdateSchedule::schedule_at]
    ///  calls are measured from `now`
    pub fn advance(&mut self, now: u32) {
        let delta = time_diff(now, self.now);
        if delta > 0 {
            self.now_extended += delta as u64;
        }
        self.now = now;
    }

    /// Schedule an update at `due`, or on the next processing of due channels if `due` is not in
    ///  the future
    pub fn schedule_at(&mut self, due: u32, id: ChannelId) {
        let delta = time_diff(due, self.now);
        if delta <= 0 {
            self.immediate.insert(id);
        }
        else {
            self.timers.entry(self.now_extended + delta as u64)
                .or_default()
                .push(id);
        }
    }

    pub fn schedule_now(&mut self, id: ChannelId) {
        self.immediate.insert(id);
    }

    /// Move all timers that are due at `now` to the set of channels to update
    pub fn collect_due(&mut self, now: u32) {
        self.advance(now);

        let later = self.timers.split_off(&(self.now_extended + 1));
        let due = std::mem::replace(&mut self.timers, later);
        for ids in due.into_values() {
            self.immediate.extend(ids);
        }
    }

    /// Moves the channels to update into `into`, in ascending id order
    pub fn take_immediate(&mut self, into: &mut Vec<ChannelId>) {
        into.extend(self.immediate.drain());
        into.sort();
    }

    pub fn num_timers(&self) -> usize {
        self.timers.values().map(|ids| ids.len()).sum()
    }

    pub fn is_due(&self, id: ChannelId) -> bool {
        self.immediate.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn id(n: u32) -> ChannelId {
        ChannelId::from_parts(1, n)
    }

    fn take(schedule: &mut UpdateSchedule) -> Vec<ChannelId> {
        let mut result = Vec::new();
        schedule.take_immediate(&mut result);
        result
    }

    #[test]
    fn test_timers_become_due() {
        let mut schedule = UpdateSchedule::new(1000);
        schedule.schedule_at(1300, id(1));
        schedule.schedule_at(1100, id(2));
        schedule.schedule_at(1100, id(3));
        assert_eq!(schedule.num_timers(), 3);

        schedule.collect_due(1099);
        assert!(take(&mut schedule).is_empty());

        schedule.collect_due(1100);
        assert_eq!(take(&mut schedule), vec![id(2), id(3)]);
        assert!(take(&mut schedule).is_empty());

        schedule.collect_due(2000);
        assert_eq!(take(&mut schedule), vec![id(1)]);
        assert_eq!(schedule.num_timers(), 0);
    }

    #[rstest]
    #[case::now(1000)]
    #[case::past(900)]
    fn test_not_in_future_is_immediate(#[case] due: u32) {
        let mut schedule = UpdateSchedule::new(1000);
        schedule.schedule_at(due, id(1));
        assert!(schedule.is_due(id(1)));
        assert_eq!(schedule.num_timers(), 0);
    }

    #[test]
    fn test_immediate_is_deduplicated() {
        let mut schedule = UpdateSchedule::new(0);
        schedule.schedule_now(id(2));
        schedule.schedule_now(id(1));
        schedule.schedule_now(id(2));
        schedule.schedule_at(5, id(1));
        schedule.collect_due(10);
        assert_eq!(take(&mut schedule), vec![id(1), id(2)]);
    }

    #[test]
    fn test_clock_wrap() {
        let mut schedule = UpdateSchedule::new(u32::MAX - 10);
        schedule.schedule_at(5, id(1));
        schedule.schedule_at(u32::MAX - 5, id(2));

        schedule.collect_due(u32::MAX);
        assert_eq!(take(&mut schedule), vec![id(2)]);

        schedule.collect_due(4);
        assert!(take(&mut schedule).is_empty());
        schedule.collect_due(5);
        assert_eq!(take(&mut schedule), vec![id(1)]);
    }
}
