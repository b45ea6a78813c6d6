//! Schedule persistence and evaluation.

use super::{Action, DispatchError, ScheduleEntry, ScheduleError};
use crate::storage::ScheduleTable;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Receives the actions of fired entries.
pub trait ActionDispatcher {
    fn broadcast(&self, entry: &ScheduleEntry, name: &str) -> Result<(), DispatchError>;
    fn invoke(&self, owner: &str, target: &str) -> Result<(), DispatchError>;
}

/// Result of [`Scheduler::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
    Unchanged,
}

/// What one evaluation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Ids of entries that fired and were marked.
    pub fired: Vec<String>,
    /// Ids of due entries whose dispatch failed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Persists entries and fires the due ones.
pub struct Scheduler {
    table: Arc<dyn ScheduleTable>,
    timezone: Tz,
    evaluating: Mutex<()>,
}

impl Scheduler {
    pub fn new(table: Arc<dyn ScheduleTable>, timezone: Tz) -> Self {
        Self {
            table,
            timezone,
            evaluating: Mutex::new(()),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Validate and upsert `entry` by id.
    ///
    /// An existing entry with the same definition is left untouched; a changed
    /// one is replaced but keeps its firing history.
    pub fn save(&self, entry: ScheduleEntry) -> Result<SaveOutcome, ScheduleError> {
        validate(&entry)?;
        let mut entry = ScheduleEntry {
            trigger: entry.trigger.normalized(),
            ..entry
        };

        let outcome = match self.table.read_schedule(&entry.id)? {
            Some(existing) if existing.same_definition(&entry) => return Ok(SaveOutcome::Unchanged),
            Some(existing) => {
                entry.last_triggered = existing.last_triggered;
                SaveOutcome::Updated
            }
            None => SaveOutcome::Created,
        };

        self.table.upsert_schedule(&entry)?;
        info!(
            id = %entry.id,
            owner = %entry.owner,
            trigger = %entry.trigger.describe(),
            ?outcome,
            "schedule saved"
        );
        Ok(outcome)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        match self.table.delete_schedule(id) {
            Ok(removed) => {
                if removed {
                    info!(id, "schedule removed");
                }
                removed
            }
            Err(e) => {
                warn!(id, error = %e, "failed to remove schedule");
                false
            }
        }
    }

    /// Remove every entry owned by `owner`.
    pub fn remove_owned_by(&self, owner: &str) -> usize {
        match self.table.delete_owned_by(owner) {
            Ok(removed) => {
                debug!(owner, removed, "owner schedules removed");
                removed
            }
            Err(e) => {
                warn!(owner, error = %e, "failed to remove owner schedules");
                0
            }
        }
    }

    /// Remove every entry.
    pub fn clear(&self) -> usize {
        self.table.delete_all_schedules().unwrap_or_else(|e| {
            warn!(error = %e, "failed to clear schedules");
            0
        })
    }

    pub fn get(&self, id: &str) -> Option<ScheduleEntry> {
        self.table.read_schedule(id).unwrap_or_else(|e| {
            warn!(id, error = %e, "failed to read schedule");
            None
        })
    }

    pub fn list(&self) -> Vec<ScheduleEntry> {
        self.table.list_schedules().unwrap_or_else(|e| {
            warn!(error = %e, "failed to list schedules");
            Vec::new()
        })
    }

    /// Fire every entry due at `now`.
    ///
    /// A fired entry is marked with `now` only after its dispatch succeeded,
    /// so a failed dispatch is retried on the next pass. Each due entry is
    /// read again just before dispatch; one removed by an earlier action in
    /// the same pass does not fire.
    pub fn evaluate(&self, now: DateTime<Utc>, dispatcher: &dyn ActionDispatcher) -> Evaluation {
        let _serialized = self
            .evaluating
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut evaluation = Evaluation::default();
        for entry in self.list() {
            if !entry.trigger.is_due(entry.last_triggered, now, self.timezone) {
                continue;
            }
            let Some(entry) = self.get(&entry.id) else {
                debug!(id = %entry.id, "schedule removed during evaluation");
                continue;
            };

            let dispatched = match &entry.action {
                Action::Broadcast { name } => dispatcher.broadcast(&entry, name),
                Action::Invoke { target } => dispatcher.invoke(&entry.owner, target),
            };

            match dispatched {
                Ok(()) => match self.table.mark_triggered(&entry.id, now) {
                    Ok(()) => {
                        debug!(id = %entry.id, action = %entry.action.describe(), "schedule fired");
                        evaluation.fired.push(entry.id);
                    }
                    Err(e) => {
                        warn!(id = %entry.id, error = %e, "fired but could not record firing");
                        evaluation.failed.push((entry.id, e.to_string()));
                    }
                },
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "schedule dispatch failed");
                    evaluation.failed.push((entry.id, e.to_string()));
                }
            }
        }
        evaluation
    }
}

fn validate(entry: &ScheduleEntry) -> Result<(), ScheduleError> {
    if entry.id.trim().is_empty() {
        return Err(ScheduleError::EmptyId);
    }
    entry.trigger.validate()?;
    let target = match &entry.action {
        Action::Broadcast { name } => name,
        Action::Invoke { target } => target,
    };
    if target.trim().is_empty() {
        return Err(ScheduleError::EmptyTarget);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Trigger;
    use crate::storage::MemoryStore;
    use chrono::{Duration, Month, TimeZone, Weekday};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        broadcasts: RefCell<Vec<String>>,
        invokes: RefCell<Vec<(String, String)>>,
        fail: bool,
    }

    impl ActionDispatcher for Recorder {
        fn broadcast(&self, _entry: &ScheduleEntry, name: &str) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError("offline".to_string()));
            }
            self.broadcasts.borrow_mut().push(name.to_string());
            Ok(())
        }

        fn invoke(&self, owner: &str, target: &str) -> Result<(), DispatchError> {
            self.invokes
                .borrow_mut()
                .push((owner.to_string(), target.to_string()));
            Ok(())
        }
    }

    fn scheduler() -> (Scheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Scheduler::new(store.clone(), Tz::UTC), store)
    }

    fn sync_entry(minutes: u32) -> ScheduleEntry {
        ScheduleEntry::new(
            "schedule_sync_data",
            Trigger::every_minutes(minutes),
            Action::broadcast("sync_data"),
        )
    }

    #[test]
    fn test_save_outcomes() {
        let (scheduler, _) = scheduler();
        assert_eq!(scheduler.save(sync_entry(30)), Ok(SaveOutcome::Created));
        assert_eq!(scheduler.save(sync_entry(30)), Ok(SaveOutcome::Unchanged));
        assert_eq!(scheduler.save(sync_entry(60)), Ok(SaveOutcome::Updated));
        assert_eq!(scheduler.list().len(), 1);
    }

    #[test]
    fn test_update_keeps_last_triggered() {
        let (scheduler, _) = scheduler();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
        scheduler.save(sync_entry(30)).unwrap();
        scheduler.evaluate(now, &Recorder::default());

        scheduler.save(sync_entry(60)).unwrap();
        let entry = scheduler.get("schedule_sync_data").unwrap();
        assert_eq!(entry.last_triggered, Some(now));
        assert_eq!(entry.trigger, Trigger::every_minutes(60));
    }

    #[test]
    fn test_validation_errors() {
        let (scheduler, _) = scheduler();
        assert_eq!(
            scheduler.save(ScheduleEntry::new("", Trigger::daily(), Action::broadcast("x"))),
            Err(ScheduleError::EmptyId)
        );
        assert_eq!(scheduler.save(sync_entry(0)), Err(ScheduleError::ZeroInterval));
        assert_eq!(
            scheduler.save(ScheduleEntry::new("a", Trigger::daily(), Action::invoke(" "))),
            Err(ScheduleError::EmptyTarget)
        );
        assert!(scheduler.list().is_empty());
    }

    #[test]
    fn test_interval_catch_up_fires_once() {
        let (scheduler, _) = scheduler();
        let start = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
        let recorder = Recorder::default();
        scheduler.save(sync_entry(30)).unwrap();

        scheduler.evaluate(start, &recorder);
        // Agent was down for hours; missed windows collapse into one firing.
        let later = start + Duration::hours(5);
        assert_eq!(scheduler.evaluate(later, &recorder).fired.len(), 1);
        assert!(scheduler.evaluate(later, &recorder).fired.is_empty());
        assert_eq!(recorder.broadcasts.borrow().len(), 2);
    }

    #[test]
    fn test_weekday_fires_once_per_day() {
        let (scheduler, _) = scheduler();
        let recorder = Recorder::default();
        scheduler
            .save(ScheduleEntry::new(
                "schedule_space_maintenance",
                Trigger::weekly(Weekday::Sun),
                Action::broadcast("space_maintenance"),
            ))
            .unwrap();

        // 2024-05-05 is a Sunday.
        let midnight = Utc.with_ymd_and_hms(2024, 5, 5, 0, 0, 0).unwrap();
        let fired: usize = (0..100)
            .map(|i| {
                scheduler
                    .evaluate(midnight + Duration::minutes(i * 10), &recorder)
                    .fired
                    .len()
            })
            .sum();
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_month_anchor_clamped_to_short_month() {
        let (scheduler, _) = scheduler();
        let recorder = Recorder::default();
        scheduler
            .save(ScheduleEntry::new(
                "month_end_report",
                Trigger::months([Month::April], Some(31)),
                Action::broadcast("month_end"),
            ))
            .unwrap();

        let day = |d: u32, h: u32| Utc.with_ymd_and_hms(2024, 4, d, h, 0, 0).unwrap();
        assert!(scheduler.evaluate(day(29, 23), &recorder).fired.is_empty());
        assert_eq!(
            scheduler.evaluate(day(30, 0), &recorder).fired,
            vec!["month_end_report".to_string()]
        );
        assert!(scheduler.evaluate(day(30, 18), &recorder).fired.is_empty());
        let may = Utc.with_ymd_and_hms(2024, 5, 31, 12, 0, 0).unwrap();
        assert!(scheduler.evaluate(may, &recorder).fired.is_empty());
        let next_april = Utc.with_ymd_and_hms(2025, 4, 30, 6, 0, 0).unwrap();
        assert_eq!(scheduler.evaluate(next_april, &recorder).fired.len(), 1);
        assert_eq!(recorder.broadcasts.borrow().len(), 2);
    }

    /// Clears every schedule when it sees `quit`.
    struct Quitting<'a> {
        scheduler: &'a Scheduler,
        broadcasts: RefCell<Vec<String>>,
    }

    impl ActionDispatcher for Quitting<'_> {
        fn broadcast(&self, _entry: &ScheduleEntry, name: &str) -> Result<(), DispatchError> {
            self.broadcasts.borrow_mut().push(name.to_string());
            if name == "quit" {
                self.scheduler.clear();
            }
            Ok(())
        }

        fn invoke(&self, _owner: &str, _target: &str) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    #[test]
    fn test_entries_removed_mid_pass_do_not_fire() {
        let (scheduler, _) = scheduler();
        for (id, action) in [("a_quit", "quit"), ("b_upload", "upload"), ("c_ping", "ping")] {
            scheduler
                .save(ScheduleEntry::new(id, Trigger::daily(), Action::broadcast(action)))
                .unwrap();
        }
        let dispatcher = Quitting {
            scheduler: &scheduler,
            broadcasts: RefCell::new(Vec::new()),
        };

        let evaluation = scheduler.evaluate(Utc::now(), &dispatcher);

        assert_eq!(dispatcher.broadcasts.into_inner(), vec!["quit".to_string()]);
        assert_eq!(evaluation.fired, vec!["a_quit".to_string()]);
        assert!(scheduler.list().is_empty());
    }

    #[test]
    fn test_failed_dispatch_is_retried() {
        let (scheduler, _) = scheduler();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
        scheduler.save(sync_entry(30)).unwrap();

        let failing = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let evaluation = scheduler.evaluate(now, &failing);
        assert!(evaluation.fired.is_empty());
        assert_eq!(evaluation.failed.len(), 1);
        assert_eq!(scheduler.get("schedule_sync_data").unwrap().last_triggered, None);

        let evaluation = scheduler.evaluate(now, &Recorder::default());
        assert_eq!(evaluation.fired, vec!["schedule_sync_data".to_string()]);
    }

    #[test]
    fn test_invoke_goes_to_owner() {
        let (scheduler, _) = scheduler();
        let recorder = Recorder::default();
        scheduler
            .save(
                ScheduleEntry::new("steps_hourly", Trigger::every_minutes(60), Action::invoke("collect"))
                    .owned_by("org.example.plugin.steps"),
            )
            .unwrap();

        scheduler.evaluate(Utc::now(), &recorder);
        assert_eq!(
            recorder.invokes.borrow().as_slice(),
            &[("org.example.plugin.steps".to_string(), "collect".to_string())]
        );
    }

    #[test]
    fn test_storage_fault_on_save_is_typed() {
        let (scheduler, store) = scheduler();
        store.set_failing(true);
        assert!(matches!(
            scheduler.save(sync_entry(30)),
            Err(ScheduleError::Storage(_))
        ));
        assert!(scheduler.evaluate(Utc::now(), &Recorder::default()).fired.is_empty());
    }
}
