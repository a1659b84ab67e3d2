use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use thiserror::Error;

use crate::cronexpr::{self, CronExpr};
use crate::types::policy::{CronSchedule, PolicyConditionType, PolicyStatusCondition, ScheduleSide};

/// Per-side schedule record: parsed cron, optional one-shot override and the
/// planned/observed execution timestamps.
///
/// At most one of `completed_at` and `failed_at` is set at any time. A state
/// without cron and override is inert: `fire_at` stays unset and
/// [`ScheduleState::schedule_required`] keeps returning false.
#[derive(Clone, Debug, Default)]
pub struct ScheduleState {
    cron: Option<CronExpr>,
    override_time: Option<DateTime<Utc>>,
    fire_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    InvalidCron(#[from] cronexpr::ParseError),
    #[error("invalid override time {value:?}: {source}")]
    InvalidOverride {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl ScheduleState {
    pub fn new(schedule: &CronSchedule) -> Result<Self, Error> {
        let cron = if schedule.cron.is_empty() {
            None
        } else {
            Some(CronExpr::parse(&schedule.cron)?)
        };
        let override_time = if schedule.override_time.is_empty() {
            None
        } else {
            let parsed = DateTime::parse_from_rfc3339(&schedule.override_time).map_err(|source| {
                Error::InvalidOverride {
                    value: schedule.override_time.clone(),
                    source,
                }
            })?;
            Some(parsed.with_timezone(&Utc))
        };
        Ok(Self {
            cron,
            override_time,
            ..Default::default()
        })
    }

    pub fn fire_time(&self) -> Option<DateTime<Utc>> {
        self.fire_at
    }

    /// Last execution outcome timestamp, completed taking precedence.
    pub fn executed_time(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.failed_at)
    }

    /// Next fire instant after `since`: the override while it is still ahead,
    /// otherwise the next cron match. `None` when neither applies.
    pub fn next_execution_time(&self, since: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(override_time) = self.override_time {
            if override_time > since {
                return Some(override_time);
            }
        }
        self.cron.as_ref().and_then(|cron| cron.next_after(since))
    }

    /// Arms the side: plans the next fire time and clears both outcomes.
    pub fn set_fired_after(&mut self, since: DateTime<Utc>) {
        self.fire_at = self.next_execution_time(since);
        self.completed_at = None;
        self.failed_at = None;
    }

    pub fn set_completed(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.failed_at = None;
    }

    pub fn set_failed(&mut self, at: DateTime<Utc>) {
        self.failed_at = Some(at);
        self.completed_at = None;
    }

    /// Records an execution outcome.
    pub fn record<T, E>(&mut self, at: DateTime<Utc>, result: &Result<T, E>) {
        match result {
            Ok(_) => self.set_completed(at),
            Err(_) => self.set_failed(at),
        }
    }

    /// Whether the side needs (re-)arming. An armed but unexecuted side never
    /// re-arms; an executed one re-arms only once the midpoint between the
    /// execution and the next nominal fire has passed, so late completions do
    /// not immediately re-trigger the same instant.
    pub fn schedule_required(&self, now: DateTime<Utc>) -> bool {
        if self.fire_at.is_none() {
            return self.next_execution_time(now).is_some();
        }

        let Some(executed) = self.executed_time() else {
            return false;
        };

        let Some(next) = self.next_execution_time(now) else {
            return false;
        };

        let delta = (next - executed) / 2;
        now > executed + delta
    }

    /// Conditions reflecting the non-empty timestamps.
    pub fn conditions(&self, side: ScheduleSide) -> Vec<PolicyStatusCondition> {
        let timestamps = [
            (PolicyConditionType::Scheduled, self.fire_at),
            (PolicyConditionType::Completed, self.completed_at),
            (PolicyConditionType::Failed, self.failed_at),
        ];
        timestamps
            .into_iter()
            .filter_map(|(kind, at)| {
                at.map(|at| PolicyStatusCondition {
                    kind,
                    status: side,
                    last_transition_time: Some(Time(at)),
                })
            })
            .collect()
    }

    /// Human-readable summary surfaced through the status printer columns.
    pub fn summary(&self) -> String {
        if let Some(at) = self.completed_at {
            return format!("Completed at {}", at.to_rfc3339());
        }
        if let Some(at) = self.failed_at {
            return format!("Failed at {}", at.to_rfc3339());
        }
        if let Some(at) = self.fire_at {
            return format!("Scheduled at {}", at.to_rfc3339());
        }
        "Disabled".to_string()
    }

    /// Schedule equality considers the parsed cron and override only; the
    /// runtime fields are ignored.
    pub fn equals(&self, other: &Self) -> bool {
        self.cron == other.cron && self.override_time == other.override_time
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::ScheduleState;
    use crate::types::policy::{CronSchedule, PolicyConditionType, ScheduleSide};

    fn schedule(cron: &str, override_time: &str) -> ScheduleState {
        ScheduleState::new(&CronSchedule {
            cron: cron.to_string(),
            override_time: override_time.to_string(),
        })
        .unwrap()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn executed_time_tracks_latest_outcome() {
        let mut state = schedule("* * * * *", "");

        state.set_completed(ts() + chrono::Duration::hours(2));
        assert_eq!(state.executed_time(), Some(ts() + chrono::Duration::hours(2)));

        state.set_failed(ts() + chrono::Duration::hours(3));
        assert_eq!(state.executed_time(), Some(ts() + chrono::Duration::hours(3)));
    }

    #[test]
    fn next_execution_time_prefers_pending_override() {
        let state = schedule("* * * * *", "");
        assert_eq!(
            state.next_execution_time(ts()),
            Some(ts() + chrono::Duration::minutes(1))
        );

        let with_override = schedule("@yearly", &(ts() + chrono::Duration::minutes(1)).to_rfc3339());
        assert_eq!(
            with_override.next_execution_time(ts()),
            Some(ts() + chrono::Duration::minutes(1))
        );
    }

    #[test]
    fn consumed_override_falls_back_to_cron() {
        let state = schedule("", &(ts() - chrono::Duration::minutes(1)).to_rfc3339());
        assert_eq!(state.next_execution_time(ts()), None);
    }

    #[test]
    fn set_fired_after_plans_and_clears_outcomes() {
        let mut state = schedule("* * * * *", "");
        state.set_failed(ts());
        state.set_fired_after(ts());

        assert_eq!(state.fire_time(), Some(ts() + chrono::Duration::minutes(1)));
        assert_eq!(state.executed_time(), None);
    }

    #[test]
    fn outcomes_are_mutually_exclusive() {
        let mut state = schedule("* * * * *", "");

        state.set_completed(ts());
        state.set_failed(ts() + chrono::Duration::minutes(1));
        assert_eq!(state.executed_time(), Some(ts() + chrono::Duration::minutes(1)));

        state.set_completed(ts() + chrono::Duration::minutes(2));
        let conditions = state.conditions(ScheduleSide::Shutdown);
        assert!(conditions.iter().all(|c| c.kind != PolicyConditionType::Failed));
    }

    #[test]
    fn conditions_reflect_timestamps() {
        let mut state = schedule("* * * * *", "");
        state.set_fired_after(ts());

        let conditions = state.conditions(ScheduleSide::Shutdown);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].kind, PolicyConditionType::Scheduled);
        assert_eq!(conditions[0].status, ScheduleSide::Shutdown);

        state.set_failed(ts() + chrono::Duration::minutes(3));
        let kinds: Vec<_> = state
            .conditions(ScheduleSide::Shutdown)
            .into_iter()
            .map(|c| c.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![PolicyConditionType::Scheduled, PolicyConditionType::Failed]
        );
    }

    #[test]
    fn schedule_required_crosses_midpoint() {
        let mut state = schedule("* * * * *", "");

        // unarmed with a next fire time ahead
        assert!(state.schedule_required(ts()));
        state.set_fired_after(ts());
        assert!(!state.schedule_required(ts()));

        // fired at 12:01, completed 10s later
        let completed = ts() + chrono::Duration::minutes(1) + chrono::Duration::seconds(10);
        state.set_completed(completed);

        // next fire 12:02; midpoint (completion + 25s) not crossed 10s in
        assert!(!state.schedule_required(completed + chrono::Duration::seconds(10)));
        assert!(state.schedule_required(completed + chrono::Duration::seconds(30)));
    }

    #[test]
    fn inert_state_never_requires_scheduling() {
        let state = schedule("", "");
        assert!(!state.schedule_required(ts()));
        assert_eq!(state.summary(), "Disabled");
    }

    #[test]
    fn consumed_override_does_not_rearm() {
        let mut state = schedule("", &(ts() + chrono::Duration::seconds(1)).to_rfc3339());
        assert!(state.schedule_required(ts()));

        state.set_fired_after(ts());
        state.set_completed(ts() + chrono::Duration::minutes(2));
        assert!(!state.schedule_required(ts() + chrono::Duration::minutes(5)));
    }

    #[test]
    fn equals_ignores_runtime_fields() {
        let mut a = schedule("* * * * *", "");
        let b = schedule("* * * * *", "");
        a.set_fired_after(ts());
        assert!(a.equals(&b));

        let c = schedule("0/5 * * * *", "");
        assert!(!a.equals(&c));

        let d = schedule("* * * * *", &ts().to_rfc3339());
        assert!(!b.equals(&d));
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(ScheduleState::new(&CronSchedule {
            cron: "bad".into(),
            override_time: String::new(),
        })
        .is_err());
        assert!(ScheduleState::new(&CronSchedule {
            cron: String::new(),
            override_time: "not-a-time".into(),
        })
        .is_err());
    }
}
