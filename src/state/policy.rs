use crate::state::schedule::{Error, ScheduleState};
use crate::types::policy::{ScheduleSide, StandSchedulePolicy, StandSchedulePolicyStatus};

/// Pair of schedule states covering both sides of a policy.
#[derive(Clone, Debug, Default)]
pub struct PolicyState {
    startup: ScheduleState,
    shutdown: ScheduleState,
}

impl PolicyState {
    pub fn new(policy: &StandSchedulePolicy) -> Result<Self, Error> {
        Ok(Self {
            startup: ScheduleState::new(&policy.spec.schedules.startup)?,
            shutdown: ScheduleState::new(&policy.spec.schedules.shutdown)?,
        })
    }

    pub fn schedule(&self, side: ScheduleSide) -> &ScheduleState {
        match side {
            ScheduleSide::Startup => &self.startup,
            ScheduleSide::Shutdown => &self.shutdown,
        }
    }

    pub fn schedule_mut(&mut self, side: ScheduleSide) -> &mut ScheduleState {
        match side {
            ScheduleSide::Startup => &mut self.startup,
            ScheduleSide::Shutdown => &mut self.shutdown,
        }
    }

    /// Derives the full status from the two schedule states. Recomputed before
    /// every status write.
    pub fn status(&self) -> StandSchedulePolicyStatus {
        let mut conditions = self.startup.conditions(ScheduleSide::Startup);
        conditions.extend(self.shutdown.conditions(ScheduleSide::Shutdown));
        StandSchedulePolicyStatus {
            conditions,
            startup: Some(self.startup.summary()),
            shutdown: Some(self.shutdown.summary()),
        }
    }

    pub fn schedule_equals(&self, other: &Self) -> bool {
        self.startup.equals(&other.startup) && self.shutdown.equals(&other.shutdown)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::PolicyState;
    use crate::testing::policy_with_schedules;
    use crate::types::policy::ScheduleSide;

    #[test]
    fn status_is_a_pure_function_of_state() {
        let policy = policy_with_schedules("test", "ns", "@yearly", "* * * * *");
        let mut state = PolicyState::new(&policy).unwrap();

        let now = Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap();
        state.schedule_mut(ScheduleSide::Shutdown).set_fired_after(now);

        assert_eq!(state.status(), state.status());
        assert_eq!(
            state.status().shutdown.unwrap(),
            format!("Scheduled at {}", (now + chrono::Duration::minutes(1)).to_rfc3339())
        );
    }

    #[test]
    fn invalid_side_rejects_the_policy() {
        let policy = policy_with_schedules("test", "ns", "bad cron", "* * * * *");
        assert!(PolicyState::new(&policy).is_err());
    }
}
