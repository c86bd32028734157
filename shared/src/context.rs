//! Per-request inputs that are not part of the payload: the clock and the
//! configured defaults the workflows need.

use chrono::{DateTime, NaiveDate, Utc};

use crate::competency::CompetencyDefaults;
use crate::config::Settings;

/// Point in time a request is handled at. Captured once so every write in a
/// workflow agrees on "today".
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    pub today: NaiveDate,
    pub now: DateTime<Utc>,
}

impl Clock {
    pub fn system() -> Self {
        Self::fixed(Utc::now())
    }

    pub fn fixed(now: DateTime<Utc>) -> Self {
        Self {
            today: now.date_naive(),
            now,
        }
    }

    pub fn millis(&self) -> i64 {
        self.now.timestamp_millis()
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub clock: Clock,
    pub email_domain: String,
    pub student_role_id: i64,
    pub competency: CompetencyDefaults,
}

impl RequestContext {
    pub fn new(settings: &Settings, clock: Clock) -> Self {
        Self {
            clock,
            email_domain: settings.email_domain.clone(),
            student_role_id: settings.student_role_id,
            competency: settings.competency_defaults(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn today_is_the_utc_date_of_now() {
        let clock = Clock::system();
        assert_eq!(clock.today, clock.now.date_naive());

        let late = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let clock = Clock::fixed(late);
        assert_eq!(clock.today, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_eq!(clock.millis(), late.timestamp_millis());
    }
}
