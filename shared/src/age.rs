use chrono::{Datelike, NaiveDate};

/// Calendar age on `today` of someone born on `birth_date`.
///
/// The year difference is reduced by one while this year's birthday has not
/// been reached yet. Returns `None` when no birth date is known.
pub fn calculate_age(birth_date: Option<NaiveDate>, today: NaiveDate) -> Option<i32> {
    let birth = birth_date?;
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    Some(age)
}
