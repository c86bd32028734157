//! Username and email generation for new student accounts.
//!
//! Candidates are checked against the accounts table only; nothing is locked.
//! Two concurrent creations may pick the same name, in which case the second
//! account insert fails on the unique constraint.

use crate::context::RequestContext;
use crate::error::Result;
use crate::store::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub email: String,
}

/// Lowercased concatenation of the names with all whitespace removed.
pub fn base_username(first: &str, middle: &str, last: &str) -> String {
    [first, middle, last]
        .concat()
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// `local@domain` with `suffix` appended to the local part.
pub fn email_with_suffix(email: &str, suffix: u32) -> String {
    match email.split_once('@') {
        Some((local, domain)) => format!("{local}{suffix}@{domain}"),
        None => format!("{email}{suffix}"),
    }
}

pub async fn unique_username(session: &mut dyn Session, base: &str) -> Result<String> {
    let mut candidate = base.to_string();
    let mut suffix = 0u32;
    while session.username_taken(&candidate).await? {
        suffix += 1;
        candidate = format!("{base}{suffix}");
    }
    Ok(candidate)
}

pub async fn unique_email(session: &mut dyn Session, wanted: &str) -> Result<String> {
    let mut candidate = wanted.to_string();
    let mut suffix = 0u32;
    while session.email_taken(&candidate).await? {
        suffix += 1;
        candidate = email_with_suffix(wanted, suffix);
    }
    Ok(candidate)
}

/// Picks a free username and email for a student named `first middle last`.
///
/// A caller supplied email is kept when free; otherwise the address is derived
/// from the username and the configured placeholder domain.
pub async fn generate(
    session: &mut dyn Session,
    ctx: &RequestContext,
    names: (&str, &str, &str),
    requested_email: Option<&str>,
) -> Result<Identity> {
    let (first, middle, last) = names;
    let mut base = base_username(first, middle, last);
    if base.is_empty() {
        base = format!("user{}", ctx.clock.millis());
    }
    let username = unique_username(session, &base).await?;

    let wanted = match requested_email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(email) => email.to_string(),
        None => format!("{username}@{}", ctx.email_domain),
    };
    let email = unique_email(session, &wanted).await?;

    Ok(Identity { username, email })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Clock;
    use crate::memory::MemoryStore;
    use crate::store::{NewAccount, Store};
    use chrono::{TimeZone, Utc};

    fn ctx() -> RequestContext {
        let clock = Clock::fixed(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        RequestContext::new(&crate::config::Settings::default(), clock)
    }

    #[test]
    fn base_strips_whitespace_and_case() {
        assert_eq!(base_username("Ana Maria", "", " De la Cruz"), "anamariadelacruz");
        assert_eq!(base_username(" ", "", ""), "");
    }

    #[test]
    fn suffix_goes_before_at() {
        assert_eq!(email_with_suffix("jo@x.org", 2), "jo2@x.org");
        assert_eq!(email_with_suffix("broken", 1), "broken1");
    }

    #[tokio::test]
    async fn collisions_get_increasing_suffixes() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        for (username, email) in [
            ("juandelacruz", "juandelacruz@no-reply.students.local"),
            ("juandelacruz1", "jdc@mail.test"),
        ] {
            session
                .insert_account(&NewAccount {
                    username: username.into(),
                    email: email.into(),
                    role_id: 1,
                })
                .await
                .unwrap();
        }

        let identity = generate(session.as_mut(), &ctx(), ("Juan", "", "Dela Cruz"), None)
            .await
            .unwrap();
        assert_eq!(identity.username, "juandelacruz2");
        assert_eq!(identity.email, "juandelacruz2@no-reply.students.local");

        let identity = generate(
            session.as_mut(),
            &ctx(),
            ("Juan", "", "Dela Cruz"),
            Some(" jdc@mail.test "),
        )
        .await
        .unwrap();
        assert_eq!(identity.email, "jdc1@mail.test");
    }

    #[tokio::test]
    async fn empty_names_fall_back_to_timestamp() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        let identity = generate(session.as_mut(), &ctx(), ("", " ", ""), None)
            .await
            .unwrap();
        assert_eq!(identity.username, format!("user{}", ctx().clock.millis()));
    }
}
