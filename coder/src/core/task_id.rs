//! Task identifiers.
//!
//! A task id is `<slug>-<digest>-<timestamp>`: the slug and digest are derived
//! from the description, so repeated runs of the same task share a prefix that
//! can be used to find resumable state, and the timestamp keeps ids of separate
//! runs distinct.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

const SLUG_MAX_CHARS: usize = 32;

/// Stable prefix shared by every run of the same task description.
pub fn description_digest(description: &str) -> String {
    let normalized = description.split_whitespace().collect::<Vec<_>>().join(" ");
    let hash = Sha256::digest(normalized.as_bytes());
    let short = hex::encode(&hash[..4]);
    let slug = slugify(&normalized);
    if slug.is_empty() {
        format!("task-{short}")
    } else {
        format!("{slug}-{short}")
    }
}

/// Fresh task id for `description` started at `now`, to the microsecond.
pub fn derive_task_id(description: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        description_digest(description),
        now.format("%Y%m%d%H%M%S%6f")
    )
}

/// Ids become store keys and directory names; keep them to a safe alphabet.
pub fn validate_task_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(anyhow!("task id must be non-empty"));
    }
    if id.starts_with('.') || id.contains("..") {
        return Err(anyhow!("task id '{id}' must not contain '..' or start with '.'"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(anyhow!(
            "task id '{id}' may only contain ASCII letters, digits, '-', '_' or '.'"
        ));
    }
    Ok(())
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
            if slug.len() >= SLUG_MAX_CHARS {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn digest_is_stable_across_whitespace() {
        assert_eq!(
            description_digest("Create a  Flask app"),
            description_digest(" Create a Flask app\n")
        );
        assert!(description_digest("Create a Flask app").starts_with("create-a-flask-app-"));
        assert!(description_digest("!!!").starts_with("task-"));
    }

    #[test]
    fn derived_ids_differ_by_timestamp() {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        let a = derive_task_id("build it", first);
        let b = derive_task_id("build it", second);
        assert_ne!(a, b);
        assert!(a.ends_with("-20240501120000000000"));
        assert!(a.starts_with(&description_digest("build it")));
        validate_task_id(&a).expect("derived ids are valid");
    }

    #[test]
    fn runs_started_within_one_second_get_distinct_ids() {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let second = first + chrono::Duration::milliseconds(400);
        let third = first + chrono::Duration::microseconds(1);
        let a = derive_task_id("add tests", first);
        let b = derive_task_id("add tests", second);
        let c = derive_task_id("add tests", third);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(b.ends_with("-20240501120000400000"));
        validate_task_id(&b).expect("derived ids are valid");
    }

    #[test]
    fn rejects_unsafe_ids() {
        assert!(validate_task_id("").is_err());
        assert!(validate_task_id("../etc").is_err());
        assert!(validate_task_id("a/b").is_err());
        assert!(validate_task_id("task_1.v2").is_ok());
    }
}
