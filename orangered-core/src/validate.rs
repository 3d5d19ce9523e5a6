//! Syntactic validation of user-supplied inputs.
//!
//! Everything here is a pure check that runs before any HTTP request is
//! built, so a bad input fails fast with a [`ConfigError`] instead of a
//! round-trip to Reddit.

use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Reddit caps listing pages and morechildren batches at 100 entries.
pub const MAX_LISTING_LIMIT: u32 = 100;
pub const MAX_MORE_CHILDREN_IDS: usize = 100;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_HTTP_TIMEOUT: Duration = Duration::from_secs(1);
const LONG_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Aggregation pseudo-subreddits that are never valid as a plain name.
const RESERVED_NAMES: &[&str] = &["all", "popular", "random", "randnsfw", "friends", "mod"];

fn is_base36(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 13
        && s.bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}

/// Check a subreddit name: 3-21 characters of `[A-Za-z0-9_]`, not reserved.
pub fn subreddit_name(name: &str) -> Result<(), ConfigError> {
    if name.len() < 3 || name.len() > 21 {
        return Err(ConfigError::InvalidSubreddit {
            name: name.to_string(),
            reason: "must be 3-21 characters",
        });
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(ConfigError::InvalidSubreddit {
            name: name.to_string(),
            reason: "may only contain letters, digits, and underscores",
        });
    }
    if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::InvalidSubreddit {
            name: name.to_string(),
            reason: "reserved name",
        });
    }
    Ok(())
}

/// Check a fullname: `t[1-5]_` followed by 1-13 base36 characters.
pub fn fullname(value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidFullname {
        value: value.to_string(),
    };
    let mut bytes = value.bytes();
    if bytes.next() != Some(b't') {
        return Err(invalid());
    }
    if !matches!(bytes.next(), Some(b'1'..=b'5')) {
        return Err(invalid());
    }
    if bytes.next() != Some(b'_') {
        return Err(invalid());
    }
    if !is_base36(&value[3..]) {
        return Err(invalid());
    }
    Ok(())
}

/// Check a morechildren id batch: at most 100 bare base36 ids.
pub fn comment_ids(ids: &[String]) -> Result<(), ConfigError> {
    if ids.len() > MAX_MORE_CHILDREN_IDS {
        return Err(ConfigError::TooManyIds {
            count: ids.len(),
            max: MAX_MORE_CHILDREN_IDS,
        });
    }
    for id in ids {
        if !is_base36(id) {
            return Err(ConfigError::InvalidCommentId { value: id.clone() });
        }
    }
    Ok(())
}

/// Check listing pagination: `limit` within range, at most one cursor.
/// The cursors themselves are opaque and not inspected.
pub fn pagination(
    limit: u32,
    after: Option<&str>,
    before: Option<&str>,
) -> Result<(), ConfigError> {
    if limit > MAX_LISTING_LIMIT {
        return Err(ConfigError::InvalidLimit {
            limit,
            max: MAX_LISTING_LIMIT,
        });
    }
    let has_after = after.is_some_and(|s| !s.is_empty());
    let has_before = before.is_some_and(|s| !s.is_empty());
    if has_after && has_before {
        return Err(ConfigError::ConflictingCursors);
    }
    Ok(())
}

/// Check a user agent: non-empty and free of CR/LF (header injection guard).
pub fn user_agent(value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidUserAgent {
            reason: "must not be empty",
        });
    }
    if value.contains(['\r', '\n']) {
        return Err(ConfigError::InvalidUserAgent {
            reason: "must not contain CR or LF",
        });
    }
    Ok(())
}

/// Accept a post id as either `abc123` or `t3_abc123` and return the
/// `t3_`-prefixed form.
pub fn normalize_link_id(value: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidLinkId {
        value: value.to_string(),
    };
    let bare = match value.split_once('_') {
        Some(("t3", rest)) => rest,
        Some(_) => return Err(invalid()),
        None => value,
    };
    if !is_base36(bare) {
        return Err(invalid());
    }
    Ok(format!("t3_{bare}"))
}

/// Normalize the configured HTTP timeout: zero means the default, below one
/// second is rejected, beyond five minutes is accepted with a warning.
pub fn normalize_timeout(timeout: Duration) -> Result<Duration, ConfigError> {
    if timeout.is_zero() {
        return Ok(DEFAULT_HTTP_TIMEOUT);
    }
    if timeout < MIN_HTTP_TIMEOUT {
        return Err(ConfigError::TimeoutTooShort {
            configured: timeout,
            minimum: MIN_HTTP_TIMEOUT,
        });
    }
    if timeout > LONG_HTTP_TIMEOUT {
        warn!(?timeout, "configured http timeout is unusually long");
    }
    Ok(timeout)
}
