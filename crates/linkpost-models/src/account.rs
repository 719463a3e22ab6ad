//! Linked LinkedIn account models.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of a linked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl AccountId {
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A LinkedIn member connected through OAuth.
#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LinkedAccount {
    pub id: AccountId,
    /// LinkedIn member id (`sub` claim), used to build `urn:li:person:<id>`
    pub linkedin_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl LinkedAccount {
    /// Check whether the access token has expired at `now`.
    ///
    /// Accounts without a recorded expiry are treated as valid.
    pub fn is_token_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Check whether the access token has expired.
    pub fn is_token_expired(&self) -> bool {
        self.is_token_expired_at(Utc::now())
    }

    /// Person URN of the member.
    pub fn person_urn(&self) -> String {
        format!("urn:li:person:{}", self.linkedin_id)
    }
}

// Tokens must never reach the logs.
impl fmt::Debug for LinkedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedAccount")
            .field("id", &self.id)
            .field("linkedin_id", &self.linkedin_id)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_expires_at", &self.token_expires_at)
            .finish()
    }
}

/// Result of an OAuth refresh-token exchange.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// LinkedIn only rotates the refresh token sometimes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds
    pub expires_in: i64,
}

impl TokenGrant {
    /// Absolute expiry of the access token, relative to `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in)
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(expires_at: Option<DateTime<Utc>>) -> LinkedAccount {
        LinkedAccount {
            id: AccountId(3),
            linkedin_id: "abc123".to_string(),
            access_token: "secret-token".to_string(),
            refresh_token: Some("refresh".to_string()),
            token_expires_at: expires_at,
        }
    }

    #[test]
    fn test_token_expiry() {
        let now = Utc::now();
        assert!(account(Some(now - Duration::seconds(1))).is_token_expired_at(now));
        assert!(account(Some(now)).is_token_expired_at(now));
        assert!(!account(Some(now + Duration::hours(1))).is_token_expired_at(now));
        assert!(!account(None).is_token_expired_at(now));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", account(None));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_person_urn() {
        assert_eq!(account(None).person_urn(), "urn:li:person:abc123");
    }
}
