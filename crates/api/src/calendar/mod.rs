//! Google Calendar integration
//!
//! Practitioners connect a Google account once; bookings are then mirrored
//! into their calendar. Calendar failures never fail a booking operation.

pub mod google;
pub mod sync;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

pub use google::{EventPayload, GoogleCalendarClient, TokenResponse};
pub use sync::CalendarSync;

type HmacSha256 = Hmac<Sha256>;

/// OAuth `state` values older than this are rejected
pub const STATE_MAX_AGE_SECS: i64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Google Calendar is not configured")]
    NotConfigured,
    #[error("No Google Calendar connected")]
    NotConnected,
    #[error("Invalid or expired OAuth state")]
    InvalidState,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Google API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for CalendarError {
    fn from(err: sqlx::Error) -> Self {
        CalendarError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for CalendarError {
    fn from(err: reqwest::Error) -> Self {
        CalendarError::Network(err.to_string())
    }
}

fn state_mac(secret: &str, payload: &str) -> Result<HmacSha256, CalendarError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| CalendarError::NotConfigured)?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Signed OAuth state: `{user_id}.{issued_at}.{hex hmac}`
pub fn sign_state(user_id: Uuid, issued_at: i64, secret: &str) -> Result<String, CalendarError> {
    let payload = format!("{}.{}", user_id, issued_at);
    let signature = hex::encode(state_mac(secret, &payload)?.finalize().into_bytes());
    Ok(format!("{}.{}", payload, signature))
}

/// Check the signature and age of a state value, returning the user it was issued for
pub fn verify_state(state: &str, secret: &str, now: i64) -> Result<Uuid, CalendarError> {
    let mut parts = state.splitn(3, '.');
    let (Some(user), Some(issued), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(CalendarError::InvalidState);
    };

    let user_id = Uuid::parse_str(user).map_err(|_| CalendarError::InvalidState)?;
    let issued_at: i64 = issued.parse().map_err(|_| CalendarError::InvalidState)?;
    let signature = hex::decode(signature).map_err(|_| CalendarError::InvalidState)?;

    state_mac(secret, &format!("{}.{}", user, issued))?
        .verify_slice(&signature)
        .map_err(|_| CalendarError::InvalidState)?;

    let age = now - issued_at;
    if !(0..=STATE_MAX_AGE_SECS).contains(&age) {
        return Err(CalendarError::InvalidState);
    }

    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "state-secret";

    #[test]
    fn test_state_round_trip() {
        let user = Uuid::new_v4();
        let state = sign_state(user, 1_700_000_000, SECRET).unwrap();
        assert_eq!(verify_state(&state, SECRET, 1_700_000_060).unwrap(), user);
    }

    #[test]
    fn test_state_wrong_secret() {
        let state = sign_state(Uuid::new_v4(), 1_700_000_000, SECRET).unwrap();
        assert!(matches!(
            verify_state(&state, "other", 1_700_000_000),
            Err(CalendarError::InvalidState)
        ));
    }

    #[test]
    fn test_state_swapped_user_rejected() {
        let state = sign_state(Uuid::new_v4(), 1_700_000_000, SECRET).unwrap();
        let signature = state.rsplit('.').next().unwrap();
        let forged = format!("{}.1700000000.{}", Uuid::new_v4(), signature);
        assert!(verify_state(&forged, SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn test_state_expired() {
        let state = sign_state(Uuid::new_v4(), 1_700_000_000, SECRET).unwrap();
        assert!(verify_state(&state, SECRET, 1_700_000_000 + STATE_MAX_AGE_SECS + 1).is_err());
        // issued in the future
        assert!(verify_state(&state, SECRET, 1_699_999_000).is_err());
    }

    #[test]
    fn test_state_garbage() {
        for state in ["", "abc", "not-a-uuid.1.00", "a.b.c.d"] {
            assert!(verify_state(state, SECRET, 0).is_err());
        }
    }
}
