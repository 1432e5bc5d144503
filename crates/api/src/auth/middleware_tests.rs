//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Token extraction from the Authorization header and the auth cookie
//! - Supabase JWT verification (valid, expired, wrong secret, wrong audience)
//! - Unauthenticated requests rejected before reaching handlers

#[cfg(test)]
mod tests {
    use super::super::middleware::*;
    use axum::{body::Body, http::StatusCode, response::IntoResponse};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use uuid::Uuid;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        email: Option<String>,
        aud: String,
        exp: usize,
        role: String,
    }

    fn now() -> usize {
        time::OffsetDateTime::now_utc().unix_timestamp() as usize
    }

    fn token(secret: &str, aud: &str, exp: usize) -> (Uuid, String) {
        let user_id = Uuid::new_v4();
        let claims = TestClaims {
            sub: user_id.to_string(),
            email: Some("practitioner@example.com".to_string()),
            aud: aud.to_string(),
            exp,
            role: "authenticated".to_string(),
        };
        let jwt = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        (user_id, jwt)
    }

    fn request_with(header: Option<(&str, String)>) -> axum::extract::Request {
        let mut builder = axum::http::Request::builder().uri("/bookings");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_token_from_header() {
        let request = request_with(Some(("Authorization", "Bearer abc.def.ghi".to_string())));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_bearer_token_from_cookie() {
        let request = request_with(Some((
            "Cookie",
            format!("theme=dark; {}=tok123; other=1", AUTH_COOKIE),
        )));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_cookie_name_must_match_exactly() {
        let request = request_with(Some((
            "Cookie",
            format!("{}_old=stale", AUTH_COOKIE),
        )));
        assert!(extract_bearer_token(&request).is_none());
    }

    #[test]
    fn test_no_token() {
        assert!(extract_bearer_token(&request_with(None)).is_none());
        let basic = request_with(Some(("Authorization", "Basic dXNlcjpwYXNz".to_string())));
        assert!(extract_bearer_token(&basic).is_none());
    }

    #[test]
    fn test_decode_valid_token() {
        let (user_id, jwt) = token(SECRET, "authenticated", now() + 3600);
        let claims = decode_supabase_jwt(&jwt, SECRET).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.email.as_deref(), Some("practitioner@example.com"));
    }

    #[test]
    fn test_decode_expired_token() {
        let (_, jwt) = token(SECRET, "authenticated", now() - 3600);
        assert!(matches!(
            decode_supabase_jwt(&jwt, SECRET),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_decode_wrong_secret() {
        let (_, jwt) = token("another-secret", "authenticated", now() + 3600);
        assert!(decode_supabase_jwt(&jwt, SECRET).is_err());
    }

    #[test]
    fn test_decode_wrong_audience() {
        let (_, jwt) = token(SECRET, "anon", now() + 3600);
        assert!(decode_supabase_jwt(&jwt, SECRET).is_err());
    }

    #[test]
    fn test_auth_error_responses() {
        assert_eq!(
            AuthError::MissingAuth.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::DatabaseError.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
