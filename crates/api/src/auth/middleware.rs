//! Authentication middleware for Axum
//!
//! Practitioners sign in through Supabase. Access tokens are verified locally
//! with the project's JWT secret when it is configured, otherwise by calling
//! the Supabase Auth API (results cached briefly).

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cache Supabase API verification results for 60 seconds
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Oldest entries are evicted past this size
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Cookie set by the web app for SPA requests
pub const AUTH_COOKIE: &str = "bookwell_auth_token";

const SUPABASE_AUDIENCE: &str = "authenticated";

#[derive(Clone, Debug)]
pub(crate) struct CachedSupabaseAuth {
    user: SupabaseUserResponse,
    cached_at: Instant,
}

pub(crate) type TokenCache = Arc<RwLock<HashMap<String, CachedSupabaseAuth>>>;

/// Authenticated practitioner
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthMethod {
    /// Token verified locally against the Supabase JWT secret
    SupabaseJwt,
    /// Token verified by the Supabase Auth API
    SupabaseApi,
}

/// Claims carried by a Supabase access token
#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseClaims {
    pub sub: String,
    pub email: Option<String>,
    pub exp: usize,
    #[serde(default)]
    pub role: Option<String>,
}

/// Response from Supabase /auth/v1/user endpoint
#[derive(Debug, Clone, Deserialize)]
struct SupabaseUserResponse {
    id: String,
    email: Option<String>,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub pool: PgPool,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub jwt_secret: String,
    pub http_client: Client,
    pub(crate) token_cache: TokenCache,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|c| c.strip_prefix(AUTH_COOKIE)?.strip_prefix('='))
                .map(String::from)
        })
}

/// Bearer token from the Authorization header, falling back to the auth cookie
pub(crate) fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Verify a Supabase access token signed with the project secret
pub fn decode_supabase_jwt(token: &str, secret: &str) -> Result<SupabaseClaims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[SUPABASE_AUDIENCE]);

    decode::<SupabaseClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!(error = %e, "Supabase JWT rejected");
            AuthError::InvalidToken
        })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate(&auth_state, &token).await,
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                auth_method = ?auth_user.auth_method,
                "Authenticated request"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "Authentication failed");
            err.into_response()
        }
    }
}

async fn authenticate(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let (user_id, email, auth_method) = if !auth_state.jwt_secret.is_empty() {
        let claims = decode_supabase_jwt(token, &auth_state.jwt_secret)?;
        (claims.sub, claims.email, AuthMethod::SupabaseJwt)
    } else if !auth_state.supabase_url.is_empty() {
        let user = verify_supabase_token_via_api(auth_state, token).await?;
        (user.id, user.email, AuthMethod::SupabaseApi)
    } else {
        tracing::error!("No Supabase verification configured");
        return Err(AuthError::Internal("authentication not configured".to_string()));
    };

    let user_id = Uuid::parse_str(&user_id).map_err(|_| AuthError::InvalidToken)?;

    ensure_user_exists(&auth_state.pool, user_id, email.as_deref())
        .await
        .map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Failed to ensure user row exists");
            AuthError::DatabaseError
        })?;

    Ok(AuthUser {
        user_id,
        email,
        auth_method,
    })
}

async fn verify_supabase_token_via_api(
    auth_state: &AuthState,
    token: &str,
) -> Result<SupabaseUserResponse, AuthError> {
    if auth_state.supabase_anon_key.is_empty() {
        tracing::warn!("Supabase anon key not configured, cannot verify token via API");
        return Err(AuthError::InvalidToken);
    }

    {
        let cache = auth_state.token_cache.read().await;
        if let Some(cached) = cache.get(token) {
            if cached.cached_at.elapsed() < TOKEN_CACHE_TTL {
                return Ok(cached.user.clone());
            }
        }
    }

    let url = format!("{}/auth/v1/user", auth_state.supabase_url);
    let response = auth_state
        .http_client
        .get(&url)
        .header("apikey", &auth_state.supabase_anon_key)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to reach Supabase for token verification");
            AuthError::InvalidToken
        })?;

    if !response.status().is_success() {
        tracing::warn!(status = %response.status(), "Supabase token verification failed");
        return Err(AuthError::InvalidToken);
    }

    let user = response
        .json::<SupabaseUserResponse>()
        .await
        .map_err(|_| AuthError::InvalidToken)?;

    let mut cache = auth_state.token_cache.write().await;
    if cache.len() >= MAX_CACHE_ENTRIES {
        if let Some(oldest_key) = cache
            .iter()
            .min_by_key(|(_, v)| v.cached_at)
            .map(|(k, _)| k.clone())
        {
            cache.remove(&oldest_key);
        }
    }
    cache.insert(
        token.to_string(),
        CachedSupabaseAuth {
            user: user.clone(),
            cached_at: Instant::now(),
        },
    );

    Ok(user)
}

/// Practitioners sign up through Supabase; mirror them into `users` on first request
async fn ensure_user_exists(
    pool: &PgPool,
    user_id: Uuid,
    email: Option<&str>,
) -> Result<(), sqlx::Error> {
    match email {
        Some(email) => {
            sqlx::query(
                "INSERT INTO users (id, email) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
            )
            .bind(user_id)
            .bind(email)
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_one(pool)
                .await?;
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Database error")]
    DatabaseError,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::DatabaseError | AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
