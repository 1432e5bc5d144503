//! Authentication module for Bookwell

pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub(crate) use middleware::TokenCache;
pub use middleware::{
    decode_supabase_jwt, require_auth, AuthError, AuthMethod, AuthState, AuthUser,
    SupabaseClaims, AUTH_COOKIE,
};
