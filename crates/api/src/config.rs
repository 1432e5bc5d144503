//! Server configuration loaded from the environment

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Google OAuth client used for calendar sync
#[derive(Debug, Clone)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub app_base_url: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    /// HS256 secret for verifying Supabase access tokens locally
    pub supabase_jwt_secret: String,
    pub cron_secret: String,
    pub oauth_state_secret: String,
    pub google: Option<GoogleOAuthConfig>,
    pub allowed_origins: Vec<String>,
    pub enable_billing: bool,
    pub run_migrations: bool,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::Invalid {
                key,
                reason: format!("expected a boolean, got {:?}", other),
            }),
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let supabase_url = optional("SUPABASE_URL").unwrap_or_default();
        let supabase_jwt_secret = optional("SUPABASE_JWT_SECRET").unwrap_or_default();
        if supabase_url.is_empty() && supabase_jwt_secret.is_empty() {
            return Err(ConfigError::Missing("SUPABASE_JWT_SECRET"));
        }

        let google = match (
            optional("GOOGLE_CLIENT_ID"),
            optional("GOOGLE_CLIENT_SECRET"),
            optional("GOOGLE_REDIRECT_URI"),
        ) {
            (Some(client_id), Some(client_secret), Some(redirect_uri)) => Some(GoogleOAuthConfig {
                client_id,
                client_secret,
                redirect_uri,
            }),
            (None, None, None) => None,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "GOOGLE_CLIENT_ID",
                    reason: "GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET and GOOGLE_REDIRECT_URI must be set together"
                        .to_string(),
                })
            }
        };

        let oauth_state_secret = match (&google, optional("OAUTH_STATE_SECRET")) {
            (_, Some(secret)) => secret,
            (Some(_), None) => return Err(ConfigError::Missing("OAUTH_STATE_SECRET")),
            (None, None) => String::new(),
        };

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            app_base_url: optional("APP_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            supabase_anon_key: optional("SUPABASE_ANON_KEY").unwrap_or_default(),
            supabase_jwt_secret,
            cron_secret: required("CRON_SECRET")?,
            oauth_state_secret,
            google,
            allowed_origins,
            enable_billing: flag("ENABLE_BILLING", true)?,
            run_migrations: flag("RUN_MIGRATIONS", false)?,
        })
    }

    /// Static error page the browser is sent to when a redirect flow fails
    pub fn error_redirect(&self, reason: &str) -> String {
        format!("{}/error?reason={}", self.app_base_url, reason)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/bookwell_test".to_string(),
        bind_address: "127.0.0.1:0".to_string(),
        app_base_url: "https://app.example.com".to_string(),
        supabase_url: String::new(),
        supabase_anon_key: String::new(),
        supabase_jwt_secret: "test-jwt-secret".to_string(),
        cron_secret: "cron-secret".to_string(),
        oauth_state_secret: "state-secret".to_string(),
        google: None,
        allowed_origins: vec![],
        enable_billing: false,
        run_migrations: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "DATABASE_URL",
        "CRON_SECRET",
        "SUPABASE_URL",
        "SUPABASE_JWT_SECRET",
        "GOOGLE_CLIENT_ID",
        "GOOGLE_CLIENT_SECRET",
        "GOOGLE_REDIRECT_URI",
        "OAUTH_STATE_SECRET",
        "APP_BASE_URL",
        "ENABLE_BILLING",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    fn set_minimum() {
        env::set_var("DATABASE_URL", "postgres://localhost/bookwell");
        env::set_var("CRON_SECRET", "s3cret");
        env::set_var("SUPABASE_JWT_SECRET", "jwt");
    }

    #[test]
    #[serial]
    fn test_minimum_config() {
        clear();
        set_minimum();
        env::set_var("APP_BASE_URL", "https://bookwell.app/");

        let config = Config::from_env().unwrap();
        assert_eq!(config.app_base_url, "https://bookwell.app");
        assert!(config.google.is_none());
        assert!(config.enable_billing);
        assert_eq!(
            config.error_redirect("stripe_return"),
            "https://bookwell.app/error?reason=stripe_return"
        );
        clear();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear();
        set_minimum();
        env::remove_var("DATABASE_URL");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
        clear();
    }

    #[test]
    #[serial]
    fn test_partial_google_config_rejected() {
        clear();
        set_minimum();
        env::set_var("GOOGLE_CLIENT_ID", "id");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid { .. })));
        clear();
    }

    #[test]
    #[serial]
    fn test_google_requires_state_secret() {
        clear();
        set_minimum();
        env::set_var("GOOGLE_CLIENT_ID", "id");
        env::set_var("GOOGLE_CLIENT_SECRET", "secret");
        env::set_var("GOOGLE_REDIRECT_URI", "https://api.example.com/calendar/callback");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("OAUTH_STATE_SECRET"))
        ));
        env::set_var("OAUTH_STATE_SECRET", "state");
        assert!(Config::from_env().unwrap().google.is_some());
        clear();
    }

    #[test]
    #[serial]
    fn test_invalid_flag() {
        clear();
        set_minimum();
        env::set_var("ENABLE_BILLING", "maybe");
        assert!(Config::from_env().is_err());
        clear();
    }
}
