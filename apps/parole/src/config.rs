use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Shared secret controllers must present; refusing to start without one
    /// is handled by the caller.
    pub auth_secret: Option<String>,
    /// Prefix for every key the relay writes to the durable store.
    pub namespace: String,
    pub shutdown_grace_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PAROLE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4025),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            auth_secret: env::var("PAROLE_AUTH").ok().filter(|s| !s.is_empty()),
            namespace: env::var("PAROLE_NAMESPACE").unwrap_or_else(|_| "parole".to_string()),
            shutdown_grace_seconds: env::var("PAROLE_SHUTDOWN_GRACE")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4025,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            auth_secret: None,
            namespace: "parole".to_string(),
            shutdown_grace_seconds: 5,
        }
    }
}
