use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub server_id: String,
    pub environment: String,
    pub database_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_expiry: Duration,
    pub cors_origins: Vec<String>,
    pub ws_heartbeat_interval: Duration,
    pub ws_connection_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_cleanup_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            server_id: "server-1".to_string(),
            environment: "development".to_string(),
            database_path: PathBuf::from("courier.db"),
            jwt_secret: "change-this-secret".to_string(),
            jwt_expiry: Duration::from_secs(24 * 60 * 60),
            cors_origins: vec!["http://localhost:5173".to_string()],
            ws_heartbeat_interval: Duration::from_secs(30),
            ws_connection_timeout: Duration::from_secs(5 * 60),
            cache_ttl: Duration::from_secs(5 * 60),
            cache_cleanup_interval: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(parsed) => config.port = parsed,
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, using default"),
            }
        }

        if let Ok(id) = std::env::var("SERVER_ID") {
            config.server_id = id;
        }

        if let Ok(env) = std::env::var("ENVIRONMENT") {
            config.environment = env;
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                config.jwt_secret = secret;
            }
        }

        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            let parsed: Vec<String> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !parsed.is_empty() {
                config.cors_origins = parsed;
            }
        }

        duration_var("JWT_EXPIRY", &mut config.jwt_expiry);
        duration_var("WS_HEARTBEAT_INTERVAL", &mut config.ws_heartbeat_interval);
        duration_var("WS_CONNECTION_TIMEOUT", &mut config.ws_connection_timeout);
        duration_var("CACHE_TTL", &mut config.cache_ttl);
        duration_var("CACHE_CLEANUP_INTERVAL", &mut config.cache_cleanup_interval);
        duration_var("SWEEP_INTERVAL", &mut config.sweep_interval);

        config
    }
}

fn duration_var(name: &str, target: &mut Duration) {
    if let Ok(value) = std::env::var(name) {
        match parse_duration(&value) {
            Some(parsed) => *target = parsed,
            None => tracing::warn!(%name, %value, "Invalid duration, using default"),
        }
    }
}

/// Parse `500ms`, `30s`, `5m`, `24h` or a plain number of seconds.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }
    s.parse().ok().map(Duration::from_secs)
}
