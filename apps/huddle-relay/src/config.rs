use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("HUDDLE_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            bind: env::var("HUDDLE_RELAY_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".to_string(),
        }
    }
}
