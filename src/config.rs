// Configuration comes from the environment so the gateway can run in a
// container without a config file.
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub app_base_url: String,
    pub ai_backend_url: String,
    pub cors_origins: Vec<String>,
    pub temp_dir: PathBuf,
    pub auth_dir: PathBuf,
    pub db_url: String,
    pub log_level: String,
    pub developer_jid: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            app_base_url: "http://localhost:3000".to_string(),
            ai_backend_url: "http://localhost:8000".to_string(),
            cors_origins: vec!["*".to_string()],
            temp_dir: PathBuf::from("/tmp/wwebjs"),
            auth_dir: PathBuf::from(".wwebjs_auth"),
            db_url: String::new(),
            log_level: "info".to_string(),
            developer_jid: "6281234567890@c.us".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env_str("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(defaults.port);
        let cors_origins = env_str("CORS_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|items: &Vec<String>| !items.is_empty())
            .unwrap_or(defaults.cors_origins);
        let auth_dir = env_str("WWEBJS_AUTH_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.auth_dir);
        Self {
            port,
            app_base_url: env_str("APP_BASE_URL").unwrap_or(defaults.app_base_url),
            ai_backend_url: env_str("AI_BACKEND_URL").unwrap_or(defaults.ai_backend_url),
            cors_origins,
            temp_dir: env_str("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            auth_dir: absolutize(&auth_dir),
            db_url: env_str("DB_URL").unwrap_or(defaults.db_url),
            log_level: env_str("LOG_LEVEL")
                .map(|value| value.to_lowercase())
                .unwrap_or(defaults.log_level),
            developer_jid: env_str("DEVELOPER_JID").unwrap_or(defaults.developer_jid),
        }
    }

    /// Auth store directory for one agent. The chat client owns the tree
    /// below it; the supervisor only creates and removes the directory
    /// itself.
    pub fn agent_auth_dir(&self, agent_id: &str) -> PathBuf {
        self.auth_dir.join(format!("session-{agent_id}"))
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
