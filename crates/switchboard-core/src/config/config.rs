use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the database and the default YAML files.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_db_filename")]
    pub db_filename: String,
    /// Users file; defaults to `<data_path>/users.yaml`.
    #[serde(default)]
    pub users_file: Option<PathBuf>,
    #[serde(default)]
    pub jwt_secret_key: Option<String>,
    #[serde(default)]
    pub jwt_secret_file: Option<PathBuf>,
    /// System prompts file; defaults to `<data_path>/system_prompts.yaml`.
    #[serde(default)]
    pub system_prompts_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Ephemeral mode: in-memory admin user and a fresh secret per run.
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default = "default_model_base_url")]
    pub model_base_url: String,
    #[serde(default)]
    pub model_api_key: String,
}

fn default_data_path() -> PathBuf {
    PathBuf::from(std::env::var("DATA_PATH").unwrap_or_else(|_| ".".to_string()))
}

fn default_db_filename() -> String {
    std::env::var("DB_FILENAME").unwrap_or_else(|_| "switchboard.db".to_string())
}

fn default_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn default_host() -> String {
    std::env::var("SWITCHBOARD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("SWITCHBOARD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_model_base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            db_filename: default_db_filename(),
            users_file: None,
            jwt_secret_key: None,
            jwt_secret_file: None,
            system_prompts_file: None,
            log_level: default_log_level(),
            host: default_host(),
            port: default_port(),
            ephemeral: false,
            model_base_url: default_model_base_url(),
            model_api_key: String::new(),
        }
    }
}

impl AppConfig {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            users_file: std::env::var("USERS_FILE").ok().map(PathBuf::from),
            jwt_secret_key: std::env::var("JWT_SECRET_KEY").ok().filter(|s| !s.is_empty()),
            jwt_secret_file: std::env::var("JWT_SECRET_FILE").ok().map(PathBuf::from),
            system_prompts_file: std::env::var("SYSTEM_PROMPTS_FILE").ok().map(PathBuf::from),
            ephemeral: std::env::var("SWITCHBOARD_MODE")
                .map(|m| m.eq_ignore_ascii_case("ephemeral"))
                .unwrap_or(false),
            model_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_path.join(&self.db_filename)
    }

    pub fn users_path(&self) -> PathBuf {
        self.users_file
            .clone()
            .unwrap_or_else(|| self.data_path.join("users.yaml"))
    }

    pub fn prompts_path(&self) -> PathBuf {
        self.system_prompts_file
            .clone()
            .unwrap_or_else(|| self.data_path.join("system_prompts.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_follow_data_dir() {
        let config = AppConfig {
            data_path: PathBuf::from("/srv/data"),
            db_filename: "chat.db".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/srv/data/chat.db"));
        assert_eq!(config.users_path(), PathBuf::from("/srv/data/users.yaml"));
        assert_eq!(
            config.prompts_path(),
            PathBuf::from("/srv/data/system_prompts.yaml")
        );
    }

    #[test]
    fn explicit_files_override_defaults() {
        let config = AppConfig {
            users_file: Some(PathBuf::from("/etc/sb/users.yaml")),
            system_prompts_file: Some(PathBuf::from("/etc/sb/prompts.yaml")),
            ..AppConfig::default()
        };
        assert_eq!(config.users_path(), PathBuf::from("/etc/sb/users.yaml"));
        assert_eq!(config.prompts_path(), PathBuf::from("/etc/sb/prompts.yaml"));
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = AppConfig::default();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: AppConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.db_filename, config.db_filename);
        assert_eq!(decoded.port, config.port);
    }
}
