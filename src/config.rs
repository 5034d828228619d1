use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorSource {
    #[default]
    Mock,
    LocalGateway,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Cycle scheduling
    #[serde(default = "default_cycle_minutes")]
    pub cycle_minutes: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,

    // Outdoor location fallback when the site config has none
    #[serde(default)]
    pub home_lat: f64,
    #[serde(default)]
    pub home_lon: f64,

    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_api_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Static assets
    #[serde(default = "default_site_config_path")]
    pub site_config_path: String,
    #[serde(default = "default_sensor_mapping_path")]
    pub sensor_mapping_path: String,

    // Prompt history window
    #[serde(default = "default_history_rows")]
    pub history_rows: usize,
    #[serde(default)]
    pub history_max_minutes: Option<i64>,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    #[serde(default = "default_prompt_max_chars")]
    pub prompt_max_chars: usize,

    // Persistence
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_mirror_csv_path")]
    pub mirror_csv_path: String,
    #[serde(default = "default_sheet_sync_rows")]
    pub sheet_sync_rows: usize,

    // HTTP behavior
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_port")]
    pub port: u16,

    // Sensors
    #[serde(default)]
    pub sensor_source: SensorSource,
    #[serde(default)]
    pub sensor_gateway_url: Option<String>,
    #[serde(default = "default_mock_sensors_path")]
    pub mock_sensors_path: String,

    // Actuation
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    #[serde(default)]
    pub transom_webhook_url: Option<String>,
    #[serde(default)]
    pub transom_webhook_token: Option<String>,
    #[serde(default)]
    pub plug_webhook_url: Option<String>,
    #[serde(default)]
    pub plug_webhook_token: Option<String>,
}

fn default_cycle_minutes() -> u64 {
    5
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_llm_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_site_config_path() -> String {
    "./config/site.config.json".to_string()
}

fn default_sensor_mapping_path() -> String {
    "./config/sensors.mapping.json".to_string()
}

fn default_history_rows() -> usize {
    200
}

fn default_summary_max_chars() -> usize {
    1200
}

fn default_prompt_max_chars() -> usize {
    120_000
}

fn default_database_path() -> String {
    "comfortd.db".to_string()
}

fn default_mirror_csv_path() -> String {
    "comfortd.mirror.csv".to_string()
}

fn default_sheet_sync_rows() -> usize {
    2000
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_port() -> u16 {
    3000
}

fn default_mock_sensors_path() -> String {
    "./config/sensors.mock.json".to_string()
}

fn default_dry_run() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cycle_minutes: default_cycle_minutes(),
            timezone: default_timezone(),
            home_lat: 0.0,
            home_lon: 0.0,
            llm_api_url: default_llm_api_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            site_config_path: default_site_config_path(),
            sensor_mapping_path: default_sensor_mapping_path(),
            history_rows: default_history_rows(),
            history_max_minutes: None,
            summary_max_chars: default_summary_max_chars(),
            prompt_max_chars: default_prompt_max_chars(),
            database_path: default_database_path(),
            mirror_csv_path: default_mirror_csv_path(),
            sheet_sync_rows: default_sheet_sync_rows(),
            http_timeout_secs: default_http_timeout_secs(),
            port: default_port(),
            sensor_source: SensorSource::Mock,
            sensor_gateway_url: None,
            mock_sensors_path: default_mock_sensors_path(),
            dry_run: default_dry_run(),
            transom_webhook_url: None,
            transom_webhook_token: None,
            plug_webhook_url: None,
            plug_webhook_token: None,
        }
    }
}

impl AppConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("comfortd.toml")
    }

    /// Load config from comfortd.toml next to the executable, falling back
    /// to ./comfortd.toml, then to defaults plus env overrides.
    pub fn load() -> Self {
        for path in [Self::config_path(), PathBuf::from("comfortd.toml")] {
            if let Ok(contents) = fs::read_to_string(&path) {
                match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config.with_env_overrides();
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    /// Secrets and deployment toggles come from the environment so the toml
    /// file can be checked in.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }
        if let Ok(url) = env::var("COMFORTD_LLM_API_URL") {
            self.llm_api_url = url;
        }
        if let Ok(model) = env::var("COMFORTD_LLM_MODEL") {
            self.llm_model = model;
        }
        if let Ok(path) = env::var("COMFORTD_DATABASE_PATH") {
            self.database_path = path;
        }
        if let Ok(value) = env::var("COMFORTD_DRY_RUN") {
            self.dry_run = parse_bool_flag(&value);
        }
        if let Ok(port) = env::var("COMFORTD_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }
        if let Ok(url) = env::var("COMFORTD_TRANSOM_WEBHOOK_URL") {
            self.transom_webhook_url = Some(url);
        }
        if let Ok(token) = env::var("COMFORTD_TRANSOM_WEBHOOK_TOKEN") {
            self.transom_webhook_token = Some(token);
        }
        if let Ok(url) = env::var("COMFORTD_PLUG_WEBHOOK_URL") {
            self.plug_webhook_url = Some(url);
        }
        if let Ok(token) = env::var("COMFORTD_PLUG_WEBHOOK_TOKEN") {
            self.plug_webhook_token = Some(token);
        }
        self
    }
}

fn parse_bool_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}
