use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::models::DocumentType;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 50_000_000;
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-3.5-turbo";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

/// Runtime settings, built once at startup and handed to the services that
/// need them.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub database_url: String,
    pub upload_dir: PathBuf,
    pub max_file_size: u64,
    pub allowed_file_types: Vec<DocumentType>,
    pub allowed_origins: Vec<String>,
    /// `None` when no API key is set; generation endpoints are then disabled.
    pub llm: Option<LlmConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 8000,
            database_url: "sqlite://study.db?mode=rwc".to_string(),
            upload_dir: PathBuf::from("./uploads"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_file_types: DocumentType::ALL.to_vec(),
            allowed_origins: Vec::new(),
            llm: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let host = var("HOST")
            .and_then(|value| value.parse::<IpAddr>().ok())
            .unwrap_or(defaults.host);

        let port = var("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(defaults.port);

        let database_url = var("DATABASE_URL").unwrap_or(defaults.database_url);

        let upload_dir = var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);

        let max_file_size = var("MAX_FILE_SIZE")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(defaults.max_file_size);

        let allowed_file_types = match var("ALLOWED_FILE_TYPES") {
            Some(list) => split_list(&list)
                .filter_map(|ext| {
                    let parsed = ext.trim_start_matches('.').parse::<DocumentType>();
                    if parsed.is_err() {
                        log::warn!("ignoring unknown file type in ALLOWED_FILE_TYPES: {}", ext);
                    }
                    parsed.ok()
                })
                .collect(),
            None => defaults.allowed_file_types,
        };

        let allowed_origins = var("ALLOWED_ORIGINS")
            .map(|list| split_list(&list).map(str::to_string).collect())
            .unwrap_or_default();

        let llm = var("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .map(|api_key| LlmConfig {
                api_key,
                base_url: var("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
                model: var("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            });

        Self {
            host,
            port,
            database_url,
            upload_dir,
            max_file_size,
            allowed_file_types,
            allowed_origins,
            llm,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn accepts(&self, kind: DocumentType) -> bool {
        self.allowed_file_types.contains(&kind)
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|item| !item.is_empty())
}
