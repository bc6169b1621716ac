use serde::Deserialize;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_WORKSHEET: &str = "집행내역";

fn default_max_file_size() -> usize {
    // 10 MB in bytes
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upload_dir: PathBuf,
    pub rule_dir: PathBuf,
    /// Sheet every case workbook is read from and written to.
    pub worksheet_name: String,
    pub bind_addr: SocketAddr,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

impl Config {
    pub fn new() -> Result<Self> {
        // Load .env file first
        dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("AUDIT_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8000".to_string())
            .parse::<SocketAddr>()
            .context("AUDIT_BIND_ADDR is not a socket address")?;

        let max_file_size = match lookup("AUDIT_MAX_FILE_SIZE") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("AUDIT_MAX_FILE_SIZE is not a byte count: {}", raw))?,
            None => default_max_file_size(),
        };

        Ok(Config {
            upload_dir: lookup("AUDIT_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("Upload_file")),
            rule_dir: lookup("AUDIT_RULE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("Rule_file")),
            worksheet_name: lookup("AUDIT_WORKSHEET").unwrap_or_else(|| DEFAULT_WORKSHEET.to_string()),
            bind_addr,
            max_file_size,
        })
    }

    /// Creates the storage directories if they are missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.rule_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn load_config() -> Result<Config> {
    let config = Config::new()?;
    config.ensure_dirs()?;
    Ok(config)
}
