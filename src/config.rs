use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_JWT_SECRET: &str = "change-me";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    File,
    Document,
}

impl StorageBackend {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" | "files" | "json" => Ok(Self::File),
            "document" | "documents" => Ok(Self::Document),
            _ => Err(anyhow::anyhow!(
                "STORAGE_BACKEND must be one of: file, document"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_backend: StorageBackend,
    pub data_dir: PathBuf,
    pub database_name: String,
    pub jwt_secret: String,
    pub jwt_ttl_minutes: i64,
    pub auth_required: bool,
    pub admin_email: String,
    pub admin_password: String,
    pub id_retry_limit: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let host = env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("APP_PORT must be a valid u16")?;

        let storage_backend = StorageBackend::parse(
            &env::var("STORAGE_BACKEND").unwrap_or_else(|_| "file".to_string()),
        )?;

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        let database_name = env::var("DATABASE_NAME").unwrap_or_else(|_| "brokercrm".to_string());

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_string());
        let jwt_ttl_minutes = env::var("JWT_TTL_MINUTES")
            .unwrap_or_else(|_| "480".to_string())
            .parse::<i64>()
            .context("JWT_TTL_MINUTES must be a valid integer")?;

        let auth_required = parse_flag(
            &env::var("AUTH_REQUIRED").unwrap_or_else(|_| "true".to_string()),
        )
        .context("AUTH_REQUIRED must be true or false")?;

        let admin_email =
            env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@brokercrm.local".to_string());
        let admin_password =
            env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "adminpass".to_string());

        let id_retry_limit = env::var("ID_RETRY_LIMIT")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<usize>()
            .context("ID_RETRY_LIMIT must be a valid usize")?;

        Ok(Self {
            host,
            port,
            storage_backend,
            data_dir,
            database_name,
            jwt_secret,
            jwt_ttl_minutes,
            auth_required,
            admin_email,
            admin_password,
            id_retry_limit,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Tokens signed with a blank or shipped secret can be forged by anyone.
    pub fn has_insecure_jwt_secret(&self) -> bool {
        let secret = self.jwt_secret.trim();
        secret.is_empty() || secret == DEFAULT_JWT_SECRET
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("unrecognised flag value `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_are_case_insensitive() {
        assert_eq!(StorageBackend::parse("File").unwrap(), StorageBackend::File);
        assert_eq!(StorageBackend::parse(" Document ").unwrap(), StorageBackend::Document);
        assert!(StorageBackend::parse("postgres").is_err());
        assert!(StorageBackend::parse("mongodb").is_err());
    }

    fn config_with_secret(secret: &str) -> AppConfig {
        AppConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            storage_backend: StorageBackend::File,
            data_dir: PathBuf::from("data"),
            database_name: "brokercrm".to_string(),
            jwt_secret: secret.to_string(),
            jwt_ttl_minutes: 60,
            auth_required: true,
            admin_email: "admin@example.com".to_string(),
            admin_password: "adminpass".to_string(),
            id_retry_limit: 5,
        }
    }

    #[test]
    fn shipped_or_blank_jwt_secret_is_insecure() {
        assert!(config_with_secret(DEFAULT_JWT_SECRET).has_insecure_jwt_secret());
        assert!(config_with_secret("  ").has_insecure_jwt_secret());
        assert!(!config_with_secret("4f9c0d1e-rotated").has_insecure_jwt_secret());
        assert_eq!(config_with_secret("x").address(), "127.0.0.1:8080");
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(!parse_flag("off").unwrap());
        assert!(parse_flag("maybe").is_err());
    }
}
