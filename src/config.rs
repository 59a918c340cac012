//! Application configuration loaded from environment variables.
//!
//! - `HOST` - Bind address (default: 0.0.0.0)
//! - `PORT` - Listen port (default: 5000)
//! - `DEBUG` - `True` enables debug logging (default: False)
//! - `SECRET_KEY` - Session signing secret, at least 32 bytes (default: random per process)
//! - `SECURE_COOKIES` - Send the session cookie only over https (default: false)
//! - `USERS_FILE` - Path of the user database document (default: users.json)
//! - `STATIC_DIR` - Static file root; QR images live in `qrcodes/` below it (default: static)
//! - `FRAME_ANCESTORS` - CSP `frame-ancestors` sources (default: 'self' https://whop.com)
//! - `PUBLIC_URL` - Base URL encoded into upload QR codes (default: the request's host URL)

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use secrecy::SecretString;
use thiserror::Error;

const MIN_SECRET_KEY_LENGTH: usize = 32;

pub const DEFAULT_FRAME_ANCESTORS: &str = "'self' https://whop.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub debug: bool,
    /// Session signing secret. A random key is generated when unset.
    pub secret_key: Option<SecretString>,
    pub secure_cookies: bool,
    pub users_file: PathBuf,
    pub static_dir: PathBuf,
    pub frame_ancestors: String,
    pub public_url: Option<String>,
    pub bcrypt_cost: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 5000,
            debug: false,
            secret_key: None,
            secure_cookies: false,
            users_file: PathBuf::from("users.json"),
            static_dir: PathBuf::from("static"),
            frame_ancestors: DEFAULT_FRAME_ANCESTORS.to_owned(),
            public_url: None,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "True" | "true" | "1" => Ok(true),
        "False" | "false" | "0" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnvVar(
            name.to_owned(),
            format!("expected True or False, got {:?}", value),
        )),
    }
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(host) = var("HOST") {
            config.host = host
                .parse()
                .map_err(|e: std::net::AddrParseError| {
                    ConfigError::InvalidEnvVar("HOST".to_owned(), e.to_string())
                })?;
        }
        if let Some(port) = var("PORT") {
            config.port = port
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    ConfigError::InvalidEnvVar("PORT".to_owned(), e.to_string())
                })?;
        }
        if let Some(debug) = var("DEBUG") {
            config.debug = parse_bool("DEBUG", &debug)?;
        }
        if let Some(secure) = var("SECURE_COOKIES") {
            config.secure_cookies = parse_bool("SECURE_COOKIES", &secure)?;
        }
        if let Some(key) = var("SECRET_KEY") {
            if key.len() < MIN_SECRET_KEY_LENGTH {
                return Err(ConfigError::InsecureSecret(
                    "SECRET_KEY".to_owned(),
                    format!("must be at least {} bytes", MIN_SECRET_KEY_LENGTH),
                ));
            }
            config.secret_key = Some(SecretString::from(key));
        }
        if let Some(path) = var("USERS_FILE") {
            config.users_file = path.into();
        }
        if let Some(path) = var("STATIC_DIR") {
            config.static_dir = path.into();
        }
        if let Some(ancestors) = var("FRAME_ANCESTORS") {
            config.frame_ancestors = ancestors;
        }
        config.public_url = var("PUBLIC_URL")
            .filter(|url| !url.is_empty())
            .map(|url| {
                if url.ends_with('/') {
                    url
                } else {
                    url + "/"
                }
            });
        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn qr_dir(&self) -> PathBuf {
        self.static_dir.join("qrcodes")
    }

    pub fn content_security_policy(&self) -> String {
        format!("frame-ancestors {}", self.frame_ancestors)
    }
}
