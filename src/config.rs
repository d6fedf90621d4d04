use std::env;
use std::path::PathBuf;

use anyhow::Context;

use crate::feed::{Credentials, RetsEndpoints};

pub struct Config {
    pub endpoints: RetsEndpoints,
    pub data_credentials: Credentials,
    pub active_credentials: Credentials,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} must be set"))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoints: RetsEndpoints {
                login_url: required("RETS_LOGIN_URL")?,
                logout_url: required("RETS_LOGOUT_URL")?,
                search_url: required("RETS_SEARCH_URL")?,
                metadata_url: required("RETS_METADATA_URL")?,
                object_url: required("RETS_OBJECT_URL")?,
                rets_version: optional("RETS_VERSION").unwrap_or_else(|| "RETS/1.7".into()),
                user_agent: optional("RETS_USER_AGENT")
                    .unwrap_or_else(|| concat!("listing-sync/", env!("CARGO_PKG_VERSION")).into()),
            },
            data_credentials: Credentials::new(
                required("RETS_DATA_USERNAME")?,
                required("RETS_DATA_PASSWORD")?,
            ),
            active_credentials: Credentials::new(
                required("RETS_ACTIVE_USERNAME")?,
                required("RETS_ACTIVE_PASSWORD")?,
            ),
            data_dir: optional("DATA_DIR").unwrap_or_else(|| "Data".into()).into(),
            database_url: optional("DATABASE_URL"),
        })
    }
}
