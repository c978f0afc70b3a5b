use anyhow::{Context, Result};
use exchange_core::SearchOptions;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_ADMIN_PASSWORD: &str = "changeme";
pub const DEFAULT_STEP_BUDGET: u64 = 1_000_000;

/// Service configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub persist_path: Option<PathBuf>,
    pub admin_password: String,
    /// `None` lets a global run search without limit.
    pub step_budget: Option<u64>,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            persist_path: None,
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            step_budget: Some(DEFAULT_STEP_BUDGET),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match var("PORT") {
            Some(raw) => raw.parse().context("PORT must be a valid port number")?,
            None => defaults.port,
        };
        let step_budget = match var("MATCH_STEP_BUDGET") {
            Some(raw) => {
                let budget: u64 = raw
                    .parse()
                    .context("MATCH_STEP_BUDGET must be a non-negative integer")?;
                (budget > 0).then_some(budget)
            }
            None => defaults.step_budget,
        };

        Ok(Self {
            port,
            persist_path: var("PERSIST_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            admin_password: var("ADMIN_PASSWORD").unwrap_or(defaults.admin_password),
            step_budget,
            log_json: var("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    pub fn search_options(&self) -> SearchOptions {
        let options = SearchOptions::default();
        match self.step_budget {
            Some(budget) => options.with_max_steps(budget),
            None => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        assert_eq!(load(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_every_setting() {
        let config = load(&[
            ("PORT", "8081"),
            ("PERSIST_PATH", "/tmp/exchange.json"),
            ("ADMIN_PASSWORD", "s3cret"),
            ("MATCH_STEP_BUDGET", "500"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.persist_path, Some(PathBuf::from("/tmp/exchange.json")));
        assert_eq!(config.admin_password, "s3cret");
        assert_eq!(config.search_options().max_steps, Some(500));
        assert!(config.log_json);
    }

    #[test]
    fn zero_budget_means_unbounded() {
        let config = load(&[("MATCH_STEP_BUDGET", "0")]).unwrap();
        assert_eq!(config.step_budget, None);
        assert_eq!(config.search_options().max_steps, None);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(load(&[("PORT", "eighty")]).is_err());
        assert!(load(&[("MATCH_STEP_BUDGET", "-1")]).is_err());
    }
}
