use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct CachingConfig {
    /// Directory for the persistent cache database. When unset, the cache
    /// lives in memory and is lost on exit.
    pub db_path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout in seconds. Zero disables the timeout.
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> HttpConfig {
        HttpConfig {
            timeout_secs: 30,
            user_agent: None,
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder().referer(false);

        if self.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(self.timeout_secs));
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build()
    }
}

pub fn validate_config(cfg: &Config) -> bool {
    if let Some(user_agent) = &cfg.http.user_agent {
        if user_agent.is_empty() {
            return false;
        }
    }

    if let Some(db_path) = &cfg.caching.db_path {
        if db_path.as_str().is_empty() {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_when_sections_missing() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.caching.db_path.is_none());
        assert_eq!(cfg.http.timeout_secs, 30);
        assert!(validate_config(&cfg));
    }

    #[test]
    fn parses_full_config() {
        let cfg: Config = toml::from_str(
            r#"
            [caching]
            db_path = "/var/cache/rangeloader"

            [http]
            timeout_secs = 10
            user_agent = "rangeloader/0.1"
            "#,
        )
        .unwrap();

        assert_eq!(
            cfg.caching.db_path.as_deref().map(|p| p.as_str()),
            Some("/var/cache/rangeloader")
        );
        assert_eq!(cfg.http.timeout_secs, 10);
        assert_eq!(cfg.http.user_agent.as_deref(), Some("rangeloader/0.1"));
        assert!(validate_config(&cfg));
    }

    #[test]
    fn rejects_empty_user_agent() {
        let cfg: Config = toml::from_str("[http]\nuser_agent = \"\"\n").unwrap();
        assert!(!validate_config(&cfg));
    }
}
