use std::time::Duration;

use reqwest::Url;

use crate::config::MonitorConfig;
use crate::error::CoreError;

/// Connection parameters for a chain node's JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcConnection {
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_initial: Duration,
}

impl RpcConnection {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = MonitorConfig::default();
        Self {
            url: url.into(),
            user: None,
            pass: None,
            timeout: defaults.rpc_timeout(),
            max_retries: defaults.rpc_max_retries,
            retry_initial: defaults.rpc_retry_initial(),
        }
    }

    pub fn with_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    pub fn with_retry_policy(mut self, cfg: &MonitorConfig) -> Self {
        self.timeout = cfg.rpc_timeout();
        self.max_retries = cfg.rpc_max_retries;
        self.retry_initial = cfg.rpc_retry_initial();
        self
    }
}

pub(super) fn resolve_auth(
    user: Option<&str>,
    pass: Option<&str>,
) -> Result<Option<(String, String)>, CoreError> {
    match (user, pass) {
        (Some(u), Some(p)) => Ok(Some((u.to_owned(), p.to_owned()))),
        (None, None) => Ok(None),
        _ => Err(CoreError::InvalidData(
            "both rpc user and rpc pass must be set together".to_owned(),
        )),
    }
}

pub(super) fn parse_connection(connection: &str) -> Result<String, CoreError> {
    let parsed = Url::parse(connection).map_err(|e| {
        CoreError::InvalidData(format!(
            "invalid connection `{connection}`: expected HTTP(S) URL ({e})"
        ))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(connection.to_owned()),
        other => Err(CoreError::InvalidData(format!(
            "unsupported connection scheme `{other}`; expected http or https"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connection_http_url() {
        let parsed = parse_connection("http://127.0.0.1:8232").expect("should parse");
        assert_eq!(parsed, "http://127.0.0.1:8232");
    }

    #[test]
    fn parse_connection_invalid_scheme() {
        let err = parse_connection("ftp://example.com").expect_err("must reject ftp");
        assert!(err.to_string().contains("unsupported connection scheme"));
    }

    #[test]
    fn resolve_auth_rejects_partial_credentials() {
        let err = resolve_auth(Some("user"), None).expect_err("must reject partial auth");
        assert!(err.to_string().contains("must be set together"));
    }

    #[test]
    fn resolve_auth_accepts_user_and_pass() {
        let auth = resolve_auth(Some("alice"), Some("secret")).expect("auth must parse");
        assert_eq!(auth, Some(("alice".to_owned(), "secret".to_owned())));
    }
}
