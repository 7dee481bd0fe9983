use crate::config::ReputationSettings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    #[error("invalid reputation endpoint: {0}")]
    Endpoint(String),
    #[error("reputation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected reputation response `{0}`")]
    Response(String),
    #[error("reputation service reported error code {0}")]
    Lookup(f64),
}

/// Proxy/VPN reputation lookups.
///
/// The first failed lookup switches the checker off for the rest of the
/// process lifetime; it has to be re-enabled by restarting the daemon.
#[derive(Debug)]
pub struct ReputationChecker {
    settings: ReputationSettings,
    client: reqwest::Client,
    enabled: AtomicBool,
}

impl ReputationChecker {
    pub fn new(settings: ReputationSettings) -> Result<Self, ReputationError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gamehost/", env!("CARGO_PKG_VERSION")))
            .timeout(LOOKUP_TIMEOUT)
            .build()?;
        let enabled = AtomicBool::new(settings.enabled);
        Ok(Self {
            settings,
            client,
            enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn lookup_url(&self, ip: &str) -> Result<reqwest::Url, ReputationError> {
        let mut params = vec![("ip", ip), ("contact", self.settings.contact.as_str())];
        if self.settings.minimum >= 1.0 {
            params.push(("flags", "m"));
        }
        reqwest::Url::parse_with_params(&self.settings.endpoint, &params)
            .map_err(|e| ReputationError::Endpoint(e.to_string()))
    }

    /// Whether `ip` should be banned as a proxy. Any failure disables the
    /// checker and reports `false`.
    pub async fn should_ban(&self, ip: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.lookup(ip).await {
            Ok(score) => score >= self.settings.minimum,
            Err(e) => {
                self.disable();
                tracing::warn!(%ip, error = %e, "reputation lookup failed, disabling proxy checks");
                false
            }
        }
    }

    async fn lookup(&self, ip: &str) -> Result<f64, ReputationError> {
        let url = self.lookup_url(ip)?;
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_score(&body)
    }
}

/// Scores are in `0.0..=1.0`; negative values are service error codes.
pub fn parse_score(body: &str) -> Result<f64, ReputationError> {
    let score: f64 = body
        .trim()
        .parse()
        .map_err(|_| ReputationError::Response(body.trim().to_string()))?;
    if score < 0.0 {
        return Err(ReputationError::Lookup(score));
    }
    Ok(score)
}
