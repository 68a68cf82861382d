use std::time::Duration;

use url::Url;

use crate::error::TransportError;

/// Client configuration.
///
/// URLs come from the caller or the `MATCHWIRE_RELAY_URL` /
/// `MATCHWIRE_API_URL` environment overrides so deployments and tests stay
/// consistent without threading addresses through every call site.
#[derive(Debug, Clone)]
pub struct Config {
    relay_url: Url,
    api_url: Url,
    /// Delay before the single scheduled reconnect after an unexpected drop.
    pub reconnect_delay: Duration,
    /// Keep-alive ping cadence on the relay channel.
    pub keepalive_interval: Duration,
    /// Watchdog poll cadence while a session exists.
    pub watchdog_interval: Duration,
    /// Minimum spacing between recovery attempts.
    pub retry_delay: Duration,
    /// Session heartbeat cadence while connected (foreground).
    pub heartbeat_interval: Duration,
    /// Heartbeat cadence while the consuming UI is backgrounded.
    pub heartbeat_interval_hidden: Duration,
    /// Telemetry sampling cadence while connected.
    pub sample_interval: Duration,
    /// Bound on negotiation/recovery attempts per session.
    pub max_retries: u32,
    /// How long a single negotiation attempt may sit unanswered before the
    /// watchdog retries it.
    pub negotiation_timeout: Duration,
    /// How long to wait for a partner to come back before going terminal.
    pub partner_wait: Duration,
    /// Glare-avoidance jitter range before creating an offer.
    pub offer_jitter: (Duration, Duration),
}

impl Config {
    pub fn new(relay_url: impl AsRef<str>, api_url: impl AsRef<str>) -> Result<Self, TransportError> {
        let relay_url = parse_override("MATCHWIRE_RELAY_URL", relay_url.as_ref())?;
        let api_url = parse_override("MATCHWIRE_API_URL", api_url.as_ref())?;
        Ok(Self {
            relay_url,
            api_url,
            reconnect_delay: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(2),
            retry_delay: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_interval_hidden: Duration::from_secs(3),
            sample_interval: Duration::from_secs(5),
            max_retries: 5,
            negotiation_timeout: Duration::from_secs(10),
            partner_wait: Duration::from_secs(30),
            offer_jitter: (Duration::from_millis(500), Duration::from_millis(1500)),
        })
    }

    pub fn relay_url(&self) -> &Url {
        &self.relay_url
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_offer_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.offer_jitter = (min, max);
        self
    }
}

fn parse_override(env_key: &str, fallback: &str) -> Result<Url, TransportError> {
    resolve_url(env_key, std::env::var(env_key).ok(), fallback)
}

/// Override wins over the fallback; blank values are ignored; a bare
/// host:port gets an http scheme so `Url::parse` accepts it.
fn resolve_url(
    label: &str,
    override_value: Option<String>,
    fallback: &str,
) -> Result<Url, TransportError> {
    let raw = override_value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.trim().to_string());
    if raw.is_empty() {
        return Err(TransportError::InvalidUrl(format!(
            "{label} and fallback are both empty"
        )));
    }
    let raw = if raw.contains("://") {
        raw
    } else {
        format!("http://{raw}")
    };
    Url::parse(&raw).map_err(|err| TransportError::InvalidUrl(err.to_string()))
}
