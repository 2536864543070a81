//! HTTP liveness check for the canary site after a core switch.

use std::time::Duration;

use tracing::debug;

use crate::error::{FleetError, Result};

pub trait SiteProbe {
    /// Ok when the site answers with a status below 500.
    fn probe(&self, domain: &str, ssl: bool) -> Result<u16>;
}

pub struct HttpProbe {
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| FleetError::Runtime(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl SiteProbe for HttpProbe {
    fn probe(&self, domain: &str, ssl: bool) -> Result<u16> {
        let url = probe_url(domain, ssl);
        let status = self
            .client
            .get(&url)
            .send()
            .map_err(|e| FleetError::CanaryFailed {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?
            .status()
            .as_u16();
        debug!(url = %url, status, "probed site");
        check_status(domain, status)
    }
}

pub fn probe_url(domain: &str, ssl: bool) -> String {
    let scheme = if ssl { "https" } else { "http" };
    format!("{scheme}://{domain}/")
}

/// Redirects and client errors still prove PHP and core load; only 5xx fails.
pub fn check_status(domain: &str, status: u16) -> Result<u16> {
    if status < 500 {
        Ok(status)
    } else {
        Err(FleetError::CanaryFailed {
            domain: domain.to_string(),
            reason: format!("HTTP {status}"),
        })
    }
}
