use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use url::Url;

/// Hosts that are always trusted as stream or redirect targets.
const DEFAULT_ALLOWED_HOSTS: &[&str] = &["youtube.com", "googlevideo.com", "ytimg.com"];

/// Set of hostnames trusted as redirect/stream targets for one request.
///
/// Built fresh per validation call from the static defaults plus the
/// configured provider and tunnel hosts, so configuration changes are
/// picked up without any shared mutable state.
pub struct AllowedHostSet {
    hosts: Vec<String>,
    allow_insecure_http: bool,
}

impl AllowedHostSet {
    pub fn for_request(config: &AppConfig) -> Self {
        let mut hosts: Vec<String> = DEFAULT_ALLOWED_HOSTS
            .iter()
            .map(|h| h.to_string())
            .collect();

        if let Some(host) = config.provider_host() {
            hosts.push(host);
        }
        if let Some(tunnel) = &config.provider.tunnel_host {
            hosts.push(tunnel.clone());
        }

        Self {
            hosts,
            allow_insecure_http: config.provider.allow_insecure_http,
        }
    }

    pub fn from_hosts(hosts: Vec<String>, allow_insecure_http: bool) -> Self {
        Self {
            hosts,
            allow_insecure_http,
        }
    }

    /// Validates scheme and host. Called before the first request and
    /// again after every redirect hop.
    pub fn validate(&self, url: &Url) -> Result<()> {
        match url.scheme() {
            "https" => {}
            "http" if self.allow_insecure_http => {}
            scheme => {
                return Err(AppError::InvalidTarget(format!(
                    "scheme '{}' is not allowed for {}",
                    scheme, url
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| AppError::InvalidTarget(format!("URL has no host: {}", url)))?;

        if self.host_allowed(host) {
            Ok(())
        } else {
            Err(AppError::InvalidTarget(format!(
                "host '{}' is not on the allow-list",
                host
            )))
        }
    }

    fn host_allowed(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.hosts
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }
}
