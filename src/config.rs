//! Configuration types for ensemble-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{EnsembleError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// FSM engine and scheduler configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-transport rate limits for DDNS signers.
    pub signers: SignersConfig,

    /// Provider API endpoints, keyed by provider.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// TLS trust for provider APIs.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Zone store seeding.
    #[serde(default)]
    pub store: StoreConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Validate the configuration, rejecting anything the daemon cannot
    /// start with. Called once by the binary before any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        self.signers.ddns.limits.validate("signers.ddns.limits")?;
        for (name, provider) in self.providers.configured() {
            provider.validate(name)?;
        }
        if self.tls.insecure && self.tls.root_ca_pem.is_some() {
            return Err(EnsembleError::Config(
                "tls.insecure and tls.root_ca_pem are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// FSM engine and auto-push scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between auto-push passes.
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,

    /// TTL for records this system publishes (CDS/CDNSKEY/CSYNC).
    #[serde(default = "default_record_ttl")]
    pub record_ttl: u32,

    /// Per-request timeout for DNS exchanges with signers, in seconds.
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: default_push_interval(),
            record_ttl: default_record_ttl(),
            dns_timeout_secs: default_dns_timeout(),
        }
    }
}

fn default_push_interval() -> u64 {
    30
}

fn default_record_ttl() -> u32 {
    300
}

fn default_dns_timeout() -> u64 {
    5
}

/// Rate-limit configuration for DDNS signers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignersConfig {
    /// Limits applied to the `rlddns` transport.
    pub ddns: TransportLimits,
}

/// Limits for one transport kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportLimits {
    /// Ops-per-minute caps for the fetch and update lanes.
    pub limits: RateLimits,
}

/// Ops-per-minute caps for the two lanes of one transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimits {
    /// Fetch lane cap, ops per minute. Required, > 0.
    pub fetch: u32,
    /// Update lane cap, ops per minute. Required, > 0.
    pub update: u32,
}

impl RateLimits {
    fn validate(&self, key: &str) -> Result<()> {
        if self.fetch == 0 {
            return Err(EnsembleError::Config(format!(
                "{key}.fetch must be defined and > 0 (ops/min)"
            )));
        }
        if self.update == 0 {
            return Err(EnsembleError::Config(format!(
                "{key}.update must be defined and > 0 (ops/min)"
            )));
        }
        Ok(())
    }
}

/// Known provider API endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// deSEC.
    #[serde(default)]
    pub desec: Option<ProviderConfig>,
    /// Google Cloud DNS.
    #[serde(default)]
    pub google: Option<ProviderConfig>,
    /// AWS Route53.
    #[serde(default)]
    pub aws: Option<ProviderConfig>,
}

impl ProvidersConfig {
    /// Iterate the providers that are actually configured.
    pub fn configured(&self) -> impl Iterator<Item = (&'static str, &ProviderConfig)> {
        [
            ("desec", self.desec.as_ref()),
            ("google", self.google.as_ref()),
            ("aws", self.aws.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, cfg)| cfg.map(|c| (name, c)))
    }
}

/// One provider API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Service address, `host:port`, with an optional `http(s)://` prefix
    /// overriding the default of https.
    pub address: String,

    /// URL path prefix of the provider API (e.g. `/api/v1`).
    #[serde(default)]
    pub baseurl: String,

    /// API key or token.
    #[serde(default)]
    pub api_key: String,

    /// How the key is presented to the provider.
    #[serde(default)]
    pub auth_scheme: crate::api::AuthScheme,

    /// Ops-per-minute caps for this provider's lanes.
    #[serde(default = "default_provider_limits")]
    pub limits: RateLimits,
}

// deSEC documents 50 reads and 15 rrset writes per minute; use those as the
// defaults for every provider lane.
fn default_provider_limits() -> RateLimits {
    RateLimits {
        fetch: 50,
        update: 15,
    }
}

impl ProviderConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.address.is_empty() {
            return Err(EnsembleError::Config(format!(
                "providers.{name}.address must be set"
            )));
        }
        if self.api_key.is_empty() && self.auth_scheme != crate::api::AuthScheme::None {
            return Err(EnsembleError::Config(format!(
                "providers.{name}.api_key must be set for auth scheme {:?}",
                self.auth_scheme
            )));
        }
        self.limits.validate(&format!("providers.{name}.limits"))
    }
}

/// TLS trust configuration for provider APIs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to a PEM bundle with the roots to trust.
    #[serde(default)]
    pub root_ca_pem: Option<PathBuf>,

    /// Disable certificate verification entirely.
    #[serde(default)]
    pub insecure: bool,
}

/// Zone store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Optional TOML file seeding signers, groups, and zones at startup.
    #[serde(default)]
    pub seed: Option<PathBuf>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "ensemble_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            engine: EngineConfig::default(),
            signers: SignersConfig {
                ddns: TransportLimits {
                    limits: RateLimits {
                        fetch: 50,
                        update: 15,
                    },
                },
            },
            providers: ProvidersConfig::default(),
            tls: TlsConfig::default(),
            store: StoreConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    #[test]
    fn test_minimal_config_validates() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config = minimal_config();
        config.signers.ddns.limits.update = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("signers.ddns.limits.update"));
    }

    #[test]
    fn test_provider_requires_address() {
        let mut config = minimal_config();
        config.providers.desec = Some(ProviderConfig {
            address: String::new(),
            baseurl: "/api/v1".to_string(),
            api_key: "k".to_string(),
            auth_scheme: crate::api::AuthScheme::Token,
            limits: default_provider_limits(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_insecure_excludes_root_ca() {
        let mut config = minimal_config();
        config.tls.insecure = true;
        config.tls.root_ca_pem = Some(PathBuf::from("/etc/ssl/roots.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_parses_from_toml() {
        let toml = r#"
            [signers.ddns.limits]
            fetch = 50
            update = 15

            [providers.desec]
            address = "desec.io:443"
            baseurl = "/api/v1"
            api_key = "sekrit"
            auth_scheme = "Authorization"

            [tls]
            insecure = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.signers.ddns.limits.fetch, 50);
        let desec = config.providers.desec.unwrap();
        assert_eq!(desec.baseurl, "/api/v1");
        assert_eq!(desec.auth_scheme, crate::api::AuthScheme::Token);
        assert_eq!(desec.limits.fetch, 50);
        assert!(config.tls.insecure);
    }

    #[test]
    fn test_auth_scheme_tags() {
        use crate::api::AuthScheme;

        // the config tags are the literal header selector strings
        for (tag, scheme) in [
            ("\"X-API-Key\"", AuthScheme::XApiKey),
            ("\"Authorization\"", AuthScheme::Token),
            ("\"none\"", AuthScheme::None),
        ] {
            let parsed: AuthScheme = serde_json::from_str(tag).unwrap();
            assert_eq!(parsed, scheme, "tag {tag}");
        }
        assert!(serde_json::from_str::<AuthScheme>("\"token\"").is_err());
    }
}
