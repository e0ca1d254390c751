//! Proxy configuration rendering
//!
//! A node either runs the admin's hand-written YAML verbatim or a document
//! generated from its `NodeSettings`. Custom text is only trusted when it
//! passes a structural sanity check; otherwise the generated form is used.

use serde::Serialize;
use thiserror::Error;

use pf_core::types::{NodeSettings, TlsMode};

/// Minimum trimmed length of a usable custom config
const MIN_CUSTOM_LEN: usize = 10;

/// Why custom config text was not used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustomConfigError {
    #[error("custom config is empty")]
    Missing,

    #[error("custom config shorter than 10 characters")]
    TooShort,

    #[error("custom config is not valid YAML: {0}")]
    NotYaml(String),

    #[error("custom config is not a YAML mapping")]
    NotMapping,

    #[error("custom config has no `listen` key")]
    MissingListen,

    #[error("custom config has neither `acme` nor `tls` key")]
    MissingTls,
}

/// Configuration text chosen for a node
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub text: String,
    /// Whether `text` is the admin's custom config
    pub custom: bool,
    /// Set when custom config was requested but rejected
    pub rejected: Option<CustomConfigError>,
}

/// Check that custom config text is structurally usable
pub fn check_custom_config(text: &str) -> Result<(), CustomConfigError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CustomConfigError::Missing);
    }
    if trimmed.chars().count() < MIN_CUSTOM_LEN {
        return Err(CustomConfigError::TooShort);
    }

    let doc: serde_yaml::Value =
        serde_yaml::from_str(trimmed).map_err(|e| CustomConfigError::NotYaml(e.to_string()))?;
    let map = doc.as_mapping().ok_or(CustomConfigError::NotMapping)?;

    if !map.contains_key("listen") {
        return Err(CustomConfigError::MissingListen);
    }
    if !map.contains_key("acme") && !map.contains_key("tls") {
        return Err(CustomConfigError::MissingTls);
    }
    Ok(())
}

/// Pick custom or generated config for a node
pub fn render_config(settings: &NodeSettings) -> Result<RenderedConfig, serde_yaml::Error> {
    let mut rejected = None;

    if settings.use_custom_config {
        let text = settings.custom_config.as_deref().unwrap_or_default();
        match check_custom_config(text) {
            Ok(()) => {
                return Ok(RenderedConfig {
                    text: text.to_string(),
                    custom: true,
                    rejected: None,
                })
            }
            Err(reason) => rejected = Some(reason),
        }
    }

    Ok(RenderedConfig {
        text: generate_config(settings)?,
        custom: false,
        rejected,
    })
}

/// Generate the proxy's YAML configuration from structured settings
pub fn generate_config(settings: &NodeSettings) -> Result<String, serde_yaml::Error> {
    let (acme, tls) = match &settings.tls {
        TlsMode::Acme { domains, email } => (
            Some(AcmeSection {
                domains: domains.clone(),
                email: email.clone(),
            }),
            None,
        ),
        TlsMode::Static {
            cert_path,
            key_path,
        } => (
            None,
            Some(TlsSection {
                cert: cert_path.clone(),
                key: key_path.clone(),
            }),
        ),
    };

    let doc = ProxyConfig {
        listen: format!(":{}", settings.listen_port),
        acme,
        tls,
        auth: AuthSection {
            kind: "http",
            http: HttpAuth {
                url: settings.auth_callback_url.clone(),
            },
        },
        traffic_stats: TrafficStatsSection {
            listen: settings.stats_listen.clone(),
            secret: settings.stats_secret.clone(),
        },
        masquerade: settings.masquerade_url.as_ref().map(|url| Masquerade {
            kind: "proxy",
            proxy: MasqueradeProxy {
                url: url.clone(),
                rewrite_host: true,
            },
        }),
        bandwidth: settings.bandwidth.as_ref().map(|b| BandwidthSection {
            up: b.up.clone(),
            down: b.down.clone(),
        }),
    };

    serde_yaml::to_string(&doc)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProxyConfig {
    listen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    acme: Option<AcmeSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<TlsSection>,
    auth: AuthSection,
    traffic_stats: TrafficStatsSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    masquerade: Option<Masquerade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bandwidth: Option<BandwidthSection>,
}

#[derive(Serialize)]
struct AcmeSection {
    domains: Vec<String>,
    email: String,
}

#[derive(Serialize)]
struct TlsSection {
    cert: String,
    key: String,
}

#[derive(Serialize)]
struct AuthSection {
    #[serde(rename = "type")]
    kind: &'static str,
    http: HttpAuth,
}

#[derive(Serialize)]
struct HttpAuth {
    url: String,
}

#[derive(Serialize)]
struct TrafficStatsSection {
    listen: String,
    secret: String,
}

#[derive(Serialize)]
struct Masquerade {
    #[serde(rename = "type")]
    kind: &'static str,
    proxy: MasqueradeProxy,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MasqueradeProxy {
    url: String,
    rewrite_host: bool,
}

#[derive(Serialize)]
struct BandwidthSection {
    up: String,
    down: String,
}
