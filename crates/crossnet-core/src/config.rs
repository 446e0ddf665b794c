//! Deployment configuration

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::Error;

pub const DEFAULT_REGION: &str = "us-central1";
pub const DEFAULT_PREFIX: &str = "crossnet";
pub const DEFAULT_SPOKES: usize = 2;
pub const MAX_SPOKES: usize = 50;
pub const DEFAULT_FAN_OUT: usize = 5;

/// Environment variables read by [`DeployConfig::with_env_overrides`]
pub mod env {
    pub const PROJECT: &str = "CROSSNET_PROJECT";
    pub const PROJECT_FALLBACK: &str = "GOOGLE_CLOUD_PROJECT";
    pub const REGION: &str = "CROSSNET_REGION";
    pub const ZONE: &str = "CROSSNET_ZONE";
    pub const PREFIX: &str = "CROSSNET_PREFIX";
    pub const SPOKES: &str = "CROSSNET_SPOKES";
    pub const VPN_SECRET: &str = "CROSSNET_VPN_SECRET";
}

/// Settings shared by every provisioning entry point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Cloud project id; empty until resolved from env or the ambient CLI config
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Zone for the hub instance, defaults to `<region>-a`
    #[serde(default)]
    pub zone: Option<String>,
    /// Prefix for every resource name
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Number of spoke networks
    #[serde(default = "default_spokes")]
    pub spokes: usize,
    /// Relay services per spoke for the single-hop scale variant
    #[serde(default)]
    pub relay_scale: usize,
    /// Concurrency ceiling for serverless fan-out loops
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    /// Pre-shared key for VPN tunnels; derived per link when unset
    #[serde(default, skip_serializing)]
    pub vpn_shared_secret: Option<String>,
    /// Directory submitted to the image build
    #[serde(default = "default_build_context")]
    pub build_context: PathBuf,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    /// Account id of the deployer service account
    #[serde(default = "default_service_account")]
    pub service_account: String,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_spokes() -> usize {
    DEFAULT_SPOKES
}

fn default_fan_out() -> usize {
    DEFAULT_FAN_OUT
}

fn default_build_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_machine_type() -> String {
    "e2-small".to_string()
}

fn default_service_account() -> String {
    "crossnet-deployer".to_string()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            region: default_region(),
            zone: None,
            prefix: default_prefix(),
            spokes: DEFAULT_SPOKES,
            relay_scale: 0,
            fan_out: DEFAULT_FAN_OUT,
            vpn_shared_secret: None,
            build_context: default_build_context(),
            machine_type: default_machine_type(),
            service_account: default_service_account(),
        }
    }
}

impl DeployConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> crate::Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn with_env_overrides<F>(mut self, lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(project) = get(env::PROJECT).or_else(|| get(env::PROJECT_FALLBACK)) {
            self.project = project;
        }
        if let Some(region) = get(env::REGION) {
            self.region = region;
        }
        if let Some(zone) = get(env::ZONE) {
            self.zone = Some(zone);
        }
        if let Some(prefix) = get(env::PREFIX) {
            self.prefix = prefix;
        }
        if let Some(spokes) = get(env::SPOKES) {
            self.spokes = spokes.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{} must be a number, got {:?}", env::SPOKES, spokes))
            })?;
        }
        if let Some(secret) = get(env::VPN_SECRET) {
            self.vpn_shared_secret = Some(secret);
        }
        Ok(self)
    }

    pub fn with_relay_scale(mut self, scale: usize) -> Self {
        self.relay_scale = scale;
        self
    }

    pub fn with_spokes(mut self, spokes: usize) -> Self {
        self.spokes = spokes;
        self
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load a JSON file, then apply overrides from `lookup`
    pub fn load_with_overrides<F>(
        path: impl AsRef<std::path::Path>,
        lookup: F,
    ) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::load(path)?.with_env_overrides(lookup)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.project.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "project is not set (export {} or run `gcloud config set project`)",
                env::PROJECT
            )));
        }
        if self.region.trim().is_empty() {
            return Err(Error::InvalidConfig("region is empty".into()));
        }
        if self.spokes == 0 || self.spokes > MAX_SPOKES {
            return Err(Error::InvalidConfig(format!(
                "spokes must be between 1 and {}, got {}",
                MAX_SPOKES, self.spokes
            )));
        }
        if self.fan_out == 0 {
            return Err(Error::InvalidConfig("fan_out must be at least 1".into()));
        }
        if self.prefix.is_empty()
            || !self.prefix.starts_with(|c: char| c.is_ascii_lowercase())
            || !self
                .prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidConfig(format!(
                "prefix {:?} must be lowercase letters, digits or '-'",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn zone(&self) -> String {
        self.zone
            .clone()
            .unwrap_or_else(|| format!("{}-a", self.region))
    }

    /// `<prefix>-<suffix>`
    pub fn name(&self, suffix: &str) -> String {
        format!("{}-{}", self.prefix, suffix)
    }

    pub fn service_account_email(&self) -> String {
        format!(
            "{}@{}.iam.gserviceaccount.com",
            self.service_account, self.project
        )
    }

    /// Artifact Registry host path for this region and project
    pub fn registry_path(&self, repository: &str) -> String {
        format!(
            "{}-docker.pkg.dev/{}/{}",
            self.region, self.project, repository
        )
    }

    /// Shared secret for one VPN link.
    ///
    /// Both tunnel ends are created from the same config, so a derived secret
    /// matches on either side across re-runs.
    pub fn tunnel_secret(&self, link: &str) -> String {
        if let Some(secret) = &self.vpn_shared_secret {
            return secret.clone();
        }
        let digest = Sha256::digest(format!("{}/{}/{}", self.project, self.prefix, link));
        hex::encode(&digest[..16])
    }
}
