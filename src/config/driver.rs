//! Typed driver configuration
//!
//! The driver is configured through `docker plugin set KEY=VALUE ...`. Instead
//! of passing raw pairs around, the harness builds a [`DriverOptions`] value,
//! validates it, and renders it into settings in one place. Operator overrides
//! given as `KEY=VALUE` are parsed back into the typed fields, and unknown keys
//! are rejected.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::BackendKind;
use crate::errors::{HarnessError, Result};
use crate::types::SecretString;

/// Authentication the driver uses against the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum DriverAuth {
    Token { token: SecretString },
}

impl DriverAuth {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
        }
    }
}

/// Rotation loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RotationSettings {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Closed set of driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverOptions {
    pub provider: BackendKind,
    pub address: String,
    pub auth: DriverAuth,
    pub mount_path: String,
    pub rotation: RotationSettings,
    pub monitoring: bool,
}

/// Every setting key the driver recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKey {
    Provider,
    Address,
    AuthMethod,
    Token,
    MountPath,
    EnableRotation,
    RotationInterval,
    EnableMonitoring,
}

impl OptionKey {
    pub const ALL: [OptionKey; 8] = [
        Self::Provider,
        Self::Address,
        Self::AuthMethod,
        Self::Token,
        Self::MountPath,
        Self::EnableRotation,
        Self::RotationInterval,
        Self::EnableMonitoring,
    ];

    /// Setting name as the driver expects it for `provider`
    pub fn name(self, provider: BackendKind) -> String {
        let prefix = provider.option_prefix();
        match self {
            Self::Provider => "SECRETS_PROVIDER".to_string(),
            Self::Address => format!("{prefix}_ADDR"),
            Self::AuthMethod => format!("{prefix}_AUTH_METHOD"),
            Self::Token => format!("{prefix}_TOKEN"),
            Self::MountPath => format!("{prefix}_MOUNT_PATH"),
            Self::EnableRotation => "ENABLE_ROTATION".to_string(),
            Self::RotationInterval => "ROTATION_INTERVAL".to_string(),
            Self::EnableMonitoring => "ENABLE_MONITORING".to_string(),
        }
    }

    pub fn parse(name: &str, provider: BackendKind) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name(provider) == name)
    }
}

impl DriverOptions {
    /// Check every field; called by the plugin controller before `plugin set`
    pub fn validate(&self) -> Result<()> {
        if !(self.address.starts_with("http://") || self.address.starts_with("https://")) {
            return Err(HarnessError::configuration(format!(
                "{} must be an http(s) URL, got '{}'",
                OptionKey::Address.name(self.provider),
                self.address
            )));
        }

        if self.mount_path.is_empty()
            || self.mount_path.starts_with('/')
            || self.mount_path.ends_with('/')
        {
            return Err(HarnessError::configuration(format!(
                "{} must be a non-empty path without leading or trailing '/', got '{}'",
                OptionKey::MountPath.name(self.provider),
                self.mount_path
            )));
        }

        match &self.auth {
            DriverAuth::Token { token } if token.is_empty() => {
                return Err(HarnessError::configuration(format!(
                    "{} cannot be empty",
                    OptionKey::Token.name(self.provider)
                )));
            }
            DriverAuth::Token { .. } => {}
        }

        if self.rotation.enabled && self.rotation.interval < Duration::from_secs(1) {
            return Err(HarnessError::configuration(format!(
                "ROTATION_INTERVAL must be at least 1s when rotation is enabled, got {}",
                humantime::format_duration(self.rotation.interval)
            )));
        }

        Ok(())
    }

    /// Apply operator overrides given as `KEY=VALUE`.
    ///
    /// Keys must be recognized for the configured provider; the provider itself
    /// cannot be switched because the backend session is already chosen.
    pub fn apply_overrides<I, S>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pair in pairs {
            let pair = pair.as_ref();
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                HarnessError::configuration(format!("driver option '{pair}' is not KEY=VALUE"))
            })?;

            let key = OptionKey::parse(name, self.provider).ok_or_else(|| {
                HarnessError::configuration(format!(
                    "unrecognized driver option '{name}' for provider {}",
                    self.provider
                ))
            })?;

            match key {
                OptionKey::Provider => {
                    if value != self.provider.as_str() {
                        return Err(HarnessError::configuration(format!(
                            "SECRETS_PROVIDER is fixed to '{}' for this scenario",
                            self.provider
                        )));
                    }
                }
                OptionKey::Address => self.address = value.to_string(),
                OptionKey::AuthMethod => {
                    if value != "token" {
                        return Err(HarnessError::configuration(format!(
                            "unsupported auth method '{value}' (supported: token)"
                        )));
                    }
                }
                OptionKey::Token => self.auth = DriverAuth::Token { token: SecretString::new(value) },
                OptionKey::MountPath => self.mount_path = value.to_string(),
                OptionKey::EnableRotation => self.rotation.enabled = parse_flag(name, value)?,
                OptionKey::RotationInterval => {
                    self.rotation.interval = humantime::parse_duration(value).map_err(|e| {
                        HarnessError::configuration(format!("invalid {name} '{value}': {e}"))
                    })?;
                }
                OptionKey::EnableMonitoring => self.monitoring = parse_flag(name, value)?,
            }
        }

        Ok(())
    }

    /// Render as `KEY=VALUE` settings for a single `docker plugin set` call.
    ///
    /// The result contains the credential in clear text.
    pub fn to_settings(&self) -> Vec<String> {
        let token = match &self.auth {
            DriverAuth::Token { token } => token.expose_secret(),
        };

        OptionKey::ALL
            .into_iter()
            .map(|key| {
                let value = match key {
                    OptionKey::Provider => self.provider.as_str().to_string(),
                    OptionKey::Address => self.address.clone(),
                    OptionKey::AuthMethod => self.auth.method().to_string(),
                    OptionKey::Token => token.to_string(),
                    OptionKey::MountPath => self.mount_path.clone(),
                    OptionKey::EnableRotation => self.rotation.enabled.to_string(),
                    OptionKey::RotationInterval => {
                        humantime::format_duration(self.rotation.interval).to_string()
                    }
                    OptionKey::EnableMonitoring => self.monitoring.to_string(),
                };
                format!("{}={}", key.name(self.provider), value)
            })
            .collect()
    }

    /// Setting names only, safe for logs
    pub fn keys(&self) -> Vec<String> {
        OptionKey::ALL.into_iter().map(|key| key.name(self.provider)).collect()
    }
}

impl fmt::Display for DriverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} (mount {}, rotation {} every {}, monitoring {})",
            self.provider,
            self.address,
            self.mount_path,
            if self.rotation.enabled { "on" } else { "off" },
            humantime::format_duration(self.rotation.interval),
            if self.monitoring { "on" } else { "off" }
        )
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(HarnessError::configuration(format!(
            "{name} must be true or false, got '{other}'"
        ))),
    }
}
