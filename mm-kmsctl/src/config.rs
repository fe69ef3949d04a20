// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    path::{Path, PathBuf},
    time,
};

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use tracing::trace;

lazy_static! {
    static ref DEFAULT_CFG: parsed::Config =
        toml::from_str(include_str!("../../mmkmsctl.default.toml")).unwrap();
}

/// Serde representations of the configuration files.
mod parsed {
    use converge::Converge;
    use serde::Deserialize;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct Config {
        #[converge(nest)]
        pub(super) kms: Option<KmsConfig>,
        #[converge(nest)]
        pub(super) devices: Option<DevicesConfig>,
        #[converge(nest)]
        pub(super) gamma: Option<GammaConfig>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct KmsConfig {
        pub(super) dispatch_timeout_ms: Option<u64>,
        pub(super) force_probe: Option<bool>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct DevicesConfig {
        pub(super) paths: Option<Vec<PathBuf>>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct GammaConfig {
        pub(super) default_exponent: Option<f64>,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub kms: KmsConfig,
    pub devices: DevicesConfig,
    pub gamma: GammaConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KmsConfig {
    pub dispatch_timeout: time::Duration,
    pub force_probe: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DevicesConfig {
    /// Explicit device nodes. Empty means every card node.
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GammaConfig {
    pub default_exponent: f64,
}

impl From<&KmsConfig> for mm_kms::KmsConfig {
    fn from(cfg: &KmsConfig) -> Self {
        mm_kms::KmsConfig {
            dispatch_timeout: cfg.dispatch_timeout,
            force_probe: cfg.force_probe,
        }
    }
}

impl Config {
    pub fn new(path: Option<&PathBuf>) -> anyhow::Result<Config> {
        let file = path
            .map(|p| p.to_owned())
            .or_else(locate_default_config_file);

        let cfg = if let Some(file) = file {
            let content = std::fs::read_to_string(&file)
                .context(format!("reading configuration file {}", file.display()))?;
            let parsed: parsed::Config = toml::from_str(&content)
                .context(format!("parsing configuration file {}", file.display()))?;

            Some(parsed)
        } else {
            None
        };

        let this = Self::build(cfg);
        this.validate()?;

        Ok(this)
    }

    fn build(cfg: Option<parsed::Config>) -> Self {
        let defaults = DEFAULT_CFG.clone();

        let input = if let Some(cfg) = cfg {
            // The input takes precedence over the defaults.
            use converge::Converge;
            cfg.converge(defaults)
        } else {
            defaults
        };

        // We only unwrap values that should have been set in the default
        // config. This is verified by a test.
        let kms = input.kms.unwrap();
        let devices = input.devices.unwrap();
        let gamma = input.gamma.unwrap();

        let this = Config {
            kms: KmsConfig {
                dispatch_timeout: time::Duration::from_millis(kms.dispatch_timeout_ms.unwrap()),
                force_probe: kms.force_probe.unwrap(),
            },
            devices: DevicesConfig {
                paths: devices.paths.unwrap(),
            },
            gamma: GammaConfig {
                default_exponent: gamma.default_exponent.unwrap(),
            },
        };

        trace!("using config: {:#?}", this);
        this
    }

    /// Performs high-level validation on the final configuration.
    fn validate(&self) -> anyhow::Result<()> {
        if self.kms.dispatch_timeout.is_zero() {
            bail!("dispatch_timeout_ms must be greater than zero");
        }

        for path in &self.devices.paths {
            if !path.is_absolute() {
                bail!("device path must be absolute: {}", path.display());
            }
        }

        validate_exponent(self.gamma.default_exponent)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build(None)
    }
}

pub fn validate_exponent(exponent: f64) -> anyhow::Result<()> {
    if !exponent.is_finite() || exponent <= 0.0 {
        bail!("invalid gamma exponent: {}", exponent);
    }

    Ok(())
}

fn locate_default_config_file() -> Option<PathBuf> {
    let path = Path::new("/etc/magic-mirror/mmkmsctl.toml");
    if path.exists() {
        Some(path.to_owned())
    } else {
        None
    }
}
