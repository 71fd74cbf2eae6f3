//! Settings for a rewrite pass.
//!
//! [`InstrumentConfig`] can be built in code or parsed from an agent-style
//! option string:
//!
//! ```
//! use jvm_probe_weaver::config::{FailurePolicy, InstrumentConfig};
//!
//! let config = InstrumentConfig::from_options("probe_class=my/Probes,on_error=skip").unwrap();
//! assert_eq!(config.probes().owner(), "my/Probes");
//! assert_eq!(config.failure_policy(), FailurePolicy::SkipMethod);
//! ```

use thiserror::Error;

use crate::probe::ProbeInterface;
use crate::snapshot::EmptyArgs;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("option `{0}` is not of the form key=value")]
    MissingValue(String),

    #[error("unknown option `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for option `{key}`; expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
}

/// What a failing method does to the rest of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop and return the error.
    #[default]
    Abort,
    /// Leave the method as it was, log a warning and carry on.
    SkipMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentConfig {
    probes: ProbeInterface,
    empty_args: EmptyArgs,
    failure_policy: FailurePolicy,
    skip_synthetic: bool,
    skip_static_initializers: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            probes: ProbeInterface::default(),
            empty_args: EmptyArgs::default(),
            failure_policy: FailurePolicy::default(),
            skip_synthetic: true,
            skip_static_initializers: false,
        }
    }
}

impl InstrumentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key=value` pairs separated by commas, on top of the defaults.
    ///
    /// | key | values |
    /// |---|---|
    /// | `probe_class` | internal class name |
    /// | `alloc_probe`, `enter_probe`, `exit_probe` | method names |
    /// | `empty_args` | `single` or `empty` |
    /// | `on_error` | `abort` or `skip` |
    /// | `skip_synthetic`, `skip_clinit` | `true` or `false` |
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = option
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| ConfigError::MissingValue(option.to_string()))?;

            let invalid = |expected| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                expected,
            };
            let name = |expected| {
                if value.is_empty() {
                    Err(invalid(expected))
                } else {
                    Ok(value.to_string())
                }
            };
            let flag = || match value {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(invalid("`true` or `false`")),
            };

            config = match key {
                "probe_class" => {
                    let probes = config.probes.clone().with_owner(name("a class name")?);
                    config.with_probes(probes)
                }
                "alloc_probe" => {
                    let probes = config.probes.clone().with_allocation_probe(name("a method name")?);
                    config.with_probes(probes)
                }
                "enter_probe" => {
                    let probes = config.probes.clone().with_enter_probe(name("a method name")?);
                    config.with_probes(probes)
                }
                "exit_probe" => {
                    let probes = config.probes.clone().with_exit_probe(name("a method name")?);
                    config.with_probes(probes)
                }
                "empty_args" => match value {
                    "single" => config.with_empty_args(EmptyArgs::SingleSlot),
                    "empty" => config.with_empty_args(EmptyArgs::Empty),
                    _ => return Err(invalid("`single` or `empty`")),
                },
                "on_error" => match value {
                    "abort" => config.with_failure_policy(FailurePolicy::Abort),
                    "skip" => config.with_failure_policy(FailurePolicy::SkipMethod),
                    _ => return Err(invalid("`abort` or `skip`")),
                },
                "skip_synthetic" => {
                    let skip = flag()?;
                    config.skip_synthetic(skip)
                }
                "skip_clinit" => {
                    let skip = flag()?;
                    config.skip_static_initializers(skip)
                }
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            };
        }
        Ok(config)
    }

    pub fn with_probes(mut self, probes: ProbeInterface) -> Self {
        self.probes = probes;
        self
    }

    /// Array length for methods with no parameters.
    pub fn with_empty_args(mut self, empty_args: EmptyArgs) -> Self {
        self.empty_args = empty_args;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Skip methods flagged synthetic or bridge. On by default.
    pub fn skip_synthetic(mut self, value: bool) -> Self {
        self.skip_synthetic = value;
        self
    }

    /// Skip `<clinit>`. Off by default.
    pub fn skip_static_initializers(mut self, value: bool) -> Self {
        self.skip_static_initializers = value;
        self
    }

    pub fn probes(&self) -> &ProbeInterface {
        &self.probes
    }

    pub fn empty_args(&self) -> EmptyArgs {
        self.empty_args
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn skips_synthetic(&self) -> bool {
        self.skip_synthetic
    }

    pub fn skips_static_initializers(&self) -> bool {
        self.skip_static_initializers
    }
}
