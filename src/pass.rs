//! Instruments every eligible method of one class.
//!
//! ```no_run
//! use jvm_probe_weaver::config::InstrumentConfig;
//! use jvm_probe_weaver::pass::ClassInstrumentor;
//!
//! let bytes = std::fs::read("Calc.class").unwrap();
//! let out = ClassInstrumentor::new(InstrumentConfig::default())
//!     .with_filter(|_owner: &str, name: &str, _desc: &str| name != "toString")
//!     .instrument_class(&bytes)
//!     .unwrap();
//! println!("{} methods instrumented", out.report.instrumented.len());
//! ```

use std::fmt;

use tracing::{debug, debug_span, warn};

use crate::classfile::ClassFile;
use crate::config::{FailurePolicy, InstrumentConfig};
use crate::context::{MethodContext, ACC_BRIDGE, ACC_SYNTHETIC, STATIC_INITIALIZER_NAME};
use crate::instrument::EntryExitInstrumentor;
use crate::rewrite::{instrument_code, RewriteSummary};
use crate::{Error, Result};

/// Decides which methods get probes, on top of the built-in skips.
pub trait MethodFilter: Send + Sync {
    fn accept(&self, owner: &str, name: &str, descriptor: &str) -> bool;
}

impl<F> MethodFilter for F
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    fn accept(&self, owner: &str, name: &str, descriptor: &str) -> bool {
        self(owner, name, descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Abstract or native; there is no body to rewrite.
    NoCode,
    /// The method belongs to the probe class itself.
    ProbeClass,
    Synthetic,
    StaticInitializer,
    Filtered,
    /// Rewriting failed under [`FailurePolicy::SkipMethod`].
    Failed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoCode => f.write_str("no code"),
            SkipReason::ProbeClass => f.write_str("probe class"),
            SkipReason::Synthetic => f.write_str("synthetic or bridge"),
            SkipReason::StaticInitializer => f.write_str("static initializer"),
            SkipReason::Filtered => f.write_str("rejected by filter"),
            SkipReason::Failed(error) => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedMethod {
    pub name: String,
    pub descriptor: String,
    pub summary: RewriteSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMethod {
    pub name: String,
    pub descriptor: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassReport {
    pub class_name: String,
    pub instrumented: Vec<InstrumentedMethod>,
    pub skipped: Vec<SkippedMethod>,
}

impl ClassReport {
    pub fn failures(&self) -> impl Iterator<Item = &SkippedMethod> {
        self.skipped.iter().filter(|m| matches!(m.reason, SkipReason::Failed(_)))
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentedClass {
    pub bytes: Vec<u8>,
    pub report: ClassReport,
}

pub struct ClassInstrumentor {
    config: InstrumentConfig,
    filter: Option<Box<dyn MethodFilter>>,
}

impl ClassInstrumentor {
    pub fn new(config: InstrumentConfig) -> Self {
        Self { config, filter: None }
    }

    pub fn with_filter(mut self, filter: impl MethodFilter + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Parses `bytes`, instruments it and writes it back out.
    ///
    /// When no method was rewritten the input bytes are returned unchanged.
    pub fn instrument_class(&self, bytes: &[u8]) -> Result<InstrumentedClass> {
        let mut class = ClassFile::parse(bytes)?;
        let report = self.instrument(&mut class)?;
        let bytes = if report.instrumented.is_empty() {
            bytes.to_vec()
        } else {
            class.to_bytes()?
        };
        Ok(InstrumentedClass { bytes, report })
    }

    /// Instruments a parsed class in place.
    pub fn instrument(&self, class: &mut ClassFile) -> Result<ClassReport> {
        let owner = class.class_name()?.to_string();
        let _span = debug_span!("instrument_class", class = %owner).entered();
        let mut report = ClassReport { class_name: owner.clone(), ..ClassReport::default() };

        let ClassFile { constant_pool, methods, .. } = class;
        for method in methods.iter_mut() {
            let name = constant_pool.get_utf8(method.name_index)?.to_string();
            let descriptor = constant_pool.get_utf8(method.descriptor_index)?.to_string();

            let access_flags = method.access_flags;
            let skip = match method.code_mut() {
                None => Err(SkipReason::NoCode),
                Some(code) => match self.skip_reason(&owner, &name, &descriptor, access_flags) {
                    Some(reason) => Err(reason),
                    None => Ok(code),
                },
            };
            let code = match skip {
                Ok(code) => code,
                Err(reason) => {
                    debug!(method = %name, %descriptor, %reason, "skipping method");
                    report.skipped.push(SkippedMethod { name, descriptor, reason });
                    continue;
                }
            };

            let result = MethodContext::new(owner.as_str(), name.as_str(), descriptor.as_str(), access_flags)
                .and_then(|context| {
                    let mut instrumentor =
                        EntryExitInstrumentor::new(&context, self.config.probes(), self.config.empty_args())?;
                    instrument_code(code, constant_pool, &mut instrumentor)
                });

            match result {
                Ok(summary) => {
                    debug!(method = %name, %descriptor, exits = summary.exit_probes, "instrumented method");
                    report.instrumented.push(InstrumentedMethod { name, descriptor, summary });
                }
                Err(error) => match self.config.failure_policy() {
                    FailurePolicy::Abort => {
                        return Err(Error::Method {
                            method: format!("{owner}.{name}{descriptor}"),
                            source: Box::new(error),
                        });
                    }
                    FailurePolicy::SkipMethod => {
                        warn!(method = %name, %descriptor, %error, "leaving method uninstrumented");
                        report.skipped.push(SkippedMethod {
                            name,
                            descriptor,
                            reason: SkipReason::Failed(error.to_string()),
                        });
                    }
                },
            }
        }

        Ok(report)
    }

    fn skip_reason(&self, owner: &str, name: &str, descriptor: &str, access_flags: u16) -> Option<SkipReason> {
        if owner == self.config.probes().owner() {
            Some(SkipReason::ProbeClass)
        } else if self.config.skips_synthetic() && access_flags & (ACC_SYNTHETIC | ACC_BRIDGE) != 0 {
            Some(SkipReason::Synthetic)
        } else if self.config.skips_static_initializers() && name == STATIC_INITIALIZER_NAME {
            Some(SkipReason::StaticInitializer)
        } else if self.filter.as_ref().is_some_and(|f| !f.accept(owner, name, descriptor)) {
            Some(SkipReason::Filtered)
        } else {
            None
        }
    }
}
