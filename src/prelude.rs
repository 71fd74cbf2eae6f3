//! Common imports for instrumenting classes.
//!
//! This prelude is intentionally small. It covers the pass driver and its
//! settings; reach into the modules for the lower layers.

pub use crate::config::{FailurePolicy, InstrumentConfig};
pub use crate::pass::{ClassInstrumentor, ClassReport, InstrumentedClass, MethodFilter, SkipReason};
pub use crate::probe::ProbeInterface;
pub use crate::snapshot::EmptyArgs;
pub use crate::{Error, Result};
