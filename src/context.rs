//! Identity of the method being rewritten.

use crate::{Error, Result};

pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;

/// Name the JVM gives every constructor.
pub const CONSTRUCTOR_NAME: &str = "<init>";
/// Name of the static initializer.
pub const STATIC_INITIALIZER_NAME: &str = "<clinit>";

/// Owner, name, descriptor and flags of one method, fixed for a rewrite pass.
///
/// The descriptor is kept verbatim; it is reported to the probes as-is and
/// parsed separately by [`crate::descriptor::MethodDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodContext {
    owner: String,
    name: String,
    descriptor: String,
    access_flags: u16,
}

impl MethodContext {
    /// Fails if `owner` or `name` is empty.
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        access_flags: u16,
    ) -> Result<Self> {
        let owner = owner.into();
        if owner.is_empty() {
            return Err(Error::MissingOwner);
        }
        let name = name.into();
        if name.is_empty() {
            return Err(Error::MissingMethodName { owner });
        }
        Ok(Self { owner, name, descriptor: descriptor.into(), access_flags })
    }

    /// Internal name of the declaring type, e.g. `com/acme/Calc`.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    /// First argument slot: 0 for static methods, 1 when slot 0 holds `this`.
    pub fn first_argument_slot(&self) -> u16 {
        if self.is_static() {
            0
        } else {
            1
        }
    }
}

impl std::fmt::Display for MethodContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}
