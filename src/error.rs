//! Error types for the instrumentation pipeline.
//!
//! Every error reflects a structural defect in the method metadata or in the
//! class file being rewritten, so nothing here is retryable: running the same
//! rewrite again reproduces the same error.
//!
//! # Categories
//!
//! - **Identity**: [`Error::MissingOwner`], [`Error::MissingMethodName`]
//! - **Descriptor**: [`Error::MalformedDescriptor`], [`Error::TooManyParameterSlots`]
//! - **Emission**: slot, constant pool, branch and code-size failures raised
//!   while encoding or weaving instructions
//! - **Class file**: [`Error::ClassFile`] wraps [`ClassFileError`]
//! - **Pass**: [`Error::Method`] ties a failure to the method that caused it

use thiserror::Error;

use crate::classfile::ClassFileError;
use crate::config::ConfigError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // =========================================================================
    // IDENTITY
    // =========================================================================
    /// The owning type name was empty.
    #[error("method context is missing its owner type name")]
    MissingOwner,

    /// The method name was empty.
    #[error("method context for `{owner}` is missing its method name")]
    MissingMethodName { owner: String },

    // =========================================================================
    // DESCRIPTOR
    // =========================================================================
    #[error("malformed method descriptor `{descriptor}` at byte {position}: {reason}")]
    MalformedDescriptor {
        descriptor: String,
        position: usize,
        reason: &'static str,
    },

    /// Parameters (plus the receiver) need more than the 255 local slots the
    /// JVM allows for arguments.
    #[error("descriptor `{descriptor}` needs {slots} argument slots (max 255)")]
    TooManyParameterSlots { descriptor: String, slots: u32 },

    // =========================================================================
    // EMISSION
    // =========================================================================
    /// The arguments reach past the method's declared `max_locals`.
    #[error("argument slot {slot} is outside max_locals {max_locals}")]
    SlotOutOfRange { slot: u32, max_locals: u16 },

    #[error("branch at offset {offset} cannot reach {target} with a 16-bit offset")]
    BranchOutOfRange { offset: u32, target: u32 },

    /// Widening a conditional branch needs a frame after it, and the code
    /// between the previous frame and the branch could not be replayed.
    #[error("cannot infer the stack map frame after the branch at offset {offset}: {reason}")]
    FrameInference { offset: u32, reason: &'static str },

    #[error("instrumented code is {len} bytes (max 65535)")]
    CodeTooLarge { len: usize },

    #[error("offset {target} does not start an instruction")]
    InvalidBranchTarget { target: i64 },

    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("instruction at offset {offset} runs past the end of the code array")]
    TruncatedInstruction { offset: usize },

    #[error("switch at offset {offset} has an invalid range or pair count")]
    MalformedSwitch { offset: usize },

    /// An instruction stream could not be read back as probe events.
    #[error("cannot decode probe events at instruction {index}: {reason}")]
    UndecodableProbeSequence { index: usize, reason: &'static str },

    #[error("instrumentor is {actual}, expected {expected}")]
    InvalidPhase {
        expected: &'static str,
        actual: &'static str,
    },

    // =========================================================================
    // CLASS FILE / CONFIG / PASS
    // =========================================================================
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A single method failed while the pass was configured to abort.
    #[error("failed to instrument {method}: {source}")]
    Method {
        method: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn malformed(descriptor: &str, position: usize, reason: &'static str) -> Self {
        Error::MalformedDescriptor {
            descriptor: descriptor.to_string(),
            position,
            reason,
        }
    }
}
