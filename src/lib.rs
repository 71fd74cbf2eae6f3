//! # jvm-probe-weaver
//!
//! Rewrites JVM method bodies so they report their own execution to a static
//! probe class.
//!
//! Every instrumented method:
//! - reports entry with a snapshot of all its argument values,
//! - reports object creation first when it is a constructor,
//! - reports every exit, normal or abrupt, with the opcode that caused it.
//!
//! Behavior of the method is otherwise untouched: return values, exceptions,
//! local variables and control flow stay as they were.
//!
//! ## Quick Start
//!
//! ```no_run
//! use jvm_probe_weaver::prelude::*;
//!
//! let bytes = std::fs::read("Calc.class")?;
//! let out = ClassInstrumentor::new(InstrumentConfig::default()).instrument_class(&bytes)?;
//! std::fs::write("Calc.class", &out.bytes)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Instrumented classes call into `instrumentj/StaticProfilerInterface` by
//! default:
//!
//! ```text
//! static void objectAllocationProbe(String owner)
//! static void methodEnterProbe(String owner, String method, String descriptor, Object[] args)
//! static void methodExitProbe(String owner, String method, String descriptor, int exitOpcode)
//! ```
//!
//! Use [`probe::ProbeInterface`] (or `probe_class=...` in
//! [`config::InstrumentConfig::from_options`]) to point at another class.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              pass::ClassInstrumentor                     │
//! │   skip rules, MethodFilter, FailurePolicy, ClassReport   │
//! ├─────────────────────────────────────────────────────────┤
//! │              rewrite::instrument_code                    │
//! │   layout, branch/exception/frame remapping, max_stack    │
//! ├─────────────────────────────────────────────────────────┤
//! │   instrument::EntryExitInstrumentor  (NotEntered→Entered)│
//! │   snapshot::emit_snapshot  (SlotCursor, Object[] args)   │
//! │   context / descriptor / kind  (method identity, kinds)  │
//! ├─────────────────────────────────────────────────────────┤
//! │   insn::InsnSink → assembler::Assembler → bytes          │
//! │   bytecode / opcodes / classfile  (decode, encode, I/O)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`classfile`] | Parse and write `.class` files, constant pool interning |
//! | [`bytecode`] | Decode code arrays, re-encode moved branches and switches |
//! | [`descriptor`] | Method descriptor scanner |
//! | [`kind`] | Slot width, load opcode and boxing per parameter kind |
//! | [`context`] | Owner, name, descriptor and flags of one method |
//! | [`snapshot`] | Builds the boxed `Object[]` of arguments |
//! | [`instrument`] | Entry/exit state machine |
//! | [`probe`] | Probe class names; decodes emitted code back into events |
//! | [`rewrite`] | Weaves probes into a `Code` attribute |
//! | [`frames`] | Stack map frames for join points added by branch widening |
//! | [`pass`] | **Start here**: instruments a whole class |
//! | [`config`] | Pass settings and option-string parsing |
//!
//! ## Inspecting generated code
//!
//! Everything the instrumentor emits goes through [`insn::InsnSink`]. A
//! `Vec<Insn>` records the stream, and [`probe::decode_events`] reads it back
//! as the probe calls it makes:
//!
//! ```
//! use jvm_probe_weaver::context::{MethodContext, ACC_STATIC};
//! use jvm_probe_weaver::instrument::EntryExitInstrumentor;
//! use jvm_probe_weaver::probe::{decode_events, ProbeEvent, ProbeInterface};
//! use jvm_probe_weaver::snapshot::EmptyArgs;
//!
//! let ctx = MethodContext::new("Calc", "add", "(II)I", ACC_STATIC)?;
//! let probes = ProbeInterface::default();
//! let mut inst = EntryExitInstrumentor::new(&ctx, &probes, EmptyArgs::default())?;
//!
//! let mut insns = Vec::new();
//! inst.on_method_enter(&mut insns)?;
//! let events = decode_events(&insns, &probes)?;
//! assert!(matches!(&events[0], ProbeEvent::Enter { args, .. } if args.len() == 2));
//! # Ok::<(), jvm_probe_weaver::Error>(())
//! ```
//!
//! ## Logging
//!
//! The pass and the rewriter log through [`tracing`]: skipped methods and
//! dropped attributes at `debug`, methods left uninstrumented after an error
//! at `warn`. Install a subscriber to see them.

pub mod assembler;
pub mod bytecode;
pub mod classfile;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod frames;
pub mod insn;
pub mod instrument;
pub mod kind;
pub mod opcodes;
pub mod pass;
pub mod prelude;
pub mod probe;
pub mod rewrite;
pub mod snapshot;

pub use error::{Error, Result};
