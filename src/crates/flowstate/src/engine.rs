//! The scripting engine collaborator contract
//!
//! The checkpointing subsystem never reaches into engine internals. Everything
//! it needs from a suspended computation goes through [`Engine`]:
//!
//! - exporting the computation as an object graph and rebuilding it
//! - walking its call frames
//! - reading the compiled code of a frame, for fingerprinting
//! - rebinding runtime helper objects that are excluded from checkpoints
//! - resuming execution with the next input

use crate::error::Result;
use crate::value::Value;
use std::fmt;

/// Identity of one compiled code object
///
/// Engines must never reuse a code id for different code; a recompiled
/// function gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub u64);

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

/// One call frame of a suspended computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Compiled code executing in this frame
    pub code: CodeId,
    /// Function name, for diagnostics
    pub function: String,
    /// Script path or source description, for diagnostics
    pub source: String,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The function {} in script {}", self.function, self.source)
    }
}

/// Outcome of running a computation until it suspends or finishes
#[derive(Debug)]
pub enum Step<C> {
    /// The script suspended; `output` is what it produced for the caller
    Suspended { computation: C, output: Value },
    /// The script ran to completion
    Finished(Value),
}

impl<C> Step<C> {
    pub fn output(&self) -> &Value {
        match self {
            Step::Suspended { output, .. } => output,
            Step::Finished(value) => value,
        }
    }

    pub fn into_suspended(self) -> Option<C> {
        match self {
            Step::Suspended { computation, .. } => Some(computation),
            Step::Finished(_) => None,
        }
    }
}

/// A scripting engine able to suspend and resume computations
pub trait Engine: Send + Sync {
    /// A captured suspended computation
    type Computation: Send;

    /// Export the computation as an object graph
    fn object_graph(&self, computation: &Self::Computation) -> Result<Value>;

    /// Rebuild a computation from an object graph whose references have
    /// been resolved to live handles
    fn rebuild(&self, graph: Value) -> Result<Self::Computation>;

    /// Call frames of the computation, innermost (currently executing) first
    fn walk_frames(&self, computation: &Self::Computation) -> Result<Vec<Frame>>;

    /// Compiled code bytes of the function executing in `frame`
    fn compiled_code_bytes_of(&self, frame: &Frame) -> Result<Vec<u8>>;

    /// Live instance of a runtime helper object excluded from checkpoints
    fn runtime_helper(&self, name: &str) -> Option<Value>;

    /// Continue a suspended computation with the caller's input
    fn resume(&self, computation: Self::Computation, input: Value) -> Result<Step<Self::Computation>>;
}
