//! A small line-oriented script engine for tests and benchmarks
//!
//! Scripts are nested function blocks of three instructions:
//!
//! ```text
//! ask What is your name?     # suspend, yielding the prompt
//! use cache                  # take a reference to a named component
//! fn confirm {               # nested function (position "0.")
//!   ask Are you sure?
//! }
//! call 0                     # run nested function 0
//! ```
//!
//! A computation is a stack of `(function, pc)` frames plus the answers
//! received so far. When the outermost function returns, the computation
//! finishes with the list of answers. Every compilation assigns fresh
//! handles and code ids, like a real engine recompiling a script.

use crate::engine::{CodeId, Engine, Frame, Step};
use crate::error::{CheckpointError, Result};
use crate::index::{CompiledScript, FunctionNode, ScriptSource};
use crate::registry::ComponentSource;
use crate::scripts::ScriptCompiler;
use crate::value::{Handle, Value};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Class name of the engine's runtime helper object
pub const HOST_CLASS: &str = "Host";

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Ask(String),
    Call(usize),
    Use(String),
}

impl Op {
    fn render(&self) -> String {
        match self {
            Op::Ask(prompt) => format!("ask {}", prompt),
            Op::Call(n) => format!("call {}", n),
            Op::Use(name) => format!("use {}", name),
        }
    }
}

#[derive(Debug)]
struct FunctionDef {
    code: CodeId,
    name: String,
    script: String,
    ops: Vec<Op>,
    children: Vec<Handle>,
}

/// A suspended computation of [`ScriptedEngine`]
#[derive(Debug, Clone, PartialEq)]
pub struct Suspended {
    /// Outermost frame first
    frames: Vec<(Handle, usize)>,
    answers: Vec<Value>,
    components: Vec<Handle>,
}

impl Suspended {
    /// Function handles on the stack, outermost first
    pub fn function_handles(&self) -> Vec<Handle> {
        self.frames.iter().map(|(handle, _)| *handle).collect()
    }

    pub fn answers(&self) -> &[Value] {
        &self.answers
    }

    pub fn components(&self) -> &[Handle] {
        &self.components
    }
}

struct Builder {
    name: String,
    ops: Vec<Op>,
    children: Vec<FunctionNode>,
}

/// In-memory engine with editable script sources and a component container
#[derive(Default)]
pub struct ScriptedEngine {
    next_id: AtomicU64,
    sources: RwLock<HashMap<String, (u64, String)>>,
    compiled: RwLock<HashMap<String, (u64, Arc<CompiledScript>)>>,
    functions: DashMap<Handle, Arc<FunctionDef>>,
    code: DashMap<CodeId, Vec<u8>>,
    components: RwLock<Vec<(String, Handle)>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Set or replace the source text of a script
    pub fn set_source(&self, path: &str, source: &str) {
        let mut sources = self.sources.write();
        let version = sources.get(path).map(|(v, _)| v + 1).unwrap_or(1);
        sources.insert(path.to_string(), (version, source.to_string()));
    }

    /// Define a component, or replace it with a new instance
    pub fn define_component(&self, name: &str) -> Handle {
        let handle = Handle(self.fresh());
        let mut components = self.components.write();
        components.retain(|(n, _)| n != name);
        components.push((name.to_string(), handle));
        handle
    }

    pub fn remove_component(&self, name: &str) {
        self.components.write().retain(|(n, _)| n != name);
    }

    fn function(&self, handle: Handle) -> Result<Arc<FunctionDef>> {
        self.functions
            .get(&handle)
            .map(|def| def.clone())
            .ok_or_else(|| CheckpointError::Engine(format!("{} is not a function", handle)))
    }

    fn finish(&self, builder: Builder, script: &str) -> FunctionNode {
        let handle = Handle(self.fresh());
        let code = CodeId(self.fresh());
        let bytes = builder
            .ops
            .iter()
            .map(Op::render)
            .collect::<Vec<_>>()
            .join("\n")
            .into_bytes();
        self.code.insert(code, bytes);
        self.functions.insert(
            handle,
            Arc::new(FunctionDef {
                code,
                name: builder.name.clone(),
                script: script.to_string(),
                ops: builder.ops,
                children: builder.children.iter().map(|c| c.handle).collect(),
            }),
        );
        FunctionNode {
            handle,
            name: Some(builder.name),
            children: builder.children,
        }
    }

    /// Run a script from the top until it first suspends or finishes
    pub fn start(&self, path: &str) -> Result<Step<Suspended>> {
        let script = self
            .load(path)?
            .ok_or_else(|| CheckpointError::Engine(format!("no script at {}", path)))?;
        self.start_compiled(&script)
    }

    /// Run a script compiled by this engine, e.g. one served by a
    /// [`ScriptRepository`](crate::scripts::ScriptRepository)
    pub fn start_compiled(&self, script: &CompiledScript) -> Result<Step<Suspended>> {
        self.run(Suspended {
            frames: vec![(script.root.handle, 0)],
            answers: Vec::new(),
            components: Vec::new(),
        })
    }

    fn run(&self, mut computation: Suspended) -> Result<Step<Suspended>> {
        loop {
            let Some(&(handle, pc)) = computation.frames.last() else {
                return Ok(Step::Finished(Value::List(computation.answers)));
            };
            let def = self.function(handle)?;
            let Some(op) = def.ops.get(pc) else {
                computation.frames.pop();
                continue;
            };
            if let Some(top) = computation.frames.last_mut() {
                top.1 += 1;
            }
            match op {
                Op::Ask(prompt) => {
                    return Ok(Step::Suspended {
                        computation,
                        output: Value::Str(prompt.clone()),
                    })
                }
                Op::Call(n) => {
                    let child = def.children.get(*n).copied().ok_or_else(|| {
                        CheckpointError::Engine(format!("{} has no nested function {}", def.name, n))
                    })?;
                    computation.frames.push((child, 0));
                }
                Op::Use(name) => {
                    let component = self.lookup(name).ok_or_else(|| {
                        CheckpointError::Engine(format!("no component named {}", name))
                    })?;
                    computation.components.push(component);
                }
            }
        }
    }

    fn host(&self) -> Value {
        Value::object(HOST_CLASS, [("engine", Value::from("scripted"))])
    }
}

fn parse_error(path: &str, line: usize, message: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Script {
        path: path.to_string(),
        message: format!("line {}: {}", line, message),
    }
}

impl ScriptCompiler for ScriptedEngine {
    fn compile(&self, path: &str, source: &str) -> Result<CompiledScript> {
        let mut stack = vec![Builder {
            name: "main".to_string(),
            ops: Vec::new(),
            children: Vec::new(),
        }];
        for (number, raw) in source.lines().enumerate() {
            let line_no = number + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if line == "}" {
                if stack.len() == 1 {
                    return Err(parse_error(path, line_no, "unmatched }"));
                }
                if let Some(done) = stack.pop() {
                    let node = self.finish(done, path);
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
                continue;
            }
            let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
            let rest = rest.trim();
            let op = match word {
                "fn" => {
                    let name = rest.strip_suffix('{').map(str::trim).unwrap_or("");
                    if name.is_empty() {
                        return Err(parse_error(path, line_no, "expected `fn <name> {`"));
                    }
                    stack.push(Builder {
                        name: name.to_string(),
                        ops: Vec::new(),
                        children: Vec::new(),
                    });
                    continue;
                }
                "ask" => Op::Ask(rest.to_string()),
                "call" => Op::Call(
                    rest.parse()
                        .map_err(|_| parse_error(path, line_no, "call expects an index"))?,
                ),
                "use" if !rest.is_empty() => Op::Use(rest.to_string()),
                _ => return Err(parse_error(path, line_no, format!("unknown instruction {:?}", line))),
            };
            if let Some(current) = stack.last_mut() {
                current.ops.push(op);
            }
        }
        if stack.len() != 1 {
            return Err(parse_error(path, source.lines().count(), "unclosed fn block"));
        }
        let root = stack
            .pop()
            .map(|builder| self.finish(builder, path))
            .ok_or_else(|| parse_error(path, 0, "empty script"))?;
        Ok(CompiledScript::new(path, root))
    }
}

impl ScriptSource for ScriptedEngine {
    /// Compile the current source of `path` unless the cached build is current
    fn load(&self, path: &str) -> Result<Option<Arc<CompiledScript>>> {
        let Some((version, source)) = self.sources.read().get(path).cloned() else {
            return Ok(None);
        };
        if let Some((built, script)) = self.compiled.read().get(path) {
            if *built == version {
                return Ok(Some(script.clone()));
            }
        }
        let script = Arc::new(self.compile(path, &source)?);
        self.compiled
            .write()
            .insert(path.to_string(), (version, script.clone()));
        Ok(Some(script))
    }
}

impl ComponentSource for ScriptedEngine {
    fn component_names(&self) -> Vec<String> {
        self.components.read().iter().map(|(n, _)| n.clone()).collect()
    }

    fn lookup(&self, name: &str) -> Option<Handle> {
        self.components
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| *h)
    }
}

fn engine_error(message: &str) -> CheckpointError {
    CheckpointError::Engine(format!("malformed computation graph: {}", message))
}

impl Engine for ScriptedEngine {
    type Computation = Suspended;

    fn object_graph(&self, computation: &Suspended) -> Result<Value> {
        let frames = computation
            .frames
            .iter()
            .map(|(handle, pc)| {
                Value::object(
                    "Frame",
                    [("function", Value::Ref(*handle)), ("pc", Value::Int(*pc as i64))],
                )
            })
            .collect();
        Ok(Value::object(
            "Computation",
            [
                ("frames", Value::List(frames)),
                ("answers", Value::List(computation.answers.clone())),
                (
                    "components",
                    Value::List(computation.components.iter().map(|h| Value::Ref(*h)).collect()),
                ),
                ("host", self.host()),
            ],
        ))
    }

    fn rebuild(&self, graph: Value) -> Result<Suspended> {
        let frames = graph
            .field("frames")
            .and_then(Value::as_list)
            .ok_or_else(|| engine_error("frames"))?
            .iter()
            .map(|frame| {
                let function = frame
                    .field("function")
                    .and_then(Value::as_ref_handle)
                    .ok_or_else(|| engine_error("frame function"))?;
                let pc = frame
                    .field("pc")
                    .and_then(Value::as_int)
                    .ok_or_else(|| engine_error("frame pc"))?;
                Ok((function, pc as usize))
            })
            .collect::<Result<Vec<_>>>()?;
        let answers = graph
            .field("answers")
            .and_then(Value::as_list)
            .ok_or_else(|| engine_error("answers"))?
            .to_vec();
        let components = graph
            .field("components")
            .and_then(Value::as_list)
            .ok_or_else(|| engine_error("components"))?
            .iter()
            .map(|c| c.as_ref_handle().ok_or_else(|| engine_error("component")))
            .collect::<Result<Vec<_>>>()?;
        match graph.field("host") {
            Some(Value::Object { class, .. }) if class == HOST_CLASS => {}
            _ => return Err(engine_error("host")),
        }
        Ok(Suspended {
            frames,
            answers,
            components,
        })
    }

    fn walk_frames(&self, computation: &Suspended) -> Result<Vec<Frame>> {
        computation
            .frames
            .iter()
            .rev()
            .map(|(handle, _)| {
                let def = self.function(*handle)?;
                Ok(Frame {
                    code: def.code,
                    function: def.name.clone(),
                    source: def.script.clone(),
                })
            })
            .collect()
    }

    fn compiled_code_bytes_of(&self, frame: &Frame) -> Result<Vec<u8>> {
        self.code
            .get(&frame.code)
            .map(|bytes| bytes.clone())
            .ok_or_else(|| CheckpointError::Engine(format!("unknown {}", frame.code)))
    }

    fn runtime_helper(&self, name: &str) -> Option<Value> {
        (name == HOST_CLASS).then(|| self.host())
    }

    fn resume(&self, mut computation: Suspended, input: Value) -> Result<Step<Suspended>> {
        computation.answers.push(input);
        self.run(computation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = "\
ask name?
fn confirm {
  ask sure?
}
call 0
ask done?
";

    fn engine() -> ScriptedEngine {
        let engine = ScriptedEngine::new();
        engine.set_source("flow.s", FLOW);
        engine
    }

    fn answer(engine: &ScriptedEngine, step: Step<Suspended>, input: &str) -> Step<Suspended> {
        let computation = step.into_suspended().unwrap();
        engine.resume(computation, Value::from(input)).unwrap()
    }

    #[test]
    fn test_runs_until_finished() {
        let engine = engine();
        let step = engine.start("flow.s").unwrap();
        assert_eq!(step.output(), &Value::from("name?"));
        let step = answer(&engine, step, "ada");
        assert_eq!(step.output(), &Value::from("sure?"));
        let step = answer(&engine, step, "yes");
        assert_eq!(step.output(), &Value::from("done?"));
        let step = answer(&engine, step, "ok");
        assert_eq!(
            step.output(),
            &Value::List(vec!["ada".into(), "yes".into(), "ok".into()])
        );
        assert!(step.into_suspended().is_none());
    }

    #[test]
    fn test_frames_innermost_first() {
        let engine = engine();
        let step = answer(&engine, engine.start("flow.s").unwrap(), "ada");
        let computation = step.into_suspended().unwrap();
        let frames = engine.walk_frames(&computation).unwrap();
        let names: Vec<_> = frames.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["confirm", "main"]);
        assert_eq!(engine.compiled_code_bytes_of(&frames[0]).unwrap(), b"ask sure?");
    }

    #[test]
    fn test_graph_round_trip() {
        let engine = engine();
        engine.define_component("cache");
        engine.set_source("flow.s", &format!("use cache\n{}", FLOW));
        let computation = engine.start("flow.s").unwrap().into_suspended().unwrap();
        let graph = engine.object_graph(&computation).unwrap();
        assert_eq!(engine.rebuild(graph).unwrap(), computation);
        assert_eq!(computation.components().len(), 1);
    }

    #[test]
    fn test_recompile_assigns_fresh_ids() {
        let engine = engine();
        let first = engine.load("flow.s").unwrap().unwrap();
        let cached = engine.load("flow.s").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        engine.set_source("flow.s", FLOW);
        let second = engine.load("flow.s").unwrap().unwrap();
        assert_ne!(first.root.handle, second.root.handle);
        assert_eq!(second.root.children.len(), 1);
        assert_eq!(second.root.children[0].name.as_deref(), Some("confirm"));
    }

    #[test]
    fn test_parse_errors() {
        let engine = ScriptedEngine::new();
        for source in ["}", "fn a {\nask x", "jump 3", "call x", "fn {\n}"] {
            let err = engine.compile("bad.s", source).unwrap_err();
            assert!(matches!(err, CheckpointError::Script { .. }), "{:?}", source);
        }
    }

    #[test]
    fn test_components() {
        let engine = ScriptedEngine::new();
        let first = engine.define_component("cache");
        let second = engine.define_component("cache");
        assert_ne!(first, second);
        assert_eq!(engine.lookup("cache"), Some(second));
        assert_eq!(engine.component_names(), vec!["cache".to_string()]);
        engine.remove_component("cache");
        assert_eq!(engine.lookup("cache"), None);
    }
}
