//! Running programs.

use std::{collections::HashMap, convert::TryFrom, fmt, ops::Range};

use log::trace;
use thiserror::Error;

use super::{Instr, Opcode, StackId};
use crate::{
    matcher::{CompiledMatcher, MatcherError},
    Program, ThunkInfo,
};

/// Limits on a single run.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Give up after executing this many instructions.
    pub max_steps: Option<usize>,
    /// Deepest either stack may grow.
    pub max_stack_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_steps: None,
            max_stack_depth: 10_000,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("gave up after {0} steps")]
    StepLimit(usize),
    #[error("the {stack} stack grew past {depth} entries at instruction {addr}")]
    StackOverflow {
        stack: StackId,
        depth: usize,
        addr: usize,
    },
    #[error("instruction {addr} popped the empty {stack} stack")]
    StackUnderflow { stack: StackId, addr: usize },
    #[error("jumped to {0}, outside the program")]
    BadAddress(i32),
    #[error("instruction {addr} names stack {operand}, which doesn't exist")]
    BadStack { operand: i32, addr: usize },
    #[error("instruction {addr} uses {table} index {idx}, which is out of bounds")]
    BadIndex {
        table: &'static str,
        idx: i32,
        addr: usize,
    },
    #[error("instruction {addr} pushed the position {value}, which is not a position")]
    BadPosition { value: i32, addr: usize },
    #[error("label {label:?} is not bound when instruction {addr} runs")]
    UnboundLabel { label: String, addr: usize },
    #[error(transparent)]
    Matcher(#[from] MatcherError),
}

/// What the grammar's code blocks are handed to.
pub trait Host {
    type Value;

    /// Run the grammar's initializer, once per run.
    fn init(&mut self, _code: &str) {}

    fn action(&mut self, call: &ThunkCall<'_>) -> Self::Value;

    fn predicate(&mut self, call: &ThunkCall<'_>) -> bool;
}

/// One invocation of a code block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkCall<'a> {
    /// Index into the program's action or predicate table.
    pub index: usize,
    pub code: &'a str,
    /// Labels and the input they matched, in parameter order.
    pub args: Vec<(&'a str, &'a str)>,
    /// Byte offset of the cursor.
    pub position: usize,
}

impl<'a> ThunkCall<'a> {
    pub fn arg(&self, label: &str) -> Option<&'a str> {
        self.args
            .iter()
            .find(|(name, _)| *name == label)
            .map(|&(_, text)| text)
    }
}

/// The result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<V> {
    pub matched: bool,
    /// Where the cursor was left.
    pub end: usize,
    /// What the last action kept on the successful path returned.
    pub value: Option<V>,
    /// The failed match that got furthest into the input, if any match failed.
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Byte offset in the input.
    pub position: usize,
    /// Address of the `Match` instruction.
    pub addr: usize,
    /// Display name of the rule it belongs to.
    pub rule: Option<String>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(rule) = &self.rule {
            write!(f, "rule {} ", rule)?;
        }
        write!(
            f,
            "failed at instruction {} (input position {})",
            self.addr, self.position
        )
    }
}

/// Runs one program against any number of inputs.
#[derive(Debug)]
pub struct Vm<'p> {
    program: &'p Program,
    matchers: Vec<CompiledMatcher>,
    config: VmConfig,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p Program) -> Result<Self, VmError> {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: &'p Program, config: VmConfig) -> Result<Self, VmError> {
        let matchers = program
            .matchers
            .iter()
            .map(|m| m.compile())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Vm {
            program,
            matchers,
            config,
        })
    }

    pub fn run<H: Host>(&self, input: &str, host: &mut H) -> Result<Outcome<H::Value>, VmError> {
        if !self.program.init.is_empty() {
            host.init(&self.program.init);
        }

        let mut executor = Executor {
            program: self.program,
            matchers: &self.matchers,
            config: &self.config,
            input,
            host,
            pc: 0,
            cursor: 0,
            fail: false,
            call_stack: Vec::new(),
            position_stack: Vec::new(),
            frames: vec![Frame::default()],
            values: Vec::new(),
            furthest: None,
        };
        executor.execute()?;

        let failure = executor.furthest.map(|(position, addr)| Failure {
            position,
            addr,
            rule: self.program.rule_name_at(addr).map(str::to_owned),
        });
        Ok(Outcome {
            matched: !executor.fail,
            end: executor.cursor,
            value: executor.values.pop(),
            failure,
        })
    }
}

/// A position stack entry.
#[derive(Debug, Clone, Copy)]
struct Saved {
    position: usize,
    /// How many action results there were, so backtracking can drop later ones.
    values: usize,
}

/// The labels bound during one rule invocation.
#[derive(Debug, Default)]
struct Frame {
    /// Height of the call stack just after the `Call` that opened this frame.
    depth: usize,
    bindings: HashMap<usize, Range<usize>>,
}

struct Executor<'p, 'i, 'h, H: Host> {
    program: &'p Program,
    matchers: &'p [CompiledMatcher],
    config: &'p VmConfig,
    input: &'i str,
    host: &'h mut H,

    pc: usize,
    cursor: usize,
    fail: bool,
    call_stack: Vec<i32>,
    position_stack: Vec<Saved>,
    frames: Vec<Frame>,
    /// Results of the actions on the path taken so far; the last one is the current value.
    values: Vec<H::Value>,
    /// Input position and address of the failed match that got the furthest.
    furthest: Option<(usize, usize)>,
}

impl<'p, 'i: 'p, H: Host> Executor<'p, 'i, '_, H> {
    fn execute(&mut self) -> Result<(), VmError> {
        let mut steps = 0usize;
        loop {
            if let Some(max) = self.config.max_steps {
                if steps >= max {
                    return Err(VmError::StepLimit(steps));
                }
            }
            steps += 1;

            let addr = self.pc;
            let instr: Instr = *self
                .program
                .instrs
                .get(addr)
                .ok_or_else(|| VmError::BadAddress(addr as i32))?;
            let (op, argc, a0, a1, _) = instr.decode();
            trace!(
                "{:04} {:<16} cursor {} fail {}",
                addr,
                instr.to_string(),
                self.cursor,
                self.fail
            );
            self.pc += 1;

            match op {
                Opcode::Push => {
                    let stack = self.stack_operand(a0, addr)?;
                    match stack {
                        StackId::Call => {
                            let value = if argc == 2 { a1 } else { self.cursor as i32 };
                            self.check_depth(stack, self.call_stack.len(), addr)?;
                            self.call_stack.push(value);
                        }
                        StackId::Position => {
                            let value = if argc == 2 {
                                usize::try_from(a1)
                                    .map_err(|_| VmError::BadPosition { value: a1, addr })?
                            } else {
                                self.cursor
                            };
                            self.check_depth(stack, self.position_stack.len(), addr)?;
                            self.position_stack.push(Saved {
                                position: value,
                                values: self.values.len(),
                            });
                        }
                    }
                }
                Opcode::Pop => match self.stack_operand(a0, addr)? {
                    StackId::Call => {
                        self.pop_call(addr)?;
                    }
                    StackId::Position => {
                        self.pop_position(addr)?;
                    }
                },
                Opcode::Call => {
                    let target = self.pop_call(addr)?;
                    self.check_depth(StackId::Call, self.call_stack.len(), addr)?;
                    self.call_stack.push(self.pc as i32);
                    self.frames.push(Frame {
                        depth: self.call_stack.len(),
                        bindings: HashMap::new(),
                    });
                    self.jump(target)?;
                }
                Opcode::Return => {
                    // Loops return to continuations too; only a rule's return closes its frame.
                    let depth = self.call_stack.len();
                    let closes_frame = self.frames.len() > 1
                        && self.frames.last().map(|frame| frame.depth) == Some(depth);
                    if closes_frame {
                        self.frames.pop();
                    }
                    let target = self.pop_call(addr)?;
                    self.jump(target)?;
                }
                Opcode::Exit => return Ok(()),
                Opcode::Match => {
                    let matcher = self.matchers.get(a0 as usize).ok_or(VmError::BadIndex {
                        table: "matcher",
                        idx: a0,
                        addr,
                    })?;
                    match matcher.match_at(self.input, self.cursor) {
                        Some(len) => {
                            self.cursor += len;
                            self.fail = false;
                        }
                        None => {
                            self.fail = true;
                            let further = self
                                .furthest
                                .map_or(true, |(position, _)| self.cursor > position);
                            if further {
                                self.furthest = Some((self.cursor, addr));
                            }
                        }
                    }
                }
                Opcode::RestoreIfF => {
                    let saved = self.pop_position(addr)?;
                    if self.fail {
                        self.cursor = saved.position;
                        self.values.truncate(saved.values);
                    }
                }
                Opcode::Jump => self.jump(a0)?,
                Opcode::JumpIfF => {
                    if self.fail {
                        self.jump(a0)?;
                    }
                }
                Opcode::JumpIfNotF => {
                    if !self.fail {
                        self.jump(a0)?;
                    }
                }
                Opcode::CallA => {
                    let program = self.program;
                    let thunk = self.thunk(&program.actions, "action", a0, addr)?;
                    let call = self.thunk_call(thunk, a0 as usize, addr)?;
                    let value = self.host.action(&call);
                    self.values.push(value);
                }
                Opcode::CallB => {
                    let program = self.program;
                    let thunk = self.thunk(&program.predicates, "predicate", a0, addr)?;
                    let call = self.thunk_call(thunk, a0 as usize, addr)?;
                    self.fail = !self.host.predicate(&call);
                }
                Opcode::NotF => self.fail = !self.fail,
                Opcode::StoreIfT => {
                    let start = self.pop_position(addr)?.position;
                    if !self.fail {
                        if a0 < 0 || a0 as usize >= self.program.strings.len() {
                            return Err(VmError::BadIndex {
                                table: "string",
                                idx: a0,
                                addr,
                            });
                        }
                        let cursor = self.cursor;
                        if let Some(frame) = self.frames.last_mut() {
                            frame.bindings.insert(a0 as usize, start..cursor);
                        }
                    }
                }
            }
        }
    }

    fn stack_operand(&self, operand: i32, addr: usize) -> Result<StackId, VmError> {
        StackId::from_operand(operand).ok_or(VmError::BadStack { operand, addr })
    }

    fn check_depth(&self, stack: StackId, len: usize, addr: usize) -> Result<(), VmError> {
        if len >= self.config.max_stack_depth {
            Err(VmError::StackOverflow {
                stack,
                depth: self.config.max_stack_depth,
                addr,
            })
        } else {
            Ok(())
        }
    }

    fn pop_call(&mut self, addr: usize) -> Result<i32, VmError> {
        self.call_stack.pop().ok_or(VmError::StackUnderflow {
            stack: StackId::Call,
            addr,
        })
    }

    fn pop_position(&mut self, addr: usize) -> Result<Saved, VmError> {
        self.position_stack.pop().ok_or(VmError::StackUnderflow {
            stack: StackId::Position,
            addr,
        })
    }

    fn jump(&mut self, target: i32) -> Result<(), VmError> {
        match usize::try_from(target) {
            Ok(target) if target < self.program.instrs.len() => {
                self.pc = target;
                Ok(())
            }
            _ => Err(VmError::BadAddress(target)),
        }
    }

    fn thunk(
        &self,
        table: &'p [ThunkInfo],
        name: &'static str,
        idx: i32,
        addr: usize,
    ) -> Result<&'p ThunkInfo, VmError> {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| table.get(idx))
            .ok_or(VmError::BadIndex {
                table: name,
                idx,
                addr,
            })
    }

    /// Gather a thunk's arguments from the current frame.
    fn thunk_call(
        &self,
        thunk: &'p ThunkInfo,
        index: usize,
        addr: usize,
    ) -> Result<ThunkCall<'p>, VmError> {
        let program: &'p Program = self.program;
        let input: &'i str = self.input;
        let frame = self.frames.last();
        let mut args = Vec::with_capacity(thunk.params.len());
        for &label in thunk.params.iter() {
            let name = program.strings.get(label).map_or("?", String::as_str);
            let span = frame
                .and_then(|frame| frame.bindings.get(&label))
                .ok_or_else(|| VmError::UnboundLabel {
                    label: name.to_owned(),
                    addr,
                })?;
            let text = input.get(span.clone()).unwrap_or("");
            args.push((name, text));
        }
        Ok(ThunkCall {
            index,
            code: &thunk.code,
            args,
            position: self.cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Grammar;

    /// Records every action, answering predicates by their code.
    #[derive(Default)]
    struct Recorder {
        inits: Vec<String>,
        actions: Vec<String>,
    }

    impl Host for Recorder {
        type Value = String;

        fn init(&mut self, code: &str) {
            self.inits.push(code.to_owned());
        }

        fn action(&mut self, call: &ThunkCall<'_>) -> String {
            let args = call
                .args
                .iter()
                .map(|(label, text)| format!("{}={}", label, text))
                .collect::<Vec<_>>()
                .join(",");
            let rendered = format!("{}({})", call.code, args);
            self.actions.push(rendered.clone());
            rendered
        }

        fn predicate(&mut self, call: &ThunkCall<'_>) -> bool {
            match call.code {
                "true" => true,
                "false" => false,
                "short" => call.arg("w").map_or(false, |w| w.len() < 3),
                other => panic!("unexpected predicate {:?}", other),
            }
        }
    }

    fn program(grammar: &str) -> Program {
        Grammar::read(grammar, "test".to_owned())
            .unwrap()
            .to_program()
            .unwrap()
    }

    fn run(grammar: &str, input: &str) -> Outcome<String> {
        let program = program(grammar);
        let vm = Vm::new(&program).unwrap();
        vm.run(input, &mut Recorder::default()).unwrap()
    }

    /// Whether the grammar matches the whole input.
    fn accepts(grammar: &str, input: &str) -> bool {
        let outcome = run(grammar, input);
        outcome.matched && outcome.end == input.len()
    }

    #[test]
    fn literal() {
        let outcome = run("A = 'ab'", "abc");
        assert!(outcome.matched);
        assert_eq!(outcome.end, 2);
        assert_eq!(outcome.value, None);

        let outcome = run("A = 'ab'", "ax");
        assert!(!outcome.matched);
        assert_eq!(outcome.end, 0);
    }

    #[test]
    fn sequence_backtracks_to_its_start() {
        let grammar = "A = 'a' 'b' 'c' / 'a' 'b' 'd'";
        assert!(accepts(grammar, "abd"));
        assert!(accepts(grammar, "abc"));
        let outcome = run(grammar, "abx");
        assert!(!outcome.matched);
        assert_eq!(outcome.end, 0);
    }

    #[test]
    fn ordered_choice() {
        // the first alternative wins even though the second would go further
        let outcome = run("A = 'a' / 'ab'", "ab");
        assert!(outcome.matched);
        assert_eq!(outcome.end, 1);
        assert!(accepts("A = ('a' / 'b' / 'c')+", "cab"));
    }

    #[test]
    fn repetition() {
        assert!(accepts("A = 'a'*", ""));
        assert!(accepts("A = 'a'*", "aaaa"));
        assert!(!accepts("A = 'a'+", ""));
        assert!(accepts("A = 'a'+", "a"));
        assert!(accepts("A = 'a'+", "aaa"));
        assert!(accepts("A = 'a'+ 'b'", "aab"));
        assert!(!accepts("A = 'a'+ 'b'", "b"));
        assert!(accepts("A = ('a' 'b')+ 'a'", "ababa"));

        // a failed first iteration leaves the cursor alone
        let outcome = run("A = ('a' 'b')+ / 'a'", "ac");
        assert!(outcome.matched);
        assert_eq!(outcome.end, 1);
    }

    #[test]
    fn optional() {
        assert!(accepts("A = 'a'? 'b'", "b"));
        assert!(accepts("A = 'a'? 'b'", "ab"));
        assert!(!accepts("A = 'a'? 'b'", "aab"));
    }

    #[test]
    fn predicates_consume_nothing() {
        assert!(accepts("A = &'a' [a-z]", "a"));
        assert!(!accepts("A = &'a' [a-z]", "b"));
        assert!(accepts("A = !'a' [a-z]", "b"));
        assert!(!accepts("A = !'a' [a-z]", "a"));
        assert!(accepts("A = [a-z]+ !.", "abc"));

        let outcome = run("A = &'ab'", "ab");
        assert!(outcome.matched);
        assert_eq!(outcome.end, 0);
    }

    #[test]
    fn semantic_predicates() {
        assert!(accepts("A = 'a' &{ true }", "a"));
        assert!(!accepts("A = 'a' &{ false }", "a"));
        assert!(accepts("A = 'a' !{ false }", "a"));
        assert!(accepts("A = w:[a-z]+ &{ short } / [a-z]+ '!'", "ab"));
        assert!(accepts("A = w:[a-z]+ &{ short } / [a-z]+ '!'", "abc!"));
        assert!(!accepts("A = w:[a-z]+ &{ short } / [a-z]+ '!'", "abc"));
    }

    #[test]
    fn actions_see_labels() {
        let program = program("A = k:Key '=' v:[0-9]+ { pair }\nKey = [a-z]+");
        let vm = Vm::new(&program).unwrap();
        let mut host = Recorder::default();
        let outcome = vm.run("name=42", &mut host).unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.value.as_deref(), Some("pair(k=name,v=42)"));
        assert_eq!(host.actions, vec!["pair(k=name,v=42)"]);
    }

    #[test]
    fn actions_only_run_on_success() {
        let program = program("A = ('a' 'b' { ab }) / 'a' 'c' { ac }");
        let vm = Vm::new(&program).unwrap();
        let mut host = Recorder::default();
        let outcome = vm.run("ac", &mut host).unwrap();
        assert!(outcome.matched);
        assert_eq!(host.actions, vec!["ac()"]);
    }

    #[test]
    fn backtracking_drops_action_results() {
        let outcome = run("A = ('a' { x }) 'z' / 'a'", "a");
        assert!(outcome.matched);
        assert_eq!(outcome.end, 1);
        assert_eq!(outcome.value, None);

        // an earlier result on the kept path survives a later failed branch
        let outcome = run("A = ('a' { kept }) (('b' { dropped }) 'z' / 'b')", "ab");
        assert!(outcome.matched);
        assert_eq!(outcome.value.as_deref(), Some("kept()"));

        // lookahead never keeps what its body produced
        let outcome = run("A = &('a' { peeked }) 'a'", "a");
        assert!(outcome.matched);
        assert_eq!(outcome.value, None);
    }

    #[test]
    fn labels_are_per_invocation() {
        // the inner List call binds its own x, which must not clobber the outer one
        let grammar = "List = '(' x:[a-z] List? ')' { item }";
        let program = program(grammar);
        let vm = Vm::new(&program).unwrap();
        let mut host = Recorder::default();
        let outcome = vm.run("(a(b))", &mut host).unwrap();
        assert!(outcome.matched);
        assert_eq!(host.actions, vec!["item(x=b)", "item(x=a)"]);
    }

    #[test]
    fn labels_inside_loops() {
        let program = program("A = first:[a-z] (n:[0-9] { digit })+ { done }");
        let vm = Vm::new(&program).unwrap();
        let mut host = Recorder::default();
        assert!(vm.run("x12", &mut host).unwrap().matched);
        assert_eq!(
            host.actions,
            vec!["digit(first=x,n=1)", "digit(first=x,n=2)", "done(first=x)"]
        );
    }

    #[test]
    fn init_runs_first() {
        let program = program("{ setup }\nA = 'a'");
        let vm = Vm::new(&program).unwrap();
        let mut host = Recorder::default();
        vm.run("a", &mut host).unwrap();
        vm.run("a", &mut host).unwrap();
        assert_eq!(host.inits, vec!["setup", "setup"]);
    }

    #[test]
    fn failure_names_the_furthest_rule() {
        let program = program("A = B C\nB = 'x'+\nC \"the end\" = ';' ';'");
        let vm = Vm::new(&program).unwrap();
        let outcome = vm.run("xxx;!", &mut Recorder::default()).unwrap();
        assert!(!outcome.matched);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.position, 4);
        assert_eq!(failure.rule.as_deref(), Some("the end"));
        assert_eq!(
            failure.to_string(),
            format!(
                "rule the end failed at instruction {} (input position 4)",
                failure.addr
            )
        );
        assert_eq!(
            program.describe_failure(failure.addr),
            format!("rule the end failed at instruction {}", failure.addr)
        );
        assert_eq!(program.describe_failure(0), "failed at instruction 0");
    }

    #[test]
    fn step_limit() {
        // a loop over something that matches nothing never ends on its own
        let program = program("A = ('a'?)*");
        let config = VmConfig {
            max_steps: Some(1_000),
            ..VmConfig::default()
        };
        let vm = Vm::with_config(&program, config).unwrap();
        assert_eq!(
            vm.run("b", &mut Recorder::default()),
            Err(VmError::StepLimit(1_000))
        );
    }

    #[test]
    fn deep_recursion_overflows() {
        let program = program("A = ('(' A ')')?");
        let config = VmConfig {
            max_stack_depth: 64,
            ..VmConfig::default()
        };
        let vm = Vm::with_config(&program, config).unwrap();
        let deep = "(".repeat(100);
        assert!(matches!(
            vm.run(&deep, &mut Recorder::default()),
            Err(VmError::StackOverflow { .. })
        ));
        assert!(vm.run("((()))", &mut Recorder::default()).unwrap().matched);
    }

    #[test]
    fn bad_class_is_reported() {
        let program = program("A = [z-a]");
        assert!(matches!(
            Vm::new(&program),
            Err(VmError::Matcher(MatcherError::BackwardsRange { .. }))
        ));
    }
}
