//! Compile parsing expression grammars into programs for a small backtracking machine.
//!
//! ```text
//! grammar text --parse--> Grammar --generate--> Program --Vm::run--> Outcome
//! ```
//!
//! See [`vm`] for the instruction set.

#![allow(clippy::new_without_default)]

#[macro_use]
extern crate derivative;

pub mod display;
pub mod matcher;
pub mod parse;
pub mod vm;

use itertools::Itertools;

pub use matcher::Matcher;
pub use parse::{GrammarParseError, GrammarParseErrorInfo};
pub use vm::{GenerateError, Instr, Opcode, StackId};

/// A whole grammar: an optional initializer and rules, the first of which is the entry point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grammar {
    /// Code run once before parsing starts.
    pub init: Option<String>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    /// Human-facing name used in messages. Falls back to `name`.
    pub display_name: Option<String>,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal { text: String, ignore_case: bool },
    CharClass { pattern: String },
    AnyChar,
    Sequence(Vec<Expr>),
    /// Ordered choice: the first alternative to succeed wins.
    Choice(Vec<Expr>),
    ZeroOrMore(Box<Expr>),
    OneOrMore(Box<Expr>),
    Optional(Box<Expr>),
    /// Succeeds iff the child does, consuming nothing.
    AndPredicate(Box<Expr>),
    /// Succeeds iff the child fails, consuming nothing.
    NotPredicate(Box<Expr>),
    Labeled { label: String, expr: Box<Expr> },
    Action { expr: Box<Expr>, code: String },
    /// A semantic predicate, decided by running code.
    Predicate { code: String },
    RuleRef(String),
}

impl Expr {
    pub fn literal(text: impl Into<String>) -> Expr {
        Expr::Literal {
            text: text.into(),
            ignore_case: false,
        }
    }

    pub fn class(pattern: impl Into<String>) -> Expr {
        Expr::CharClass {
            pattern: pattern.into(),
        }
    }

    pub fn rule_ref(name: impl Into<String>) -> Expr {
        Expr::RuleRef(name.into())
    }

    pub fn labeled(label: impl Into<String>, expr: Expr) -> Expr {
        Expr::Labeled {
            label: label.into(),
            expr: Box::new(expr),
        }
    }

    pub fn action(expr: Expr, code: impl Into<String>) -> Expr {
        Expr::Action {
            expr: Box::new(expr),
            code: code.into(),
        }
    }

    pub fn predicate(code: impl Into<String>) -> Expr {
        Expr::Predicate { code: code.into() }
    }
}

impl Rule {
    pub fn new(name: impl Into<String>, expr: Expr) -> Rule {
        Rule {
            name: name.into(),
            display_name: None,
            expr,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

impl Grammar {
    pub fn new(rules: Vec<Rule>) -> Grammar {
        Grammar { init: None, rules }
    }

    /// Read a grammar from its text form.
    pub fn read(s: &str, source_name: String) -> Result<Grammar, GrammarParseError> {
        parse::read_grammar(s, source_name)
    }

    pub fn to_program(&self) -> Result<Program, GenerateError> {
        vm::Generator::new().generate(self)
    }
}

/// Code lifted out of the grammar, to be run by the host when the machine reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkInfo {
    /// The code, verbatim.
    pub code: String,
    /// String indices of the labels passed to the code, in order.
    pub params: Vec<usize>,
    /// Index of the rule the code appears in.
    pub rule: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleInfo {
    /// String index of the rule's name.
    pub name: usize,
    /// String index of the rule's display name; the same as `name` if it has none.
    pub display_name: usize,
    /// Address of the rule's first instruction.
    pub entry: usize,
}

/// A compiled grammar.
#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub struct Program {
    pub init: String,
    #[derivative(Debug(format_with = "Program::instrs_formatter"))]
    pub instrs: Vec<Instr>,
    pub matchers: Vec<Matcher>,
    pub strings: Vec<String>,
    pub actions: Vec<ThunkInfo>,
    pub predicates: Vec<ThunkInfo>,
    /// For each instruction, the index of the rule it was generated for, or -1 for the prologue.
    pub instr_to_rule: Vec<i32>,
    pub rules: Vec<RuleInfo>,
}

impl Program {
    #[allow(clippy::ptr_arg)]
    fn instrs_formatter(instrs: &Vec<Instr>, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}]", instrs.iter().join(", "))
    }

    /// The raw words of the instruction stream.
    pub fn words(&self) -> Vec<u64> {
        self.instrs.iter().map(|instr| instr.to_word()).collect()
    }

    /// The display name of the rule the instruction at `addr` belongs to.
    pub fn rule_name_at(&self, addr: usize) -> Option<&str> {
        let rule = *self.instr_to_rule.get(addr)?;
        if rule < 0 {
            return None;
        }
        let info = self.rules.get(rule as usize)?;
        self.strings.get(info.display_name).map(String::as_str)
    }

    /// Explain a failure at the instruction at `addr`.
    pub fn describe_failure(&self, addr: usize) -> String {
        match self.rule_name_at(addr) {
            Some(name) => format!("rule {} failed at instruction {}", name, addr),
            None => format!("failed at instruction {}", addr),
        }
    }

    /// Names of the labels passed to a thunk, in order.
    pub fn param_names<'a>(&'a self, thunk: &'a ThunkInfo) -> impl Iterator<Item = &'a str> + 'a {
        thunk
            .params
            .iter()
            .map(move |&idx| self.strings.get(idx).map_or("?", String::as_str))
    }

    /// Summary line used by the command-line tool.
    pub fn stats(&self) -> String {
        [
            ("instructions", self.instrs.len()),
            ("rules", self.rules.len()),
            ("matchers", self.matchers.len()),
            ("strings", self.strings.len()),
            ("actions", self.actions.len()),
            ("predicates", self.predicates.len()),
        ]
        .iter()
        .map(|(what, count)| format!("{} {}", count, what))
        .join(", ")
    }
}
