//! Lowering grammars into programs.
//!
//! Every rule is compiled on its own into a fragment whose jumps are relative to the start of
//! that fragment and whose calls name rules by index. Once every fragment is written we know
//! where each one will land, so the fragments are laid out after the prologue and every
//! pending operand is turned into an absolute address.
//!
//! Each expression's code keeps the same promise: if it succeeds the fail flag is clear and
//! the cursor is past what it consumed, and if it fails the fail flag is set and the cursor
//! is back where it started. Both stacks are left as they were found.

use std::{collections::HashMap, convert::TryFrom};

use log::debug;
use thiserror::Error;

use super::{check_arity, tables::Tables, EncodeError, Instr, Opcode, StackId, MAX_PROGRAM_LEN};
use crate::{matcher::Matcher, Expr, Grammar, Program, RuleInfo, ThunkInfo};

/// Length of the code calling the first rule.
pub const PROLOGUE_LEN: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("the grammar has no rules")]
    NoRule,
    #[error("rule {0:?} is defined more than once")]
    DuplicateRule(String),
    #[error("rule {rule:?} refers to {name:?}, which is not a rule")]
    UndefinedRule { rule: String, name: String },
    #[error("a jump in rule {rule:?} was never given a target")]
    UnresolvedJump { rule: String },
    #[error("the program has too many {what} ({len}, at most {max})")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
    /// Sizes are checked before encoding, so this is a bug in the generator.
    #[error("internal error while encoding an instruction: {0}")]
    Encoding(#[from] EncodeError),
}

/// An operand whose final value may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Value(i32),
    /// Offset from the start of the current rule's code.
    Local(usize),
    /// Entry point of the rule with this index.
    Entry(usize),
    /// A forward jump waiting for [`Builder::patch`].
    Hole,
}

#[derive(Debug)]
struct Pending {
    op: Opcode,
    args: Vec<Operand>,
}

/// Turns a [`Grammar`] into a [`Program`].
#[derive(Debug)]
pub struct Generator {
    tables: Tables,
    /// Rule names to their index.
    rule_ids: HashMap<String, usize>,
}

impl Generator {
    pub fn new() -> Self {
        Generator {
            tables: Tables::new(),
            rule_ids: HashMap::new(),
        }
    }

    pub fn generate(mut self, grammar: &Grammar) -> Result<Program, GenerateError> {
        self.validate(grammar)?;
        let (fragments, mut rules) = self.compile_rules(grammar)?;
        resolve_entries(&mut rules, &fragments);

        let len = PROLOGUE_LEN + fragments.iter().map(Vec::len).sum::<usize>();
        check_size("instructions", len)?;
        let tables = self.tables.finish();
        check_size("matchers", tables.matchers.len())?;
        check_size("strings", tables.strings.len())?;
        check_size("actions", tables.actions.len())?;
        check_size("predicates", tables.predicates.len())?;

        let (instrs, instr_to_rule) = assemble(grammar, &rules, &fragments)?;
        debug!(
            "generated {} instructions for {} rules",
            instrs.len(),
            rules.len()
        );

        Ok(Program {
            init: grammar.init.clone().unwrap_or_default(),
            instrs,
            matchers: tables.matchers,
            strings: tables.strings,
            actions: tables.actions,
            predicates: tables.predicates,
            instr_to_rule,
            rules,
        })
    }

    fn validate(&mut self, grammar: &Grammar) -> Result<(), GenerateError> {
        if grammar.rules.is_empty() {
            return Err(GenerateError::NoRule);
        }
        for (idx, rule) in grammar.rules.iter().enumerate() {
            if self.rule_ids.insert(rule.name.clone(), idx).is_some() {
                return Err(GenerateError::DuplicateRule(rule.name.clone()));
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn compile_rules(
        &mut self,
        grammar: &Grammar,
    ) -> Result<(Vec<Vec<Pending>>, Vec<RuleInfo>), GenerateError> {
        let mut fragments = Vec::with_capacity(grammar.rules.len());
        let mut rules = Vec::with_capacity(grammar.rules.len());

        for (idx, rule) in grammar.rules.iter().enumerate() {
            let name = self.tables.insert_string(&rule.name);
            let display_name = match &rule.display_name {
                Some(display_name) => self.tables.insert_string(display_name),
                None => name,
            };

            let mut builder = Builder {
                code: Vec::new(),
                rule: idx,
                rule_name: &rule.name,
                tables: &mut self.tables,
                rule_ids: &self.rule_ids,
            };
            builder.write_expr(&rule.expr, &mut Scope::default())?;
            builder.op(Opcode::Return)?;

            debug!(
                "compiled rule {} into {} instructions",
                rule.name,
                builder.code.len()
            );
            fragments.push(builder.code);
            rules.push(RuleInfo {
                name,
                display_name,
                entry: 0,
            });
        }

        Ok((fragments, rules))
    }
}

/// Lay the rules out one after the other, right after the prologue.
fn resolve_entries(rules: &mut [RuleInfo], fragments: &[Vec<Pending>]) {
    let mut addr = PROLOGUE_LEN;
    for (info, code) in rules.iter_mut().zip(fragments) {
        info.entry = addr;
        addr += code.len();
    }
}

fn assemble(
    grammar: &Grammar,
    rules: &[RuleInfo],
    fragments: &[Vec<Pending>],
) -> Result<(Vec<Instr>, Vec<i32>), GenerateError> {
    let len = PROLOGUE_LEN + fragments.iter().map(Vec::len).sum::<usize>();
    let mut instrs = Vec::with_capacity(len);
    let mut instr_to_rule = Vec::with_capacity(len);

    let start = rules.first().ok_or(GenerateError::NoRule)?;
    instrs.push(Instr::encode(
        Opcode::Push,
        &[StackId::Call.operand(), address(start.entry)],
    )?);
    instrs.push(Instr::encode(Opcode::Call, &[])?);
    instrs.push(Instr::encode(Opcode::Exit, &[])?);
    instr_to_rule.resize(PROLOGUE_LEN, -1);

    for (idx, (info, code)) in rules.iter().zip(fragments).enumerate() {
        let unresolved = || GenerateError::UnresolvedJump {
            rule: grammar.rules[idx].name.clone(),
        };
        for pending in code {
            let args = pending
                .args
                .iter()
                .map(|&arg| match arg {
                    Operand::Value(value) => Ok(value),
                    Operand::Local(offset) => Ok(address(info.entry + offset)),
                    Operand::Entry(target) => rules
                        .get(target)
                        .map(|target| address(target.entry))
                        .ok_or_else(unresolved),
                    Operand::Hole => Err(unresolved()),
                })
                .collect::<Result<Vec<_>, _>>()?;
            instrs.push(Instr::encode(pending.op, &args)?);
            instr_to_rule.push(idx as i32);
        }
    }

    Ok((instrs, instr_to_rule))
}

fn check_size(what: &'static str, len: usize) -> Result<(), GenerateError> {
    if len > MAX_PROGRAM_LEN {
        return Err(GenerateError::TooLarge {
            what,
            len,
            max: MAX_PROGRAM_LEN,
        });
    }
    Ok(())
}

/// Anything too big for an operand fails when encoding.
fn address(addr: usize) -> i32 {
    i32::try_from(addr).unwrap_or(i32::MAX)
}

fn index(idx: usize) -> Operand {
    Operand::Value(address(idx))
}

/// Labels bound so far, as string indices, in binding order.
#[derive(Debug, Clone, Default)]
struct Scope {
    labels: Vec<usize>,
}

impl Scope {
    fn bind(&mut self, label: usize) {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
    }
}

/// Writes the code for one rule.
struct Builder<'g> {
    code: Vec<Pending>,
    rule: usize,
    rule_name: &'g str,
    tables: &'g mut Tables,
    rule_ids: &'g HashMap<String, usize>,
}

impl Builder<'_> {
    /// Write an expression's code.
    ///
    /// Sequences share `scope` with their children, so labels bound by one item are visible
    /// to later ones. Everything else gives its children a copy.
    fn write_expr(&mut self, expr: &Expr, scope: &mut Scope) -> Result<(), GenerateError> {
        match expr {
            Expr::Literal { text, ignore_case } => self.write_match(Matcher::Literal {
                text: text.clone(),
                ignore_case: *ignore_case,
            })?,
            Expr::CharClass { pattern } => self.write_match(Matcher::CharClass {
                pattern: pattern.clone(),
            })?,
            Expr::AnyChar => self.write_match(Matcher::Any)?,
            Expr::Sequence(items) => match items.split_last() {
                None => self.write_success()?,
                Some((only, [])) => self.write_expr(only, scope)?,
                Some((last, init)) => {
                    self.push_position()?;
                    let mut exits = Vec::with_capacity(init.len());
                    for item in init {
                        self.write_expr(item, scope)?;
                        exits.push(self.jump_forward(Opcode::JumpIfF)?);
                    }
                    self.write_expr(last, scope)?;
                    let exit = self.here();
                    for at in exits {
                        self.patch(at, exit);
                    }
                    self.op(Opcode::RestoreIfF)?;
                }
            },
            Expr::Choice(alts) => match alts.split_last() {
                None => self.write_failure()?,
                Some((last, init)) => {
                    let mut exits = Vec::with_capacity(init.len());
                    for alt in init {
                        self.push_position()?;
                        self.write_expr(alt, &mut scope.clone())?;
                        self.op(Opcode::RestoreIfF)?;
                        exits.push(self.jump_forward(Opcode::JumpIfNotF)?);
                    }
                    self.write_expr(last, &mut scope.clone())?;
                    let exit = self.here();
                    for at in exits {
                        self.patch(at, exit);
                    }
                }
            },
            Expr::ZeroOrMore(child) => {
                let top = self.push_position()?;
                self.write_expr(child, &mut scope.clone())?;
                self.op(Opcode::RestoreIfF)?;
                self.jump_back(Opcode::JumpIfNotF, top)?;
                // Only reached once an iteration failed.
                self.op(Opcode::NotF)?;
            }
            Expr::OneOrMore(child) => {
                // The top of the call stack says where to go when an iteration fails:
                // out with the fail flag still set if it was the first one,
                // or through a `NotF` otherwise.
                let first = self.emit(
                    Opcode::Push,
                    &[Operand::Value(StackId::Call.operand()), Operand::Hole],
                )?;
                let top = self.push_position()?;
                self.write_expr(child, &mut scope.clone())?;
                self.op(Opcode::RestoreIfF)?;
                let failed = self.jump_forward(Opcode::JumpIfF)?;
                self.emit(Opcode::Pop, &[Operand::Value(StackId::Call.operand())])?;
                let more = self.emit(
                    Opcode::Push,
                    &[Operand::Value(StackId::Call.operand()), Operand::Hole],
                )?;
                self.jump_back(Opcode::Jump, top)?;

                self.patch(failed, self.here());
                self.op(Opcode::Return)?;
                self.patch(more, self.here());
                self.op(Opcode::NotF)?;
                self.patch(first, self.here());
            }
            Expr::Optional(child) => {
                self.push_position()?;
                self.write_expr(child, &mut scope.clone())?;
                self.op(Opcode::RestoreIfF)?;
                let skip = self.jump_forward(Opcode::JumpIfNotF)?;
                self.op(Opcode::NotF)?;
                self.patch(skip, self.here());
            }
            Expr::AndPredicate(child) => {
                self.push_position()?;
                self.write_expr(child, &mut scope.clone())?;
                // Flip so a success is what gets restored, then flip back.
                self.op(Opcode::NotF)?;
                self.op(Opcode::RestoreIfF)?;
                self.op(Opcode::NotF)?;
            }
            Expr::NotPredicate(child) => {
                self.push_position()?;
                self.write_expr(child, &mut scope.clone())?;
                self.op(Opcode::NotF)?;
                self.op(Opcode::RestoreIfF)?;
            }
            Expr::Labeled { label, expr } => {
                let label = self.tables.insert_string(label);
                self.push_position()?;
                self.write_expr(expr, &mut scope.clone())?;
                self.emit(Opcode::StoreIfT, &[index(label)])?;
                scope.bind(label);
            }
            Expr::Action { expr, code } => {
                // Take the index first, so enclosing actions number before nested ones.
                let thunk = self.tables.insert_action(ThunkInfo {
                    code: code.clone(),
                    params: Vec::new(),
                    rule: self.rule,
                });
                let mut inner = scope.clone();
                self.write_expr(expr, &mut inner)?;
                self.tables.set_action_params(thunk, inner.labels);

                let skip = self.jump_forward(Opcode::JumpIfF)?;
                self.emit(Opcode::CallA, &[index(thunk)])?;
                self.patch(skip, self.here());
            }
            Expr::Predicate { code } => {
                let thunk = self.tables.insert_predicate(ThunkInfo {
                    code: code.clone(),
                    params: scope.labels.clone(),
                    rule: self.rule,
                });
                self.emit(Opcode::CallB, &[index(thunk)])?;
            }
            Expr::RuleRef(name) => {
                let target =
                    *self
                        .rule_ids
                        .get(name)
                        .ok_or_else(|| GenerateError::UndefinedRule {
                            rule: self.rule_name.to_owned(),
                            name: name.clone(),
                        })?;
                self.emit(
                    Opcode::Push,
                    &[Operand::Value(StackId::Call.operand()), Operand::Entry(target)],
                )?;
                self.op(Opcode::Call)?;
            }
        }
        Ok(())
    }

    fn write_match(&mut self, matcher: Matcher) -> Result<(), GenerateError> {
        let idx = self.tables.insert_matcher(matcher);
        self.push_position()?;
        self.emit(Opcode::Match, &[index(idx)])?;
        self.op(Opcode::RestoreIfF)?;
        Ok(())
    }

    /// Succeed without consuming anything.
    fn write_success(&mut self) -> Result<(), GenerateError> {
        let skip = self.jump_forward(Opcode::JumpIfNotF)?;
        self.op(Opcode::NotF)?;
        self.patch(skip, self.here());
        Ok(())
    }

    /// Fail without consuming anything.
    fn write_failure(&mut self) -> Result<(), GenerateError> {
        let skip = self.jump_forward(Opcode::JumpIfF)?;
        self.op(Opcode::NotF)?;
        self.patch(skip, self.here());
        Ok(())
    }

    /// Append an instruction, returning its offset in this rule.
    fn emit(&mut self, op: Opcode, args: &[Operand]) -> Result<usize, GenerateError> {
        check_arity(op, args.len())?;
        self.code.push(Pending {
            op,
            args: args.to_vec(),
        });
        Ok(self.code.len() - 1)
    }

    fn op(&mut self, op: Opcode) -> Result<usize, GenerateError> {
        self.emit(op, &[])
    }

    fn push_position(&mut self) -> Result<usize, GenerateError> {
        self.emit(Opcode::Push, &[Operand::Value(StackId::Position.operand())])
    }

    fn jump_forward(&mut self, op: Opcode) -> Result<usize, GenerateError> {
        self.emit(op, &[Operand::Hole])
    }

    fn jump_back(&mut self, op: Opcode, target: usize) -> Result<usize, GenerateError> {
        self.emit(op, &[Operand::Local(target)])
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    /// Point the hole in the instruction at `at` to the offset `target`.
    fn patch(&mut self, at: usize, target: usize) {
        let hole = self
            .code
            .get_mut(at)
            .and_then(|pending| pending.args.iter_mut().find(|arg| **arg == Operand::Hole));
        debug_assert!(
            hole.is_some(),
            "tried to patch instruction {} of rule {}, which has no hole",
            at,
            self.rule_name
        );
        if let Some(hole) = hole {
            *hole = Operand::Local(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{matcher::Matcher, Rule};

    fn read(s: &str) -> Grammar {
        Grammar::read(s, "test".to_owned()).unwrap()
    }

    fn instr(op: Opcode, args: &[i32]) -> Instr {
        Instr::encode(op, args).unwrap()
    }

    fn call_stack() -> i32 {
        StackId::Call.operand()
    }

    fn position_stack() -> i32 {
        StackId::Position.operand()
    }

    /// Check the properties every program has.
    fn check_consistent(program: &Program) {
        let len = program.instrs.len();
        assert_eq!(program.instr_to_rule.len(), len);
        assert_eq!(program.instr_to_rule[..PROLOGUE_LEN], [-1, -1, -1]);
        assert!(program.instr_to_rule[PROLOGUE_LEN..]
            .iter()
            .all(|&rule| rule >= 0 && (rule as usize) < program.rules.len()));

        for (addr, instr) in program.instrs.iter().enumerate() {
            let (op, argc, a0, a1, _) = instr.decode();
            let in_bounds = |idx: i32, table_len: usize| idx >= 0 && (idx as usize) < table_len;
            let ok = match op {
                Opcode::Match => in_bounds(a0, program.matchers.len()),
                Opcode::CallA => in_bounds(a0, program.actions.len()),
                Opcode::CallB => in_bounds(a0, program.predicates.len()),
                Opcode::StoreIfT => in_bounds(a0, program.strings.len()),
                Opcode::Jump | Opcode::JumpIfF | Opcode::JumpIfNotF => in_bounds(a0, len),
                Opcode::Push if argc == 2 => in_bounds(a1, len),
                _ => true,
            };
            assert!(ok, "instruction {} ({}) points out of bounds", addr, instr);
        }
        for thunk in program.actions.iter().chain(&program.predicates) {
            assert!(thunk.params.iter().all(|&p| p < program.strings.len()));
        }
    }

    #[test]
    fn no_rules() {
        assert_eq!(read("").to_program(), Err(GenerateError::NoRule));
        assert_eq!(Grammar::default().to_program(), Err(GenerateError::NoRule));
    }

    #[test]
    fn single_literal() {
        let program = read("A = 'a'").to_program().unwrap();
        check_consistent(&program);

        assert_eq!(
            program.instrs,
            vec![
                instr(Opcode::Push, &[call_stack(), 3]),
                instr(Opcode::Call, &[]),
                instr(Opcode::Exit, &[]),
                instr(Opcode::Push, &[position_stack()]),
                instr(Opcode::Match, &[0]),
                instr(Opcode::RestoreIfF, &[]),
                instr(Opcode::Return, &[]),
            ]
        );
        let matchers: Vec<_> = program.matchers.iter().map(ToString::to_string).collect();
        assert_eq!(matchers, vec!["\"a\""]);
        assert_eq!(program.strings, vec!["A"]);
        assert_eq!(program.instr_to_rule, vec![-1, -1, -1, 0, 0, 0, 0]);
        assert!(program.actions.is_empty());
        assert!(program.predicates.is_empty());
        assert_eq!(program.init, "");
        assert_eq!(
            program.rules,
            vec![RuleInfo {
                name: 0,
                display_name: 0,
                entry: 3
            }]
        );
    }

    #[test]
    fn display_name_only_adds_a_string() {
        let plain = read("A = 'a'").to_program().unwrap();
        let named = read(r#"A "Z" = 'a'"#).to_program().unwrap();

        assert_eq!(named.strings, vec!["A", "Z"]);
        assert_eq!(named.instrs, plain.instrs);
        assert_eq!(named.matchers, plain.matchers);
        assert_eq!(named.instr_to_rule, plain.instr_to_rule);
        assert_eq!(named.rules[0].display_name, 1);
        assert_eq!(named.rule_name_at(4), Some("Z"));
        assert_eq!(named.rule_name_at(1), None);
    }

    #[test]
    fn built_by_hand() {
        let grammar = Grammar::new(vec![Rule::new("A", Expr::literal("a"))]);
        assert_eq!(
            grammar.to_program().unwrap(),
            read("A = 'a'").to_program().unwrap()
        );
    }

    #[test]
    fn repeated_terminals_share_a_matcher() {
        let program = read("A = 'a' 'a' [0-9] 'a'i .").to_program().unwrap();
        check_consistent(&program);

        assert_eq!(
            program.matchers,
            vec![
                Matcher::Literal {
                    text: "a".to_owned(),
                    ignore_case: false
                },
                Matcher::CharClass {
                    pattern: "[0-9]".to_owned()
                },
                Matcher::Literal {
                    text: "a".to_owned(),
                    ignore_case: true
                },
                Matcher::Any,
            ]
        );
        let uses_of_first = program
            .instrs
            .iter()
            .filter(|instr| instr.decode() == (Opcode::Match, 1, 0, 0, 0))
            .count();
        assert_eq!(uses_of_first, 2);
    }

    #[test]
    fn sequence_layout() {
        let program = read("A = 'a' 'b'").to_program().unwrap();
        check_consistent(&program);

        assert_eq!(
            program.instrs[3..],
            [
                instr(Opcode::Push, &[position_stack()]),
                instr(Opcode::Push, &[position_stack()]),
                instr(Opcode::Match, &[0]),
                instr(Opcode::RestoreIfF, &[]),
                instr(Opcode::JumpIfF, &[11]),
                instr(Opcode::Push, &[position_stack()]),
                instr(Opcode::Match, &[1]),
                instr(Opcode::RestoreIfF, &[]),
                instr(Opcode::RestoreIfF, &[]),
                instr(Opcode::Return, &[]),
            ]
        );
    }

    #[test]
    fn choice_layout() {
        let program = read("A = 'a' / 'b'").to_program().unwrap();
        check_consistent(&program);

        assert_eq!(
            program.instrs[3..],
            [
                instr(Opcode::Push, &[position_stack()]),
                instr(Opcode::Push, &[position_stack()]),
                instr(Opcode::Match, &[0]),
                instr(Opcode::RestoreIfF, &[]),
                instr(Opcode::RestoreIfF, &[]),
                instr(Opcode::JumpIfNotF, &[12]),
                instr(Opcode::Push, &[position_stack()]),
                instr(Opcode::Match, &[1]),
                instr(Opcode::RestoreIfF, &[]),
                instr(Opcode::Return, &[]),
            ]
        );
    }

    #[test]
    fn rule_refs_resolve_to_entries() {
        let program = read("A = B 'x' B\nB = 'b'").to_program().unwrap();
        check_consistent(&program);

        let b_entry = program.rules[1].entry;
        assert_eq!(program.instrs[b_entry], instr(Opcode::Push, &[position_stack()]));
        assert_eq!(program.instr_to_rule[b_entry], 1);
        assert_eq!(program.instr_to_rule[b_entry - 1], 0);

        let calls_to_b = program
            .instrs
            .iter()
            .filter(|instr| **instr == self::instr(Opcode::Push, &[call_stack(), b_entry as i32]))
            .count();
        assert_eq!(calls_to_b, 2);
        assert_eq!(program.strings, vec!["A", "B"]);
    }

    #[test]
    fn recursive_rules() {
        let program = read("A = '(' A? ')' / B\nB = 'x' A*").to_program().unwrap();
        check_consistent(&program);
        assert_eq!(program.rules.len(), 2);
        assert_eq!(program.rules[0].entry, PROLOGUE_LEN);
        assert!(program.rules[1].entry > program.rules[0].entry);
    }

    #[test]
    fn undefined_and_duplicate_rules() {
        assert_eq!(
            read("A = B").to_program(),
            Err(GenerateError::UndefinedRule {
                rule: "A".to_owned(),
                name: "B".to_owned()
            })
        );
        assert_eq!(
            read("A = 'a'\nA = 'b'").to_program(),
            Err(GenerateError::DuplicateRule("A".to_owned()))
        );
    }

    #[test]
    fn labels_reach_thunks() {
        let program = read("A = x:'a' y:B &{ ok(x, y) } { build(x, y) }\nB = 'b'")
            .to_program()
            .unwrap();
        check_consistent(&program);

        assert_eq!(program.strings, vec!["A", "x", "y", "B"]);
        assert_eq!(program.actions.len(), 1);
        assert_eq!(program.actions[0].code, "build(x, y)");
        assert_eq!(program.actions[0].params, vec![1, 2]);
        assert_eq!(program.actions[0].rule, 0);
        assert_eq!(program.predicates[0].code, "ok(x, y)");
        assert_eq!(program.predicates[0].params, vec![1, 2]);
        let names: Vec<_> = program.param_names(&program.actions[0]).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn labels_stay_in_their_scope() {
        let program = read("A = (x:'a' / y:'b') z:'c'* { done }").to_program().unwrap();
        // z labels the whole repetition, so it is bound in the sequence; x and y are not
        let z = program.strings.iter().position(|s| s == "z").unwrap();
        assert_eq!(program.actions[0].params, vec![z]);
    }

    #[test]
    fn action_numbering_is_outside_in() {
        let program = read("A = ('a' { inner }) 'b' { outer }\nB = 'c' { last }")
            .to_program()
            .unwrap();
        let codes: Vec<_> = program.actions.iter().map(|a| a.code.as_str()).collect();
        assert_eq!(codes, vec!["outer", "inner", "last"]);
        assert_eq!(program.actions[2].rule, 1);
    }

    #[test]
    fn identical_thunks_stay_apart() {
        let program = read("A = 'a' { same } / 'b' { same }").to_program().unwrap();
        assert_eq!(program.actions.len(), 2);
        assert_eq!(program.actions[0], program.actions[1]);
    }

    #[test]
    fn every_construct() {
        let program = read(
            r#"{ setup() }
            Start "start" = Item+ !. { done }
            Item = n:Number _ / w:Word? &'x' 'x' / (&{ check() } . )*
            Number = [0-9]+
            Word = 'w'i 'o'i 'r'i 'd'i
            _ = [ \t]*"#,
        )
        .to_program()
        .unwrap();
        check_consistent(&program);
        assert_eq!(program.init, "setup()");
        assert_eq!(program.rules.len(), 5);
        assert_eq!(program.rule_name_at(program.rules[0].entry), Some("start"));
    }

    #[test]
    fn empty_sequence_and_choice() {
        let program = Grammar::new(vec![
            Rule::new("A", Expr::Sequence(Vec::new())),
            Rule::new("B", Expr::Choice(Vec::new())),
        ])
        .to_program()
        .unwrap();
        check_consistent(&program);
        assert_eq!(
            program.instrs[3..],
            [
                instr(Opcode::JumpIfNotF, &[5]),
                instr(Opcode::NotF, &[]),
                instr(Opcode::Return, &[]),
                instr(Opcode::JumpIfF, &[8]),
                instr(Opcode::NotF, &[]),
                instr(Opcode::Return, &[]),
            ]
        );
    }

    #[test]
    fn oversized_programs_are_rejected() {
        let sequence_of = |n: usize| {
            let items = (0..n).map(|_| Expr::literal("a")).collect();
            Grammar::new(vec![Rule::new("A", Expr::Sequence(items))])
        };

        // two instructions per item
        let program = sequence_of(16_000).to_program().unwrap();
        assert!(program.instrs.len() <= MAX_PROGRAM_LEN);

        let err = sequence_of(20_000).to_program().unwrap_err();
        assert!(matches!(
            err,
            GenerateError::TooLarge {
                what: "instructions",
                max: MAX_PROGRAM_LEN,
                ..
            }
        ));
        assert!(err.to_string().starts_with("the program has too many instructions"));
    }
}
