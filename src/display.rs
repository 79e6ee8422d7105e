//! Print grammars and programs.

use std::fmt::{self, Display, Write};

use itertools::Itertools;

use crate::{Expr, Grammar, Instr, Opcode, Program, Rule, StackId};

impl Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (op, argc, a0, a1, _) = self.decode();
        f.write_str(op.name())?;
        match (op, argc) {
            (Opcode::Push, _) | (Opcode::Pop, _) => {
                match StackId::from_operand(a0) {
                    Some(stack) => write!(f, " {}", stack)?,
                    None => write!(f, " ?{}", a0)?,
                }
                if argc == 2 {
                    write!(f, " {}", a1)?;
                }
                Ok(())
            }
            _ => {
                for operand in self.operands() {
                    write!(f, " {}", operand)?;
                }
                Ok(())
            }
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { text, ignore_case } => {
                write_quoted(f, text)?;
                if *ignore_case {
                    f.write_char('i')?;
                }
                Ok(())
            }
            Expr::CharClass { pattern } => f.write_str(pattern),
            Expr::AnyChar => f.write_char('.'),
            Expr::Sequence(items) => write_joined(f, items, " "),
            Expr::Choice(alts) => write_joined(f, alts, " / "),
            Expr::ZeroOrMore(child) => write_suffixed(f, child, '*'),
            Expr::OneOrMore(child) => write_suffixed(f, child, '+'),
            Expr::Optional(child) => write_suffixed(f, child, '?'),
            Expr::AndPredicate(child) => {
                f.write_char('&')?;
                write_operand(f, child, Binding::Suffixed)
            }
            Expr::NotPredicate(child) => match &**child {
                Expr::Predicate { code } => write!(f, "!{{ {} }}", code),
                _ => {
                    f.write_char('!')?;
                    write_operand(f, child, Binding::Suffixed)
                }
            },
            Expr::Labeled { label, expr } => {
                write!(f, "{}:", label)?;
                write_operand(f, expr, Binding::Prefixed)
            }
            Expr::Action { expr, code } => {
                match **expr {
                    Expr::Choice(_) | Expr::Action { .. } => write!(f, "({})", expr)?,
                    _ => write!(f, "{}", expr)?,
                }
                write!(f, " {{ {} }}", code)
            }
            Expr::Predicate { code } => write!(f, "&{{ {} }}", code),
            Expr::RuleRef(name) => f.write_str(name),
        }
    }
}

/// Write `text` in double quotes, escaped the way the grammar reader unescapes it.
///
/// Other characters, control characters included, are written as they are.
pub(crate) fn write_quoted(out: &mut impl Write, text: &str) -> fmt::Result {
    out.write_char('"')?;
    for c in text.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            '\t' => out.write_str("\\t")?,
            '\r' => out.write_str("\\r")?,
            '\0' => out.write_str("\\0")?,
            _ => out.write_char(c)?,
        }
    }
    out.write_char('"')
}

/// Write children that bind looser than the separator in parens.
fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    let mut first = true;
    for item in items {
        if !first {
            f.write_str(sep)?;
        }
        first = false;
        let needs_parens = match item {
            Expr::Choice(_) | Expr::Action { .. } => true,
            Expr::Sequence(_) => sep == " ",
            _ => false,
        };
        if needs_parens {
            write!(f, "({})", item)?;
        } else {
            write!(f, "{}", item)?;
        }
    }
    Ok(())
}

fn write_suffixed(f: &mut fmt::Formatter<'_>, child: &Expr, suffix: char) -> fmt::Result {
    write_operand(f, child, Binding::Primary)?;
    f.write_char(suffix)
}

/// How tightly the thing an operand is written into binds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Binding {
    /// Suffixes take a primary.
    Primary,
    /// `&` and `!` take a primary, maybe suffixed.
    Suffixed,
    /// Labels take all that, maybe prefixed.
    Prefixed,
}

/// Write an operand, wrapping it in parens if it binds looser than `binding` allows.
fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, binding: Binding) -> fmt::Result {
    let needs = match expr {
        Expr::Literal { .. } | Expr::CharClass { .. } | Expr::AnyChar | Expr::RuleRef(_) => {
            Binding::Primary
        }
        Expr::ZeroOrMore(_) | Expr::OneOrMore(_) | Expr::Optional(_) => Binding::Suffixed,
        Expr::AndPredicate(_) | Expr::NotPredicate(_) | Expr::Predicate { .. } => {
            Binding::Prefixed
        }
        _ => return write!(f, "({})", expr),
    };
    if needs <= binding {
        write!(f, "{}", expr)
    } else {
        write!(f, "({})", expr)
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(display_name) = &self.display_name {
            f.write_char(' ')?;
            write_quoted(f, display_name)?;
        }
        write!(f, " = {}", self.expr)
    }
}

impl Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(init) = &self.init {
            writeln!(f, "{{ {} }}", init)?;
        }
        for rule in self.rules.iter() {
            writeln!(f, "{}", rule)?;
        }
        Ok(())
    }
}

impl Program {
    /// A listing of the program, one instruction per line, with table entries spelled out.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        // Writing to a String can't fail.
        let _ = self.write_disassembly(&mut out);
        out
    }

    fn write_disassembly(&self, out: &mut String) -> fmt::Result {
        let entries = self
            .rules
            .iter()
            .enumerate()
            .map(|(idx, info)| (info.entry, idx))
            .collect::<std::collections::HashMap<_, _>>();

        for (addr, instr) in self.instrs.iter().enumerate() {
            if let Some(&rule) = entries.get(&addr) {
                writeln!(out, "; rule {}", self.rule_header(rule))?;
            }
            write!(out, "{:04}  {}", addr, instr)?;
            if let Some(note) = self.annotate(instr) {
                write!(out, "  ; {}", note)?;
            }
            out.push('\n');
        }
        Ok(())
    }

    fn rule_header(&self, rule: usize) -> String {
        let info = &self.rules[rule];
        let name = self.strings.get(info.name).map_or("?", String::as_str);
        if info.display_name == info.name {
            name.to_owned()
        } else {
            let display = self.strings.get(info.display_name).map_or("?", String::as_str);
            let mut header = format!("{} ", name);
            let _ = write_quoted(&mut header, display);
            header
        }
    }

    /// Spell out what an instruction's operand refers to.
    fn annotate(&self, instr: &Instr) -> Option<String> {
        let (op, argc, a0, a1, _) = instr.decode();
        let entry_of = |addr: i32| {
            self.rules
                .iter()
                .position(|info| info.entry as i32 == addr)
                .map(|rule| self.rule_header(rule))
        };
        match op {
            Opcode::Match => self.matchers.get(a0 as usize).map(ToString::to_string),
            Opcode::StoreIfT => self.strings.get(a0 as usize).cloned(),
            Opcode::CallA | Opcode::CallB => {
                let table = if op == Opcode::CallA {
                    &self.actions
                } else {
                    &self.predicates
                };
                table.get(a0 as usize).map(|thunk| {
                    let params = self.param_names(thunk).join(", ");
                    format!("({}) {{ {} }}", params, thunk.code.trim())
                })
            }
            Opcode::Push if argc == 2 && StackId::from_operand(a0) == Some(StackId::Call) => {
                entry_of(a1)
            }
            _ => None,
        }
    }
}
