//! # The parsing machine
//!
//! Grammars are lowered into a flat list of *instructions* for a backtracking machine with
//! two stacks: the **call stack**, holding return addresses and loop continuations, and the
//! **position stack**, holding saved input cursors. A single **fail flag** records whether the
//! last attempt to match failed.
//!
//! ## Instructions
//!
//! An instruction is an *opcode* and 0 to 3 signed *operands*, packed into one `u64` word:
//!
//! ```text
//! | opcode: 8 | argc: 8 | a0: 16 | a1: 16 | a2: 16 |
//! ```
//!
//! Unused operand slots are zero. The position of an instruction in the program is its
//! address; all jump operands are absolute addresses.
//!
//! Operands are one of:
//!
//! - `stack`: a [`StackId`].
//! - `addr`: an absolute instruction address.
//! - `matcher`, `action`, `predicate`: an index into the program's matching tables.
//! - `label`: an index into the program's string table.
//!
//! ## Programs
//!
//! Every program starts with a three-instruction prologue calling the first rule and exiting.
//! Each rule's code follows, in declaration order, ending in `Return`.
pub mod execute;
pub mod generate;
pub mod tables;

use std::{convert::TryFrom, fmt, ops::RangeInclusive};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub use execute::{Failure, Host, Outcome, ThunkCall, Vm, VmConfig, VmError};
pub use generate::{GenerateError, Generator};
pub use tables::Tables;

/// Width in bits of one operand slot.
pub const OPERAND_BITS: u32 = 16;
/// The most operands any instruction can carry.
pub const MAX_OPERANDS: usize = 3;
/// The most instructions, or entries in any one table, a program can have.
///
/// Addresses and table indices are operands, so they must stay below this.
pub const MAX_PROGRAM_LEN: usize = 1 << (OPERAND_BITS - 1);

type Operand = i16;

/// Opcode bytes.
///
/// Opcodes start at 1 so a zeroed word can be detected as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// With one operand, push the input cursor onto the stack.
    /// With two, push the literal value.
    ///
    /// `stack`, `[value]`
    Push = 1,
    /// Discard the top of the stack.
    ///
    /// `stack`
    Pop,
    /// Pop an address off the call stack and jump there, pushing the return address.
    Call,
    /// Pop an address off the call stack and jump there.
    Return,
    /// Stop the machine.
    Exit,
    /// Try a matcher at the cursor, advancing on success. Sets the fail flag.
    ///
    /// `matcher`
    Match,
    /// Pop the position stack, and if the fail flag is set, move the cursor back there.
    RestoreIfF,
    /// `addr`
    Jump,
    /// Jump if the fail flag is set.
    ///
    /// `addr`
    JumpIfF,
    /// Jump if the fail flag is clear.
    ///
    /// `addr`
    JumpIfNotF,
    /// Run an action thunk. Its result becomes the current value.
    ///
    /// `action`
    CallA,
    /// Run a predicate thunk. Sets the fail flag if it answers false.
    ///
    /// `predicate`
    CallB,
    /// Invert the fail flag.
    NotF,
    /// Pop the position stack, and if the fail flag is clear, bind the label to the input
    /// between there and the cursor.
    ///
    /// `label`
    StoreIfT,
}

impl Opcode {
    /// How many operands this opcode accepts.
    pub fn arity(self) -> RangeInclusive<usize> {
        match self {
            Opcode::Push => 1..=2,
            Opcode::Call | Opcode::Return | Opcode::Exit | Opcode::RestoreIfF | Opcode::NotF => {
                0..=0
            }
            Opcode::Pop
            | Opcode::Match
            | Opcode::Jump
            | Opcode::JumpIfF
            | Opcode::JumpIfNotF
            | Opcode::CallA
            | Opcode::CallB
            | Opcode::StoreIfT => 1..=1,
        }
    }

    /// Every opcode, in numeric order.
    pub fn all() -> impl Iterator<Item = Opcode> {
        (1..=u8::MAX).map_while(|b| Opcode::try_from(b).ok())
    }

    /// Mnemonic used when printing programs.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Call => "call",
            Opcode::Return => "return",
            Opcode::Exit => "exit",
            Opcode::Match => "match",
            Opcode::RestoreIfF => "restoreiff",
            Opcode::Jump => "jump",
            Opcode::JumpIfF => "jumpiff",
            Opcode::JumpIfNotF => "jumpifnotf",
            Opcode::CallA => "calla",
            Opcode::CallB => "callb",
            Opcode::NotF => "notf",
            Opcode::StoreIfT => "storeift",
        }
    }
}

/// The stacks `Push` and `Pop` can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StackId {
    /// Return addresses and loop continuations.
    Call = 0,
    /// Saved input cursors.
    Position = 1,
}

impl StackId {
    /// This stack as an instruction operand.
    pub fn operand(self) -> i32 {
        i32::from(u8::from(self))
    }

    pub fn from_operand(operand: i32) -> Option<StackId> {
        u8::try_from(operand)
            .ok()
            .and_then(|b| StackId::try_from(b).ok())
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StackId::Call => "istack",
            StackId::Position => "pstack",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{op:?} takes between {min} and {max} operands, but was given {got}")]
    Arity {
        op: Opcode,
        min: usize,
        max: usize,
        got: usize,
    },
    #[error("operand {value} of {op:?} does not fit in {bits} bits")]
    OperandOverflow { op: Opcode, value: i32, bits: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{0:#04x} is not an opcode")]
    BadOpcode(u8),
    #[error("{op:?} cannot carry {count} operands")]
    BadOperandCount { op: Opcode, count: u8 },
}

/// Check that `op` accepts `count` operands.
pub fn check_arity(op: Opcode, count: usize) -> Result<(), EncodeError> {
    let arity = op.arity();
    if arity.contains(&count) {
        Ok(())
    } else {
        Err(EncodeError::Arity {
            op,
            min: *arity.start(),
            max: *arity.end(),
            got: count,
        })
    }
}

/// One encoded instruction.
///
/// These can only be made by [`Instr::encode`] or [`Instr::from_word`], so the opcode and
/// operand count always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instr {
    op: Opcode,
    argc: u8,
    args: [Operand; MAX_OPERANDS],
}

impl Instr {
    /// Pack an opcode and its operands.
    pub fn encode(op: Opcode, operands: &[i32]) -> Result<Instr, EncodeError> {
        check_arity(op, operands.len())?;

        let mut args = [0; MAX_OPERANDS];
        for (slot, &value) in args.iter_mut().zip(operands) {
            *slot = Operand::try_from(value).map_err(|_| EncodeError::OperandOverflow {
                op,
                value,
                bits: OPERAND_BITS,
            })?;
        }

        Ok(Instr {
            op,
            argc: operands.len() as u8,
            args,
        })
    }

    /// Unpack into the opcode, the operand count, and the three operand slots.
    ///
    /// Slots past the operand count are 0.
    pub fn decode(self) -> (Opcode, usize, i32, i32, i32) {
        let [a0, a1, a2] = self.args;
        (
            self.op,
            self.argc as usize,
            i32::from(a0),
            i32::from(a1),
            i32::from(a2),
        )
    }

    pub fn op(self) -> Opcode {
        self.op
    }

    /// The operands actually given to this instruction.
    pub fn operands(&self) -> impl Iterator<Item = i32> + '_ {
        self.args[..self.argc as usize].iter().map(|&a| i32::from(a))
    }

    pub fn to_word(self) -> u64 {
        let [a0, a1, a2] = self.args;
        (u64::from(u8::from(self.op)) << 56)
            | (u64::from(self.argc) << 48)
            | (u64::from(a0 as u16) << 32)
            | (u64::from(a1 as u16) << 16)
            | u64::from(a2 as u16)
    }

    pub fn from_word(word: u64) -> Result<Instr, DecodeError> {
        let opbyte = (word >> 56) as u8;
        let op = Opcode::try_from(opbyte).map_err(|e| DecodeError::BadOpcode(e.number))?;
        let argc = (word >> 48) as u8;
        if !op.arity().contains(&(argc as usize)) {
            return Err(DecodeError::BadOperandCount { op, count: argc });
        }

        let slot = |shift: u32| (word >> shift) as u16 as Operand;
        let mut args = [slot(32), slot(16), slot(0)];
        // Keep unused slots zeroed so equal instructions compare equal.
        for unused in args.iter_mut().skip(argc as usize) {
            *unused = 0;
        }

        Ok(Instr { op, argc, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_undoes_encode() {
        let samples = [0, 1, -1, 3, 1234, -32768, 32767];
        for op in Opcode::all() {
            for argc in op.arity() {
                for &sample in samples.iter() {
                    let args: Vec<i32> = (0..argc).map(|i| sample - i as i32 * 7).collect();
                    let args: Vec<i32> = args
                        .into_iter()
                        .map(|a| a.max(i16::MIN as i32).min(i16::MAX as i32))
                        .collect();

                    let instr = Instr::encode(op, &args).unwrap();
                    let (got_op, got_argc, a0, a1, a2) = instr.decode();
                    assert_eq!(got_op, op);
                    assert_eq!(got_argc, args.len());
                    let padded = [
                        args.get(0).copied().unwrap_or(0),
                        args.get(1).copied().unwrap_or(0),
                        args.get(2).copied().unwrap_or(0),
                    ];
                    assert_eq!([a0, a1, a2], padded, "{:?} {:?}", op, args);

                    assert_eq!(Instr::from_word(instr.to_word()), Ok(instr));
                }
            }
        }
    }

    #[test]
    fn all_opcodes() {
        let ops: Vec<_> = Opcode::all().collect();
        assert_eq!(ops.first(), Some(&Opcode::Push));
        assert_eq!(ops.last(), Some(&Opcode::StoreIfT));
        assert_eq!(ops.len(), 14);
    }

    #[test]
    fn wrong_arity() {
        assert_eq!(
            Instr::encode(Opcode::Call, &[1]),
            Err(EncodeError::Arity {
                op: Opcode::Call,
                min: 0,
                max: 0,
                got: 1
            })
        );
        assert!(Instr::encode(Opcode::Push, &[]).is_err());
        assert!(Instr::encode(Opcode::Push, &[0, 1, 2]).is_err());
        assert!(Instr::encode(Opcode::Match, &[]).is_err());
        assert!(Instr::encode(Opcode::Jump, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn operand_overflow() {
        assert_eq!(
            Instr::encode(Opcode::Jump, &[40_000]),
            Err(EncodeError::OperandOverflow {
                op: Opcode::Jump,
                value: 40_000,
                bits: OPERAND_BITS
            })
        );
    }

    #[test]
    fn bad_words() {
        assert_eq!(Instr::from_word(0), Err(DecodeError::BadOpcode(0)));
        assert_eq!(Instr::from_word(0xff << 56), Err(DecodeError::BadOpcode(0xff)));

        let call_with_one = (u64::from(u8::from(Opcode::Call)) << 56) | (1 << 48);
        assert_eq!(
            Instr::from_word(call_with_one),
            Err(DecodeError::BadOperandCount {
                op: Opcode::Call,
                count: 1
            })
        );
    }

    #[test]
    fn stack_operands() {
        assert_eq!(StackId::Call.operand(), 0);
        assert_eq!(StackId::Position.operand(), 1);
        assert_eq!(StackId::from_operand(1), Some(StackId::Position));
        assert_eq!(StackId::from_operand(-1), None);
        assert_eq!(StackId::from_operand(7), None);
    }
}
