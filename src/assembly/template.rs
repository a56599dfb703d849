//! Declarative instruction sequence matching.
//!
//! An [`InstructionTemplate`] is an ordered list of steps, each consuming exactly one
//! instruction. A step either has to satisfy a predicate, satisfy it and record the
//! instruction under a capture name, or accept anything. Templates are the way the detection
//! stages describe the fixed prologues emitted by the protector; the interesting operands
//! (decompressor call, native key routine, multiplier) come back as captures.
//!
//! # Usage Examples
//!
//! ```rust
//! use confuserex_constants::assembly::{
//!     opcodes, predicates, InstructionAssembler, InstructionTemplate,
//! };
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldc_i4(7)?.mul()?.ret()?;
//! let body = asm.finish_instructions()?;
//!
//! let template = InstructionTemplate::new("scale")
//!     .step(predicates::ldarg())
//!     .capture("factor", predicates::ldc_i4())
//!     .step(predicates::op(opcodes::MUL));
//!
//! let found = template.find(&body).expect("matched");
//! assert_eq!(found.start, 0);
//! assert_eq!(found.get("factor").and_then(|i| i.ldc_i4_value()), Some(7));
//! # Ok::<(), confuserex_constants::Error>(())
//! ```

use std::fmt;

use crate::assembly::instruction::Instruction;

/// A boxed instruction predicate.
pub type Predicate = Box<dyn Fn(&Instruction) -> bool + Send + Sync>;

enum TemplateStep {
    Match(Predicate),
    Capture(&'static str, Predicate),
    Skip,
}

/// An ordered sequence of instruction predicates.
pub struct InstructionTemplate {
    name: &'static str,
    steps: Vec<TemplateStep>,
}

impl fmt::Debug for InstructionTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionTemplate")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// A successful template match.
#[derive(Debug, Clone, Copy)]
pub struct TemplateMatch<'a> {
    /// Index of the first matched instruction
    pub start: usize,
    /// Number of instructions covered
    pub len: usize,
    instructions: &'a [Instruction],
    captures: [Option<(&'static str, usize)>; MAX_CAPTURES],
}

const MAX_CAPTURES: usize = 4;

impl<'a> TemplateMatch<'a> {
    /// The instruction recorded under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'a Instruction> {
        self.captures
            .iter()
            .flatten()
            .find(|(capture, _)| *capture == name)
            .and_then(|(_, index)| self.instructions.get(*index))
    }

    /// Index one past the last matched instruction.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

impl InstructionTemplate {
    /// Creates an empty template. The name only shows up in diagnostics.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        InstructionTemplate {
            name,
            steps: Vec::new(),
        }
    }

    /// The template name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of instructions a match covers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if the template has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Appends a step that must satisfy `predicate`.
    #[must_use]
    pub fn step(mut self, predicate: Predicate) -> Self {
        self.steps.push(TemplateStep::Match(predicate));
        self
    }

    /// Appends a step that must satisfy `predicate` and records the instruction as `name`.
    ///
    /// At most four captures are kept per template; later ones are matched but dropped.
    #[must_use]
    pub fn capture(mut self, name: &'static str, predicate: Predicate) -> Self {
        self.steps.push(TemplateStep::Capture(name, predicate));
        self
    }

    /// Appends a step that accepts any instruction.
    #[must_use]
    pub fn skip(mut self) -> Self {
        self.steps.push(TemplateStep::Skip);
        self
    }

    /// Matches the template against `instructions` starting exactly at `start`.
    #[must_use]
    pub fn match_at<'a>(
        &self,
        instructions: &'a [Instruction],
        start: usize,
    ) -> Option<TemplateMatch<'a>> {
        let window = instructions.get(start..start.checked_add(self.steps.len())?)?;

        let mut captures = [None; MAX_CAPTURES];
        let mut next_capture = 0;
        for (offset, (step, instruction)) in self.steps.iter().zip(window).enumerate() {
            match step {
                TemplateStep::Match(predicate) => {
                    if !predicate(instruction) {
                        return None;
                    }
                }
                TemplateStep::Capture(name, predicate) => {
                    if !predicate(instruction) {
                        return None;
                    }
                    if let Some(slot) = captures.get_mut(next_capture) {
                        *slot = Some((*name, start + offset));
                        next_capture += 1;
                    }
                }
                TemplateStep::Skip => {}
            }
        }

        Some(TemplateMatch {
            start,
            len: self.steps.len(),
            instructions,
            captures,
        })
    }

    /// First match anywhere in `instructions`.
    #[must_use]
    pub fn find<'a>(&self, instructions: &'a [Instruction]) -> Option<TemplateMatch<'a>> {
        self.find_from(instructions, 0)
    }

    /// First match at or after `from`.
    #[must_use]
    pub fn find_from<'a>(
        &self,
        instructions: &'a [Instruction],
        from: usize,
    ) -> Option<TemplateMatch<'a>> {
        (from..instructions.len()).find_map(|start| self.match_at(instructions, start))
    }
}

/// Reusable step predicates.
pub mod predicates {
    use super::Predicate;
    use crate::assembly::instruction::Instruction;
    use crate::assembly::opcodes;

    /// Single-byte opcode `opcode`.
    #[must_use]
    pub fn op(opcode: u8) -> Predicate {
        Box::new(move |i: &Instruction| i.is(opcode))
    }

    /// Two-byte opcode `0xFE opcode`.
    #[must_use]
    pub fn fe(opcode: u8) -> Predicate {
        Box::new(move |i: &Instruction| i.is_fe(opcode))
    }

    /// Any `ldc.i4` form.
    #[must_use]
    pub fn ldc_i4() -> Predicate {
        Box::new(|i: &Instruction| i.is_ldc_i4())
    }

    /// An `ldc.i4` form pushing exactly `value`.
    #[must_use]
    pub fn ldc_i4_eq(value: i32) -> Predicate {
        Box::new(move |i: &Instruction| i.ldc_i4_value() == Some(value))
    }

    /// Any `ldarg` form.
    #[must_use]
    pub fn ldarg() -> Predicate {
        Box::new(|i: &Instruction| i.is_ldarg())
    }

    /// Any `starg` form.
    #[must_use]
    pub fn starg() -> Predicate {
        Box::new(|i: &Instruction| i.is_starg())
    }

    /// Any `stloc` form.
    #[must_use]
    pub fn stloc() -> Predicate {
        Box::new(|i: &Instruction| i.is_stloc())
    }

    /// Any `ldloca` form.
    #[must_use]
    pub fn ldloca() -> Predicate {
        Box::new(|i: &Instruction| i.is_ldloca())
    }

    /// `call` with a token operand.
    #[must_use]
    pub fn call() -> Predicate {
        Box::new(|i: &Instruction| i.is(opcodes::CALL) && i.token().is_some())
    }

    /// Anything.
    #[must_use]
    pub fn any() -> Predicate {
        Box::new(|_: &Instruction| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{assembler::InstructionAssembler, opcodes};

    fn body() -> Vec<Instruction> {
        let mut asm = InstructionAssembler::new();
        asm.nop()
            .unwrap()
            .ldarg(0)
            .unwrap()
            .ldc_i4(0x1E)
            .unwrap()
            .shr_un()
            .unwrap()
            .stloc(0)
            .unwrap()
            .ldarg(0)
            .unwrap()
            .ldc_i4(2)
            .unwrap()
            .shl()
            .unwrap()
            .ret()
            .unwrap();
        asm.finish_instructions().unwrap()
    }

    #[test]
    fn test_match_at_exact_position() {
        let body = body();
        let template = InstructionTemplate::new("shift")
            .step(predicates::ldarg())
            .capture("amount", predicates::ldc_i4())
            .step(predicates::op(opcodes::SHR_UN))
            .step(predicates::stloc());

        assert!(template.match_at(&body, 0).is_none());
        let found = template.match_at(&body, 1).unwrap();
        assert_eq!(found.end(), 5);
        assert_eq!(found.get("amount").unwrap().ldc_i4_value(), Some(0x1E));
        assert!(found.get("missing").is_none());
    }

    #[test]
    fn test_find_scans_and_skips() {
        let body = body();
        let template = InstructionTemplate::new("shl")
            .step(predicates::ldarg())
            .skip()
            .step(predicates::op(opcodes::SHL));

        let found = template.find(&body).unwrap();
        assert_eq!(found.start, 5);
        assert!(template.find_from(&body, 6).is_none());
    }

    #[test]
    fn test_template_longer_than_body() {
        let body = body();
        let template = (0..body.len() + 1).fold(InstructionTemplate::new("long"), |t, _| t.skip());
        assert!(template.find(&body).is_none());
        assert!(template.match_at(&body, usize::MAX).is_none());
    }
}
