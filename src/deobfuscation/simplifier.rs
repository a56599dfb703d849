//! Instruction simplification ahead of pattern detection.
//!
//! Every shape check of the constants engine runs over a method after it has been brought
//! towards a canonical form. The [`InstructionSimplifier`] trait is that seam; the shipped
//! [`NopStripper`] removes the padding `nop`s the protector and compilers leave between the
//! instructions a template expects to be adjacent.

use rustc_hash::FxHashMap;

use crate::{
    assembly::{opcodes, Operand},
    metadata::{module::Module, token::Token},
};

/// Rewrites a method body in place towards canonical form.
///
/// Implementations are best-effort and idempotent: a method that cannot be simplified is left
/// untouched, and failures are never reported to the caller.
pub trait InstructionSimplifier: Send + Sync {
    /// Unique name for logging and debugging.
    fn name(&self) -> &'static str;

    /// Simplifies `method` of `module`.
    ///
    /// Returns `true` if the body was changed.
    fn simplify(&self, module: &mut Module, method: Token) -> bool;
}

/// Removes `nop` instructions and retargets branches that pointed at them.
///
/// Instructions keep their original offsets, so branch targets stay valid identities. A `nop`
/// at the very end of a body that is targeted by a branch is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopStripper;

impl InstructionSimplifier for NopStripper {
    fn name(&self) -> &'static str {
        "nop-stripper"
    }

    fn simplify(&self, module: &mut Module, method: Token) -> bool {
        let Some(body) = module
            .method_mut(method)
            .and_then(|method| method.body.as_mut())
        else {
            return false;
        };
        let instructions = &mut body.instructions;

        let mut redirects: FxHashMap<u64, u64> = FxHashMap::default();
        let mut successor: Option<u64> = None;
        for instruction in instructions.iter().rev() {
            if instruction.is(opcodes::NOP) {
                if let Some(target) = successor {
                    redirects.insert(instruction.offset, target);
                }
            } else {
                successor = Some(instruction.offset);
            }
        }

        if redirects.is_empty() {
            return false;
        }

        instructions.retain(|instruction| !redirects.contains_key(&instruction.offset));
        for instruction in instructions.iter_mut() {
            match &mut instruction.operand {
                Operand::Target(target) => {
                    if let Some(redirect) = redirects.get(target) {
                        *target = *redirect;
                    }
                }
                Operand::Switch(targets) => {
                    for target in targets.iter_mut() {
                        if let Some(redirect) = redirects.get(target) {
                            *target = *redirect;
                        }
                    }
                }
                _ => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        metadata::{
            builder::ModuleBuilder,
            method::{MethodAccessFlags, MethodBody, MethodModifiers},
            signatures::{MethodSig, TypeSig},
        },
    };

    fn module_with(asm: InstructionAssembler) -> (Module, Token) {
        let mut builder = ModuleBuilder::new("Test.dll");
        let global = builder.global_type();
        let method = builder.method(
            global,
            "M",
            MethodAccessFlags::PUBLIC,
            MethodModifiers::STATIC,
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]),
        );
        builder
            .set_body(
                method,
                MethodBody::new(asm.finish_instructions().unwrap(), Vec::new()),
            )
            .unwrap();
        (builder.build(), method)
    }

    #[test]
    fn test_strips_and_retargets() {
        let mut asm = InstructionAssembler::new();
        asm.nop().unwrap();
        asm.ldarg(0).unwrap().brtrue("skip").unwrap();
        asm.ldc_i4(1).unwrap().ret().unwrap();
        asm.label("skip").unwrap();
        asm.nop().unwrap().nop().unwrap();
        asm.ldc_i4(2).unwrap().ret().unwrap();
        let (mut module, method) = module_with(asm);

        assert!(NopStripper.simplify(&mut module, method));

        let body = module.method(method).unwrap().body.as_ref().unwrap();
        assert!(body.instructions.iter().all(|i| !i.is(opcodes::NOP)));
        assert_eq!(body.instructions.len(), 6);

        let branch = &body.instructions[1];
        let target = branch.targets()[0];
        let landing = body.index_of_offset(target).unwrap();
        assert_eq!(body.instructions[landing].ldc_i4_value(), Some(2));
    }

    #[test]
    fn test_idempotent() {
        let mut asm = InstructionAssembler::new();
        asm.nop().unwrap().ldarg(0).unwrap().ret().unwrap();
        let (mut module, method) = module_with(asm);

        assert!(NopStripper.simplify(&mut module, method));
        let once = module.method(method).unwrap().body.clone();
        assert!(!NopStripper.simplify(&mut module, method));
        assert_eq!(module.method(method).unwrap().body, once);
    }

    #[test]
    fn test_unknown_method_is_ignored() {
        let (mut module, _) = module_with(InstructionAssembler::new());
        assert!(!NopStripper.simplify(&mut module, Token::new(0x0600_00FF)));
    }
}
