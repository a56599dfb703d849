//! Recognizing the generic decryptor methods.
//!
//! Every protected constant reference is rewritten into a call `Get<T>(index)` on one of several
//! generic helpers declared next to the initializer. Two families exist, distinguished by how
//! the index becomes a key:
//!
//! **Native key**, a hand-written x86 routine scrambles the index:
//!
//! ```text
//! ldarg.0
//! call     int32 <Module>::<native>(int32)
//! starg.s  0
//! ldarg.0
//! ldc.i4.s 0x1E
//! shr.un
//! stloc.0
//! ldloca.s 1
//! initobj  !!T
//! ldarg.0
//! ldc.i4   0x3FFFFFFF
//! and
//! starg.s  0
//! ldarg.0
//! ldc.i4.2
//! shl
//! starg.s  0
//! ```
//!
//! **Arithmetic key**, computing `(index * A) ^ B` before the same masking:
//!
//! ```text
//! ldarg.0
//! ldc.i4   A
//! mul
//! ldc.i4   B
//! xor
//! starg.s  0
//! ```
//!
//! Decoys share the numeric prologue but never touch the blob; the native family is therefore
//! only accepted if the body also calls the string and array APIs a real decryptor needs.

use std::sync::Arc;

use crate::{
    assembly::{opcodes, predicates, Instruction, InstructionTemplate},
    deobfuscation::{ConstantsConfig, EventKind, EventLog, InstructionSimplifier},
    emulation::NativeRoutine,
    metadata::{
        method::MethodDef,
        module::Module,
        signatures::{ElementType, TypeSig},
        token::{TableId, Token},
    },
};

use super::{
    decoder::{DecryptedBlob, DecryptionSite, SiteMode},
    locator::{is_method_token, references_method},
};

/// Runtime APIs every native-key decryptor calls.
pub const REQUIRED_DECRYPTOR_CALLS: [&str; 7] = [
    "System.Text.Encoding System.Text.Encoding::get_UTF8()",
    "System.String System.Text.Encoding::GetString(System.Byte[],System.Int32,System.Int32)",
    "System.Array System.Array::CreateInstance(System.Type,System.Int32)",
    "System.String System.String::Intern(System.String)",
    "System.Void System.Buffer::BlockCopy(System.Array,System.Int32,System.Array,System.Int32,System.Int32)",
    "System.Type System.Type::GetTypeFromHandle(System.RuntimeTypeHandle)",
    "System.Type System.Type::GetElementType()",
];

/// Matches decryptor candidates against the two key families.
pub struct DecryptorClassifier {
    native: InstructionTemplate,
    arithmetic: InstructionTemplate,
    min_instructions: usize,
}

impl DecryptorClassifier {
    /// Builds the templates for `config`.
    #[must_use]
    pub fn new(config: &ConstantsConfig) -> Self {
        let native = InstructionTemplate::new("native-key")
            .step(predicates::ldarg())
            .capture("native", predicates::call())
            .step(predicates::starg())
            .step(predicates::ldarg())
            .step(predicates::ldc_i4_eq(0x1E))
            .step(predicates::op(opcodes::SHR_UN))
            .step(predicates::stloc());
        let native = if config.strict_native_template {
            native.step(predicates::ldloca())
        } else {
            native.skip()
        };
        let native = native
            .step(predicates::fe(opcodes::FE_INITOBJ))
            .step(predicates::ldarg())
            .step(predicates::ldc_i4_eq(0x3FFF_FFFF))
            .step(predicates::op(opcodes::AND))
            .step(predicates::starg())
            .step(predicates::ldarg())
            .step(predicates::ldc_i4_eq(2))
            .step(predicates::op(opcodes::SHL))
            .step(predicates::starg());

        let arithmetic = InstructionTemplate::new("arithmetic-key")
            .capture("multiplier", predicates::ldc_i4())
            .step(predicates::op(opcodes::MUL))
            .capture("xor", predicates::ldc_i4())
            .step(predicates::op(opcodes::XOR));

        DecryptorClassifier {
            native,
            arithmetic,
            min_instructions: config.min_decryptor_instructions,
        }
    }

    /// Returns `true` if `method` has the `T Get<T>(uint)` shape.
    #[must_use]
    pub fn is_candidate(method: &MethodDef) -> bool {
        let sig = &method.signature;
        method.body.is_some()
            && sig.contains_generic_parameter()
            && sig.generic_param_count == 1
            && sig.params.len() == 1
            && matches!(
                sig.params[0].element_type(),
                ElementType::U4 | ElementType::I4
            )
            && matches!(sig.return_type.remove_pinned_and_modifiers(), TypeSig::MVar(_))
    }

    /// Classifies the key derivation of `method`.
    ///
    /// Returns `None` for methods matching neither family; decoys are logged as such.
    #[must_use]
    pub fn classify_method(
        &self,
        module: &Module,
        method: Token,
        events: &EventLog,
    ) -> Option<SiteMode> {
        let instructions = &module.method(method)?.body.as_ref()?.instructions;
        if instructions.len() < self.min_instructions {
            events
                .record(EventKind::DecoyRejected)
                .method(method)
                .message(format!(
                    "{} instructions, below the decryptor floor of {}",
                    instructions.len(),
                    self.min_instructions
                ));
            return None;
        }

        if let Some(found) = self.native.match_at(instructions, 0) {
            let routine = found
                .get("native")
                .and_then(Instruction::token)
                .and_then(|token| native_routine(module, token));
            match routine {
                Some(routine) if calls_required_apis(module, instructions) => {
                    return Some(SiteMode::Native { routine });
                }
                Some(_) => {
                    events
                        .record(EventKind::DecoyRejected)
                        .method(method)
                        .message("native key prologue without the decryption API calls");
                    return None;
                }
                None => {}
            }
        }

        let found = self
            .arithmetic
            .find_from(instructions, assembly_check_len(module, instructions))?;
        let multiplier = found.get("multiplier")?.ldc_i4_value()?;
        let xor_key = found.get("xor")?.ldc_i4_value()?;
        #[allow(clippy::cast_sign_loss)]
        Some(SiteMode::Arithmetic {
            multiplier: multiplier as u32,
            xor_key: xor_key as u32,
        })
    }

    /// Classifies every candidate declared on `owner`.
    ///
    /// Candidates are simplified in place first. The returned sites share `blob`.
    pub fn classify(
        &self,
        module: &mut Module,
        owner: Token,
        blob: &DecryptedBlob,
        simplifier: &dyn InstructionSimplifier,
        events: &EventLog,
    ) -> Vec<DecryptionSite> {
        let candidates: Vec<Token> = module
            .methods_of(owner)
            .filter(|method| Self::is_candidate(method))
            .map(|method| method.token)
            .collect();

        let mut sites = Vec::new();
        for candidate in candidates {
            simplifier.simplify(module, candidate);
            let Some(mode) = self.classify_method(module, candidate, events) else {
                continue;
            };

            let family = match &mode {
                SiteMode::Native { routine } => format!("native key via {}", routine.token),
                SiteMode::Arithmetic {
                    multiplier,
                    xor_key,
                } => format!("arithmetic key {multiplier:#010x} / {xor_key:#010x}"),
            };
            events
                .record(EventKind::DecryptorIdentified)
                .method(candidate)
                .message(family);
            sites.push(DecryptionSite::new(candidate, mode, blob.clone()));
        }
        sites
    }
}

impl std::fmt::Debug for DecryptorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptorClassifier")
            .field("native", &self.native)
            .field("arithmetic", &self.arithmetic)
            .field("min_instructions", &self.min_instructions)
            .finish()
    }
}

/// The native `int32 (int32)` method `token` refers to.
fn native_routine(module: &Module, token: Token) -> Option<NativeRoutine> {
    if !token.is_table(TableId::MethodDef) {
        return None;
    }
    let method = module.method(token)?;
    if !method.is_static()
        || !method.is_native()
        || !method.signature.matches("System.Int32", "(System.Int32)")
    {
        return None;
    }
    let code = method
        .native_code
        .clone()
        .unwrap_or_else(|| Arc::from(&[][..]));
    Some(NativeRoutine::new(method.token, &method.name, code))
}

fn calls_required_apis(module: &Module, instructions: &[Instruction]) -> bool {
    let called: Vec<String> = instructions
        .iter()
        .filter_map(Instruction::token)
        .filter(|token| is_method_token(*token))
        .filter_map(|token| module.method_full_name(token))
        .collect();
    REQUIRED_DECRYPTOR_CALLS
        .iter()
        .all(|api| called.iter().any(|name| name == api))
}

/// Length of the `GetExecutingAssembly().Equals(GetCallingAssembly())` idiom at the start of a
/// body, `0` if absent.
fn assembly_check_len(module: &Module, instructions: &[Instruction]) -> usize {
    let [first, second, third, ..] = instructions else {
        return 0;
    };
    let idiom = first.is(opcodes::CALL)
        && references_method(module, first, "System.Reflection.Assembly", "()")
        && second.is(opcodes::CALL)
        && references_method(module, second, "System.Reflection.Assembly", "()")
        && third.is(opcodes::CALLVIRT)
        && references_method(module, third, "System.Boolean", "(System.Object)");
    if idiom {
        3
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deobfuscation::NopStripper,
        metadata::{
            builder::ModuleBuilder,
            method::{MethodAccessFlags, MethodModifiers},
            signatures::MethodSig,
        },
        test::{ConfuserExModuleBuilder, DecoyKind, NativeMode},
    };

    fn classifier() -> DecryptorClassifier {
        DecryptorClassifier::new(&ConstantsConfig::default())
    }

    #[test]
    fn test_candidate_shape() {
        let mut builder = ModuleBuilder::new("Shapes.dll");
        let global = builder.global_type();
        let mut add = |name: &str, sig: MethodSig| {
            let token = builder.method(
                global,
                name,
                MethodAccessFlags::ASSEM,
                MethodModifiers::STATIC,
                sig,
            );
            builder
                .set_body(token, crate::metadata::method::MethodBody::new(Vec::new(), Vec::new()))
                .unwrap();
            token
        };
        let good = add(
            "Get",
            MethodSig::new_static(TypeSig::MVar(0), vec![TypeSig::U4]).with_generic_params(1),
        );
        let signed = add(
            "GetSigned",
            MethodSig::new_static(TypeSig::MVar(0), vec![TypeSig::I4]).with_generic_params(1),
        );
        let two_params = add(
            "Two",
            MethodSig::new_static(TypeSig::MVar(0), vec![TypeSig::U4, TypeSig::U4])
                .with_generic_params(1),
        );
        let not_generic = add(
            "Plain",
            MethodSig::new_static(TypeSig::String, vec![TypeSig::U4]),
        );
        let wrong_param = add(
            "Wide",
            MethodSig::new_static(TypeSig::MVar(0), vec![TypeSig::U8]).with_generic_params(1),
        );
        let module = builder.build();

        let is = |token| DecryptorClassifier::is_candidate(module.method(token).unwrap());
        assert!(is(good));
        assert!(is(signed));
        assert!(!is(two_params));
        assert!(!is(not_generic));
        assert!(!is(wrong_param));
    }

    #[test]
    fn test_arithmetic_site() {
        let fixture = ConfuserExModuleBuilder::new()
            .arithmetic(0x2F1A_9C3B, 0x5151_A7E1)
            .native_mode(NativeMode::None)
            .build();
        let events = EventLog::new();

        let mode = classifier()
            .classify_method(&fixture.module, fixture.arithmetic_decryptor, &events)
            .unwrap();
        assert!(matches!(
            mode,
            SiteMode::Arithmetic {
                multiplier: 0x2F1A_9C3B,
                xor_key: 0x5151_A7E1
            }
        ));
    }

    #[test]
    fn test_assembly_check_is_skipped() {
        let fixture = ConfuserExModuleBuilder::new()
            .arithmetic(7, 9)
            .with_assembly_check()
            .native_mode(NativeMode::None)
            .build();
        let module = &fixture.module;
        let body = &module
            .method(fixture.arithmetic_decryptor)
            .unwrap()
            .body
            .as_ref()
            .unwrap()
            .instructions;

        assert_eq!(assembly_check_len(module, body), 3);
        assert!(matches!(
            classifier().classify_method(module, fixture.arithmetic_decryptor, &EventLog::new()),
            Some(SiteMode::Arithmetic {
                multiplier: 7,
                xor_key: 9
            })
        ));
    }

    #[test]
    fn test_native_site() {
        let fixture = ConfuserExModuleBuilder::new()
            .native_mode(NativeMode::Xor(0x1234))
            .build();
        let native = fixture.native_decryptor.unwrap();

        let mode = classifier()
            .classify_method(&fixture.module, native, &EventLog::new())
            .unwrap();
        let SiteMode::Native { routine } = mode else {
            panic!("expected a native site");
        };
        assert_eq!(Some(routine.token), fixture.native_routine);
        assert!(!routine.code.is_empty());
    }

    #[test]
    fn test_rejects_short_decoy() {
        let fixture = ConfuserExModuleBuilder::new()
            .decoy(DecoyKind::Short)
            .build();
        let decoy = fixture.decoys[0];
        let events = EventLog::new();

        assert!(DecryptorClassifier::is_candidate(fixture.module.method(decoy).unwrap()));
        assert!(classifier()
            .classify_method(&fixture.module, decoy, &events)
            .is_none());
        assert_eq!(events.filter_method(decoy).count(), 1);
        assert!(events.has(EventKind::DecoyRejected));
    }

    #[test]
    fn test_rejects_native_decoy_missing_any_api() {
        for missing in 0..REQUIRED_DECRYPTOR_CALLS.len() {
            let fixture = ConfuserExModuleBuilder::new()
                .decoy(DecoyKind::NativeWithout(missing))
                .build();
            let decoy = fixture.decoys[0];
            let events = EventLog::new();

            assert!(
                classifier()
                    .classify_method(&fixture.module, decoy, &events)
                    .is_none(),
                "decoy without {} accepted",
                REQUIRED_DECRYPTOR_CALLS[missing]
            );
            assert!(events.has(EventKind::DecoyRejected));
        }
    }

    #[test]
    fn test_strict_template_needs_ldloca() {
        let fixture = ConfuserExModuleBuilder::new()
            .native_mode(NativeMode::Xor(1))
            .native_skip_slot_nop()
            .build();
        let native = fixture.native_decryptor.unwrap();

        let lenient = classifier();
        let strict =
            DecryptorClassifier::new(&ConstantsConfig::default().with_strict_native_template(true));

        assert!(lenient
            .classify_method(&fixture.module, native, &EventLog::new())
            .is_some());
        assert!(strict
            .classify_method(&fixture.module, native, &EventLog::new())
            .is_none());
    }

    #[test]
    fn test_classify_collects_all_sites() {
        let fixture = ConfuserExModuleBuilder::new()
            .arithmetic(3, 5)
            .native_mode(NativeMode::Xor(0x77))
            .decoy(DecoyKind::Short)
            .decoy(DecoyKind::NativeWithout(2))
            .build();
        let mut module = fixture.module.clone();
        let events = EventLog::new();
        let blob = DecryptedBlob::new(fixture.plain_blob.clone());

        let sites = classifier().classify(
            &mut module,
            Token::new(0x0200_0001),
            &blob,
            &NopStripper,
            &events,
        );

        assert_eq!(sites.len(), 2);
        assert_eq!(sites.iter().filter(|s| s.is_native()).count(), 1);
        assert_eq!(events.count_kind(EventKind::DecryptorIdentified), 2);
        assert_eq!(events.count_kind(EventKind::DecoyRejected), 2);
    }
}
