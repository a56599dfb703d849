//! Recovering the decrypted constants buffer.
//!
//! The module constructor of a protected assembly calls an initializer that looks like this
//! once simplified:
//!
//! ```text
//! ldc.i4   <words>
//! newarr   System.UInt32
//! dup
//! ldtoken  field <Module>/<struct> <Module>::<data>
//! call     void RuntimeHelpers::InitializeArray(Array, RuntimeFieldHandle)
//! ...      decrypt the words into a byte[]
//! call     uint8[] <Module>::Decompress(uint8[])
//! stsfld   uint8[] <Module>::<buffer>
//! ...
//! ```
//!
//! The decryption in between is keyed per build and is never reimplemented. Instead the
//! initializer is cut down to the decryption alone and run:
//!
//! 1. the array prologue becomes `ldarg.0`, so the encrypted words come from the caller
//! 2. the decompression call and the field store become `ret`, and everything after is dropped
//! 3. leftovers are stripped up to the first integer constant or the input load, whichever
//!    comes first
//!
//! The resulting `byte[] (byte[])` body is hosted in a [`HostUnit`], invoked with the initial
//! data of the array field, and its output is decompressed natively.

use crate::{
    assembly::{opcodes, predicates, Instruction, InstructionTemplate},
    deobfuscation::{ConstantsConfig, EventKind, EventLog, InstructionSimplifier},
    metadata::{
        method::MethodBody,
        module::Module,
        signatures::TypeSig,
        token::{TableId, Token},
    },
    utils::decompress::Decompressor,
    Error, Result,
};

use super::{
    decoder::DecryptedBlob,
    host::{with_loaded_image, HostUnit, UnitExecutor},
    locator::{references_method, LzmaRoutine},
};

/// Everything the constants scheme added to the module, for a later cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantsArtifacts {
    /// The initializer that fills the buffer
    pub initializer: Token,
    /// The field holding the encrypted words as RVA data
    pub array_field: Token,
    /// The static field receiving the decompressed buffer
    pub decrypted_field: Token,
    /// The value type backing the array field, if it is defined in the module
    pub array_type: Option<Token>,
    /// The LZMA decompression routine
    pub decompressor: Token,
    /// Nested types the decompression routine depends on
    pub helper_types: Vec<Token>,
}

/// Fields referenced by a recognized initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InitializerFields {
    array: Token,
    decrypted: Token,
}

/// The collaborators extraction runs with.
pub(crate) struct ExtractionContext<'a> {
    pub simplifier: &'a dyn InstructionSimplifier,
    pub decompressor: &'a dyn Decompressor,
    pub executor: &'a dyn UnitExecutor,
    pub config: &'a ConstantsConfig,
    pub events: &'a EventLog,
}

fn array_prologue() -> InstructionTemplate {
    InstructionTemplate::new("array-prologue")
        .step(predicates::ldc_i4())
        .step(predicates::op(opcodes::NEWARR))
        .step(predicates::op(opcodes::DUP))
        .step(predicates::op(opcodes::LDTOKEN))
        .step(predicates::call())
}

fn decompress_store(decompressor: Token) -> InstructionTemplate {
    InstructionTemplate::new("decompress-store")
        .step(Box::new(move |i: &Instruction| {
            i.is(opcodes::CALL) && i.token() == Some(decompressor)
        }))
        .step(predicates::op(opcodes::STSFLD))
}

/// Recognizes the initializer shape and returns the two fields it touches.
fn initializer_fields(
    module: &Module,
    instructions: &[Instruction],
    decompressor: Token,
) -> Option<InitializerFields> {
    let global = module.global_type()?.token;
    let mut array = None;
    let mut decrypted = None;

    for pair in instructions.windows(2) {
        let (current, next) = (&pair[0], &pair[1]);

        if current.is(opcodes::LDTOKEN) && next.is(opcodes::CALL) {
            let field = current.token().filter(|t| t.is_table(TableId::Field));
            if field.is_some()
                && references_method(
                    module,
                    next,
                    "System.Void",
                    "(System.Array,System.RuntimeFieldHandle)",
                )
            {
                array = field;
            }
        }

        if current.is(opcodes::CALL)
            && current.token() == Some(decompressor)
            && next.is(opcodes::STSFLD)
        {
            let field = next
                .token()
                .and_then(|token| module.field(token))
                .filter(|field| field.declaring_type == global);
            if let Some(field) = field {
                decrypted = Some(field.token);
            }
        }
    }

    Some(InitializerFields {
        array: array?,
        decrypted: decrypted?,
    })
}

/// Cuts an initializer body down to its decryption logic.
///
/// # Errors
/// Returns [`Error::Undetected`] if the array prologue or the decompression store is missing.
pub(crate) fn isolate_decryption(body: &MethodBody, decompressor: Token) -> Result<MethodBody> {
    let instructions = &body.instructions;
    let start = array_prologue()
        .find(instructions)
        .ok_or_else(|| Error::Undetected("initializer has no array prologue".to_string()))?;
    let end = decompress_store(decompressor)
        .find_from(instructions, start.end())
        .ok_or_else(|| {
            Error::Undetected("initializer does not store the decompressed buffer".to_string())
        })?;

    let mut isolated = instructions[..end.start].to_vec();
    isolated.push(Instruction::ret(instructions[end.start].offset));

    let load_input = Instruction::ldarg_0(instructions[start.start].offset);
    isolated.splice(start.start..start.end(), std::iter::once(load_input));

    let first_constant = isolated
        .iter()
        .position(Instruction::is_ldc_i4)
        .unwrap_or(isolated.len())
        .min(start.start);
    isolated.drain(..first_constant);

    Ok(MethodBody {
        instructions: isolated,
        ..body.clone()
    })
}

/// Finds the constants initializer, runs its decryption and decompresses the result.
///
/// The calls of the module constructor to static `void ()` methods are tried in order,
/// followed by the module constructor itself. A candidate whose re-hosting fails is logged
/// and skipped.
///
/// # Errors
/// Returns [`Error::Undetected`] if no candidate yields a buffer.
pub(crate) fn extract(
    module: &mut Module,
    routine: &LzmaRoutine,
    cx: &ExtractionContext<'_>,
) -> Result<(ConstantsArtifacts, DecryptedBlob)> {
    let Some(cctor) = module.static_constructor() else {
        return Err(Error::Undetected(
            "module has no static constructor".to_string(),
        ));
    };
    let cctor_token = cctor.token;

    let mut candidates: Vec<Token> = Vec::new();
    for instruction in cctor.body.iter().flat_map(|body| body.instructions.iter()) {
        if !instruction.is(opcodes::CALL) {
            continue;
        }
        let Some(method) = instruction
            .token()
            .filter(|token| token.is_table(TableId::MethodDef))
            .and_then(|token| module.method(token))
        else {
            continue;
        };
        if method.is_static()
            && method.body.is_some()
            && method.signature.matches("System.Void", "()")
            && !candidates.contains(&method.token)
        {
            candidates.push(method.token);
        }
    }
    if !candidates.contains(&cctor_token) {
        candidates.push(cctor_token);
    }

    for candidate in candidates {
        cx.simplifier.simplify(module, candidate);
        let Some(body) = module.method(candidate).and_then(|m| m.body.as_ref()) else {
            continue;
        };
        if body.instructions.len() < cx.config.min_initializer_instructions {
            continue;
        }
        let Some(fields) = initializer_fields(module, &body.instructions, routine.method) else {
            continue;
        };

        cx.events
            .record(EventKind::InitializerFound)
            .method(candidate)
            .message(format!(
                "array field {}, buffer field {}",
                fields.array, fields.decrypted
            ));

        match run_initializer(module, candidate, routine, fields, cx) {
            Ok(blob) => {
                cx.events
                    .record(EventKind::BlobExtracted)
                    .method(candidate)
                    .message(format!("{} byte constants buffer", blob.len()));
                let artifacts = ConstantsArtifacts {
                    initializer: candidate,
                    array_field: fields.array,
                    decrypted_field: fields.decrypted,
                    array_type: array_value_type(module, fields.array),
                    decompressor: routine.method,
                    helper_types: routine.helper_types.clone(),
                };
                return Ok((artifacts, blob));
            }
            Err(error) => {
                cx.events
                    .record(EventKind::Warning)
                    .method(candidate)
                    .message(format!("initializer could not be re-hosted: {error}"));
            }
        }
    }

    Err(Error::Undetected(
        "no constants initializer could be executed".to_string(),
    ))
}

fn run_initializer(
    module: &Module,
    initializer: Token,
    routine: &LzmaRoutine,
    fields: InitializerFields,
    cx: &ExtractionContext<'_>,
) -> Result<DecryptedBlob> {
    let method = module
        .method(initializer)
        .ok_or_else(|| malformed_error!("Unknown initializer {}", initializer))?;
    let body = method
        .body
        .as_ref()
        .ok_or_else(|| malformed_error!("Initializer {} has no body", initializer))?;
    let encrypted = module
        .field(fields.array)
        .filter(|field| field.has_field_rva())
        .and_then(|field| field.initial_value.as_deref())
        .ok_or_else(|| Error::Undetected(format!("field {} has no initial data", fields.array)))?;

    let isolated = isolate_decryption(body, routine.method)?;
    let unit = HostUnit::new(module, &method.name, isolated, &routine.helper_types);

    let mut image = Vec::new();
    unit.write_to(&mut image)?;
    let compressed = with_loaded_image(&image, |loaded| {
        let entry = loaded
            .entry_method()
            .ok_or_else(|| Error::ImageFormat("host image has no entry method".to_string()))?;
        cx.executor.invoke(loaded, entry, encrypted)
    })?;

    let plain = cx.decompressor.decompress(&compressed)?;
    Ok(DecryptedBlob::new(plain))
}

fn array_value_type(module: &Module, array_field: Token) -> Option<Token> {
    let TypeSig::ValueType(name) = &module.field(array_field)?.signature else {
        return None;
    };
    module
        .types()
        .find(|ty| module.type_full_name(ty.token).as_deref() == Some(name.as_str()))
        .map(|ty| ty.token)
}
