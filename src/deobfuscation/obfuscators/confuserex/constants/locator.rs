//! Locating the embedded LZMA decompression routine.
//!
//! ConfuserEx compresses the constants buffer and ships a managed LZMA decoder as a static
//! `byte[] Decompress(byte[])` method on `<Module>`, backed by a handful of nested helper types
//! (range decoder, bit trees, out window, ...). The routine is recognized by the stream APIs it
//! has to call, independent of the names the protector assigned:
//!
//! ```text
//! newobj   void MemoryStream::.ctor(byte[])            (or the (byte[], bool) overload)
//! callvirt int64 Stream::get_Length()
//! callvirt int32 Stream::Read(byte[], int32, int32)
//! callvirt void  Decoder::Code(Stream, Stream, int64, int64)
//! ```
//!
//! Either `MemoryStream` constructor satisfies the first entry. ConfuserEx releases differ in
//! which overload the decoder uses, so requiring both would miss some builds.
//!
//! The fourth instruction of the routine constructs the decoder object; its declaring type is
//! the root of the helper graph that is carried into the host unit.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::{
    assembly::Instruction,
    deobfuscation::{ConstantsConfig, EventKind, EventLog, InstructionSimplifier},
    metadata::{
        module::Module,
        token::{TableId, Token},
    },
};

/// Call shapes a decompression routine has to contain. Every entry is a list of accepted
/// `(return type, parameters)` alternatives.
const REQUIRED_CALLS: &[&[(&str, &str)]] = &[
    &[
        ("System.Void", "(System.Byte[])"),
        ("System.Void", "(System.Byte[],System.Boolean)"),
    ],
    &[("System.Int64", "()")],
    &[("System.Int32", "(System.Byte[],System.Int32,System.Int32)")],
    &[(
        "System.Void",
        "(System.IO.Stream,System.IO.Stream,System.Int64,System.Int64)",
    )],
];

/// Position of the decoder construction inside the routine.
const DECODER_CTOR_INDEX: usize = 3;

/// The located decompression routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LzmaRoutine {
    /// The `byte[] (byte[])` method on `<Module>`
    pub method: Token,
    /// Nested types the routine depends on, in discovery order
    pub helper_types: Vec<Token>,
}

/// Returns `true` if `token` refers to a method (definition, reference or instantiation).
pub(crate) fn is_method_token(token: Token) -> bool {
    matches!(
        token.table_id(),
        Some(TableId::MethodDef | TableId::MemberRef | TableId::MethodSpec)
    )
}

/// Returns `true` if `instruction` has a method operand whose signature is `ret params`.
pub(crate) fn references_method(
    module: &Module,
    instruction: &Instruction,
    return_type: &str,
    params: &str,
) -> bool {
    instruction
        .token()
        .filter(|token| is_method_token(*token))
        .and_then(|token| module.method_sig(token))
        .is_some_and(|sig| sig.matches(return_type, params))
}

fn is_decompressor(module: &Module, instructions: &[Instruction]) -> bool {
    REQUIRED_CALLS.iter().all(|alternatives| {
        instructions.iter().any(|instruction| {
            alternatives
                .iter()
                .any(|(ret, params)| references_method(module, instruction, ret, params))
        })
    })
}

/// Scans `<Module>` for the LZMA decompression routine.
///
/// Candidates are simplified in place before their shape is checked. The first accepted
/// candidate wins. Returns `None` if the module carries no such routine.
pub fn locate(
    module: &mut Module,
    simplifier: &dyn InstructionSimplifier,
    config: &ConstantsConfig,
    events: &EventLog,
) -> Option<LzmaRoutine> {
    let global = module.global_type()?.token;
    let candidates: Vec<Token> = module
        .methods_of(global)
        .filter(|method| method.is_static() && method.body.is_some())
        .filter(|method| {
            method
                .signature
                .matches("System.Byte[]", "(System.Byte[])")
        })
        .map(|method| method.token)
        .collect();

    for candidate in candidates {
        simplifier.simplify(module, candidate);
        let Some(body) = module
            .method(candidate)
            .and_then(|method| method.body.as_ref())
        else {
            continue;
        };

        if body.instructions.len() < config.min_decompressor_instructions {
            continue;
        }
        if !is_decompressor(module, &body.instructions) {
            continue;
        }

        let seed = body.instructions[DECODER_CTOR_INDEX]
            .token()
            .filter(|token| token.is_table(TableId::MethodDef))
            .and_then(|token| module.method(token))
            .map(|method| method.declaring_type);
        let Some(seed) = seed else {
            events
                .record(EventKind::DecoyRejected)
                .method(candidate)
                .message("decompressor does not construct its decoder at instruction 3");
            continue;
        };

        let helper_types = collect_helper_types(module, seed);
        events
            .record(EventKind::DecompressorLocated)
            .method(candidate)
            .message(format!(
                "LZMA decompressor with {} helper type(s)",
                helper_types.len()
            ));
        return Some(LzmaRoutine {
            method: candidate,
            helper_types,
        });
    }

    None
}

/// Breadth-first walk from `seed` over the declaring types of every method referenced by the
/// visited types' bodies, keeping nested types only.
fn collect_helper_types(module: &Module, seed: Token) -> Vec<Token> {
    let mut found = Vec::new();
    let mut visited = FxHashSet::default();
    let mut queue = VecDeque::from([seed]);
    visited.insert(seed);
    if module.is_nested(seed) {
        found.push(seed);
    }

    while let Some(current) = queue.pop_front() {
        let referenced = module
            .methods_of(current)
            .filter_map(|method| method.body.as_ref())
            .flat_map(|body| body.instructions.iter())
            .filter_map(Instruction::token)
            .filter(|token| token.is_table(TableId::MethodDef))
            .filter_map(|token| module.method(token))
            .map(|method| method.declaring_type);

        for ty in referenced {
            if !module.is_nested(ty) || !visited.insert(ty) {
                continue;
            }
            found.push(ty);
            queue.push_back(ty);
        }
    }

    found
}
