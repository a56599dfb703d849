//! Constants engine integration tests.
//!
//! These tests drive the public surface only: blob decoding through [`DecryptionSite`], the
//! ConfuserEx LZMA codec, and the engine entry points on modules that do not carry the scheme.
//! End-to-end detection over synthesized protected modules is covered by the unit tests of the
//! engine, which share a crate-private fixture.

use std::io::Cursor;

use confuserex_constants::{
    assembly::InstructionAssembler,
    deobfuscation::{
        Collaborators, ConstantsConfig, ConstantsEngine, DecryptedBlob, DecryptionSite, EventKind,
        EventLog, SiteMode,
    },
    emulation::{FnEmulator, NativeRoutine, UnsupportedEmulator},
    metadata::{
        builder::ModuleBuilder,
        method::{MethodAccessFlags, MethodBody, MethodModifiers},
        module::Module,
        signatures::{MethodSig, TypeSig},
        token::Token,
    },
    utils::decompress::{Decompressor, LzmaDecompressor},
    Error,
};

const DECRYPTOR: Token = Token(0x0600_0010);

fn string_record(value: &str) -> Vec<u8> {
    let mut record = (value.len() as u32).to_le_bytes().to_vec();
    record.extend_from_slice(value.as_bytes());
    record
}

fn array_record(payload: &[u8]) -> Vec<u8> {
    let mut record = (payload.len() as u32 + 4).to_le_bytes().to_vec();
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(payload);
    record
}

fn pad(blob: &mut Vec<u8>) {
    while blob.len() % 4 != 0 {
        blob.push(0);
    }
}

/// Blob layout, with word indices under an identity key:
///
/// ```text
/// 0x00  "Hello"              index 0
/// 0x0C  i32 -559038737       index 3
/// 0x10  f64 2.5              index 4
/// 0x18  byte[] {1,2,3,4,5}   index 6
/// ```
fn sample_blob() -> DecryptedBlob {
    let mut blob = string_record("Hello");
    pad(&mut blob);
    blob.extend_from_slice(&(-559_038_737i32).to_le_bytes());
    blob.extend_from_slice(&2.5f64.to_le_bytes());
    blob.extend_from_slice(&array_record(&[1, 2, 3, 4, 5]));
    pad(&mut blob);
    DecryptedBlob::new(blob)
}

fn identity_site() -> DecryptionSite {
    DecryptionSite::new(
        DECRYPTOR,
        SiteMode::Arithmetic {
            multiplier: 1,
            xor_key: 0,
        },
        sample_blob(),
    )
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut standard = Vec::new();
    lzma_rs::lzma_compress(&mut Cursor::new(data), &mut standard).unwrap();

    // ConfuserEx keeps a 4 byte size where the standard header has 8
    let mut packed = standard[..5].to_vec();
    packed.extend_from_slice(&(data.len() as i32).to_le_bytes());
    packed.extend_from_slice(&standard[13..]);
    packed
}

fn plain_module() -> Module {
    let mut builder = ModuleBuilder::new("Plain.dll");
    let global = builder.global_type();
    let method = builder.method(
        global,
        "Add",
        MethodAccessFlags::PUBLIC,
        MethodModifiers::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
    );

    let mut asm = InstructionAssembler::new();
    asm.ldarg(0).unwrap().ldarg(1).unwrap().add().unwrap().ret().unwrap();
    builder
        .set_body(
            method,
            MethodBody::new(asm.finish_instructions().unwrap(), Vec::new()),
        )
        .unwrap();
    builder.build()
}

#[test]
fn test_decode_identity_keyed_values() {
    let site = identity_site();

    assert_eq!(site.decrypt_string(&UnsupportedEmulator, 0).unwrap(), "Hello");
    assert_eq!(
        site.decrypt_scalar::<i32>(&UnsupportedEmulator, 3).unwrap(),
        -559_038_737
    );
    assert_eq!(
        site.decrypt_scalar::<u32>(&UnsupportedEmulator, 3).unwrap(),
        0xDEAD_BEEF
    );
    assert_eq!(site.decrypt_scalar::<f64>(&UnsupportedEmulator, 4).unwrap(), 2.5);
    assert_eq!(
        site.decrypt_array(&UnsupportedEmulator, 6).unwrap(),
        vec![1, 2, 3, 4, 5]
    );
}

#[test]
fn test_decode_with_arithmetic_key() {
    // 3 * 0x11 ^ 0x30 = 0x03, which lands on the i32 record
    let site = DecryptionSite::new(
        DECRYPTOR,
        SiteMode::Arithmetic {
            multiplier: 0x11,
            xor_key: 0x30,
        },
        sample_blob(),
    );

    assert_eq!(site.compute_offset(&UnsupportedEmulator, 3).unwrap(), 0x0C);
    assert_eq!(
        site.decrypt_scalar::<i32>(&UnsupportedEmulator, 3).unwrap(),
        -559_038_737
    );
}

#[test]
fn test_offset_ignores_the_top_key_bits() {
    let site = identity_site();

    // Only the low 30 bits of the key select a word
    assert_eq!(
        site.compute_offset(&UnsupportedEmulator, 0xC000_0000).unwrap(),
        0
    );
    assert_eq!(
        site.decrypt_string(&UnsupportedEmulator, 0x4000_0000).unwrap(),
        "Hello"
    );
}

#[test]
fn test_decode_outside_the_blob() {
    let site = identity_site();

    match site.decrypt_string(&UnsupportedEmulator, 0x100) {
        Err(Error::OffsetOutOfRange {
            offset, blob_len, ..
        }) => {
            assert_eq!(offset, 0x400);
            assert_eq!(blob_len, site.blob().len());
        }
        other => panic!("expected OffsetOutOfRange, got {other:?}"),
    }
}

#[test]
fn test_decode_with_native_key() {
    let routine = NativeRoutine::new(Token::new(0x0600_0020), "Key", vec![0xC3].into());
    let site = DecryptionSite::new(DECRYPTOR, SiteMode::Native { routine }, sample_blob());
    assert!(site.is_native());

    let emulator = FnEmulator::new(|_: &NativeRoutine, input: i32| Some(input - 100));
    assert_eq!(site.decrypt_string(&emulator, 100).unwrap(), "Hello");
    assert_eq!(site.decrypt_array(&emulator, 106).unwrap(), vec![1, 2, 3, 4, 5]);

    assert!(matches!(
        site.decrypt_string(&UnsupportedEmulator, 100),
        Err(Error::UnresolvedNativeKey { index: 100, .. })
    ));
}

#[test]
fn test_lzma_payload_round_trip() {
    let mut plain = string_record("The quick brown fox");
    pad(&mut plain);
    plain.extend_from_slice(&array_record(&[0xAA; 32]));

    let packed = compress(&plain);
    let decompressed = LzmaDecompressor.decompress(&packed).unwrap();
    assert_eq!(decompressed, plain);

    let site = DecryptionSite::new(
        DECRYPTOR,
        SiteMode::Arithmetic {
            multiplier: 1,
            xor_key: 0,
        },
        DecryptedBlob::new(decompressed),
    );
    assert_eq!(
        site.decrypt_string(&UnsupportedEmulator, 0).unwrap(),
        "The quick brown fox"
    );
    assert_eq!(site.decrypt_array(&UnsupportedEmulator, 6).unwrap(), vec![0xAA; 32]);
}

#[test]
fn test_truncated_lzma_payload() {
    assert!(matches!(
        LzmaDecompressor.decompress(&[0x5D, 0x00, 0x00]),
        Err(Error::Decompression(_))
    ));
}

#[test]
fn test_unprotected_module_is_not_detected() {
    let module = plain_module();

    assert!(ConstantsEngine::detect(&module).is_none());

    let error = ConstantsEngine::detect_default(&module).unwrap_err();
    assert!(matches!(error, Error::Undetected(_)));
    assert!(error.is_detection_failure());
}

#[test]
fn test_undetected_module_logs_a_warning() {
    let module = plain_module();
    let config = ConstantsConfig::default();
    let events = EventLog::new();

    let result =
        ConstantsEngine::detect_with(&module, config.clone(), Collaborators::new(&config), &events);

    assert!(result.is_err());
    assert_eq!(events.warnings().count(), 1);
    assert!(!events.has(EventKind::DetectionComplete));
}

#[test]
fn test_detect_all_reports_per_module() {
    let modules = vec![plain_module(), plain_module(), Module::default()];
    let config = ConstantsConfig::default();

    let results = ConstantsEngine::detect_all(&modules, &config, &Collaborators::new(&config));

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(Result::is_err));
}
