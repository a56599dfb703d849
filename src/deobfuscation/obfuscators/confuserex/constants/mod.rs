//! ConfuserEx constants protection.
//!
//! The constants protection of ConfuserEx moves every string, numeric literal and initialized
//! array of a module into a single buffer, which is encrypted, LZMA-compressed and stored as
//! field data. Each original use of a constant becomes a call to one of a few generic
//! decryptors on `<Module>`:
//!
//! ```text
//! ldc.i4   0x5B8F0A31            // opaque index
//! call     !!0 <Module>::Get<string>(uint32)
//! ```
//!
//! # Architecture
//!
//! Detection is a one-way pipeline over a private copy of the module:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   locator    │──▶│  extractor   │──▶│  classifier  │──▶│   decoder    │
//! │ LZMA routine │   │ blob via host│   │ native/arith │   │ offset + read│
//! │ + helpers    │   │ unit + LZMA  │   │ sites        │   │ per index    │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! - [`locator`] finds the managed LZMA decoder and the nested types it depends on
//! - [`extractor`] isolates the buffer decryption from the module initializer, runs it inside a
//!   synthesized [`host::HostUnit`] and decompresses the result
//! - the classifier recognizes the decryptor methods and how each one derives its key
//! - [`decoder`] turns `(site, index)` into an offset and reads the value
//!
//! Detection either produces a [`ConstantsEngine`] with the buffer and every recognized site,
//! or fails with [`crate::Error::Undetected`]. A failure is never fatal: it only means the
//! module does not use this scheme, or uses a variant that is not recognized.
//!
//! Once detected, the engine is immutable. Decoding takes `&self`, allocates its evaluation
//! state per call and is safe to run from many threads at once.
//!
//! # Collaborators
//!
//! Four concerns are injected through [`Collaborators`]:
//!
//! | Trait                           | Default                    | Used for                     |
//! |---------------------------------|----------------------------|------------------------------|
//! | [`InstructionSimplifier`]       | [`NopStripper`]            | canonicalizing bodies        |
//! | [`Decompressor`]                | [`LzmaDecompressor`]       | the compressed buffer        |
//! | [`host::UnitExecutor`]          | [`CilInterpreter`]         | running the re-hosted body   |
//! | [`NativeEmulator`]              | [`UnsupportedEmulator`]    | native key routines          |
//!
//! The default native emulator resolves nothing, so native-mode sites are recognized but fail
//! to decode until a real x86 emulator is supplied.
//!
//! # Example
//!
//! ```rust,no_run
//! use confuserex_constants::{
//!     deobfuscation::ConstantsEngine,
//!     metadata::module::Module,
//! };
//!
//! # fn run(module: &Module) -> confuserex_constants::Result<()> {
//! if let Some(engine) = ConstantsEngine::detect(module) {
//!     for site in engine.sites() {
//!         let value = engine.decrypt_string(site, 0x5B8F_0A31)?;
//!         println!("{}: {value}", site.method());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod classifier;
pub mod decoder;
pub mod extractor;
pub mod host;
mod intern;
pub mod locator;

pub use classifier::{DecryptorClassifier, REQUIRED_DECRYPTOR_CALLS};
pub use decoder::{DecryptedBlob, DecryptedValue, DecryptionSite, Scalar, SiteMode};
pub use extractor::ConstantsArtifacts;
pub use host::{HostUnit, LoadedImage, UnitExecutor};
pub use intern::StringInterner;
pub use locator::LzmaRoutine;

use std::{fmt, sync::Arc};

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::{
    deobfuscation::{ConstantsConfig, EventKind, EventLog, InstructionSimplifier, NopStripper},
    emulation::{CilInterpreter, NativeEmulator, UnsupportedEmulator},
    metadata::{
        module::Module,
        signatures::{ElementType, TypeSig},
        token::Token,
    },
    utils::decompress::{Decompressor, LzmaDecompressor},
    Error, Result,
};

use extractor::ExtractionContext;

/// How far detection got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// No decompression routine was found yet
    Unlocated,
    /// The constants buffer is available, decryptors are not classified yet
    BlobExtracted,
    /// Decryptors are classified; the engine is ready for decoding
    SitesClassified,
}

/// The pluggable parts of detection and decoding.
#[derive(Clone)]
pub struct Collaborators {
    /// Canonicalizes method bodies before they are matched
    pub simplifier: Arc<dyn InstructionSimplifier>,
    /// Decompresses the buffer produced by the re-hosted initializer
    pub decompressor: Arc<dyn Decompressor>,
    /// Runs the re-hosted initializer
    pub executor: Arc<dyn UnitExecutor>,
    /// Evaluates native key routines
    pub emulator: Arc<dyn NativeEmulator>,
}

impl Collaborators {
    /// The default set, with the interpreter limited by `config`.
    #[must_use]
    pub fn new(config: &ConstantsConfig) -> Self {
        Collaborators {
            simplifier: Arc::new(NopStripper),
            decompressor: Arc::new(LzmaDecompressor),
            executor: Arc::new(CilInterpreter::new(config.execution.clone())),
            emulator: Arc::new(UnsupportedEmulator),
        }
    }

    /// Replaces the instruction simplifier.
    #[must_use]
    pub fn with_simplifier(mut self, simplifier: Arc<dyn InstructionSimplifier>) -> Self {
        self.simplifier = simplifier;
        self
    }

    /// Replaces the decompressor.
    #[must_use]
    pub fn with_decompressor(mut self, decompressor: Arc<dyn Decompressor>) -> Self {
        self.decompressor = decompressor;
        self
    }

    /// Replaces the executor of the re-hosted initializer.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn UnitExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the native emulator.
    #[must_use]
    pub fn with_emulator(mut self, emulator: Arc<dyn NativeEmulator>) -> Self {
        self.emulator = emulator;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(&ConstantsConfig::default())
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("simplifier", &self.simplifier.name())
            .finish_non_exhaustive()
    }
}

/// A detected constants scheme, ready for decoding.
pub struct ConstantsEngine {
    state: EngineState,
    blob: DecryptedBlob,
    artifacts: ConstantsArtifacts,
    sites: Vec<DecryptionSite>,
    by_method: FxHashMap<Token, usize>,
    emulator: Arc<dyn NativeEmulator>,
    strings: StringInterner,
    events: EventLog,
}

impl ConstantsEngine {
    /// Detects the scheme with the default configuration and collaborators.
    ///
    /// Returns `None` if the module is not protected, or protected by a variant this engine does
    /// not recognize.
    #[must_use]
    pub fn detect(module: &Module) -> Option<Self> {
        let config = ConstantsConfig::default();
        let collaborators = Collaborators::new(&config);
        Self::detect_with(module, config, collaborators, &EventLog::new()).ok()
    }

    /// Detects the scheme with the default collaborators.
    ///
    /// # Errors
    /// Returns [`Error::Undetected`] (or another detection failure) if the scheme is not found.
    pub fn detect_default(module: &Module) -> Result<Self> {
        let config = ConstantsConfig::default();
        let collaborators = Collaborators::new(&config);
        Self::detect_with(module, config, collaborators, &EventLog::new())
    }

    /// Detects the scheme in `module`.
    ///
    /// `module` is not modified; simplification works on a private copy. Every event of the
    /// detection run is also appended to `events`, whether detection succeeds or not.
    ///
    /// # Errors
    /// Returns an error for which [`Error::is_detection_failure`] holds if the scheme is not
    /// found or cannot be recovered.
    pub fn detect_with(
        module: &Module,
        config: ConstantsConfig,
        collaborators: Collaborators,
        events: &EventLog,
    ) -> Result<Self> {
        let local = EventLog::new();
        let mut working = module.clone();
        let result = Self::run_detection(&mut working, &config, collaborators, &local);

        events.merge(&local);
        result.map(|mut engine| {
            engine.events = local;
            engine
        })
    }

    /// Detects the scheme in every module, in parallel.
    ///
    /// The results are in the order of `modules`.
    #[must_use]
    pub fn detect_all(
        modules: &[Module],
        config: &ConstantsConfig,
        collaborators: &Collaborators,
    ) -> Vec<Result<Self>> {
        modules
            .par_iter()
            .map(|module| {
                Self::detect_with(module, config.clone(), collaborators.clone(), &EventLog::new())
            })
            .collect()
    }

    fn run_detection(
        module: &mut Module,
        config: &ConstantsConfig,
        collaborators: Collaborators,
        events: &EventLog,
    ) -> Result<Self> {
        let mut state = EngineState::Unlocated;
        let name = module.name.clone();

        let undetected = |state: EngineState, reason: &str| {
            events.record(EventKind::Warning).message(format!(
                "{name}: constants detection stopped at {state:?}: {reason}"
            ));
            Error::Undetected(reason.to_string())
        };

        let Some(routine) = locator::locate(
            module,
            collaborators.simplifier.as_ref(),
            config,
            events,
        ) else {
            return Err(undetected(state, "no LZMA decompression routine on <Module>"));
        };

        let extraction = ExtractionContext {
            simplifier: collaborators.simplifier.as_ref(),
            decompressor: collaborators.decompressor.as_ref(),
            executor: collaborators.executor.as_ref(),
            config,
            events,
        };
        let (artifacts, blob) = match extractor::extract(module, &routine, &extraction) {
            Ok(extracted) => extracted,
            Err(error) => return Err(undetected(state, &error.to_string())),
        };
        state = EngineState::BlobExtracted;

        // Decryptors live next to the module constructor, wherever the initializer is
        let owner = module
            .static_constructor()
            .map(|cctor| cctor.declaring_type)
            .ok_or_else(|| undetected(state, "module constructor vanished"))?;
        let sites = DecryptorClassifier::new(config).classify(
            module,
            owner,
            &blob,
            collaborators.simplifier.as_ref(),
            events,
        );
        state = EngineState::SitesClassified;

        let by_method = sites
            .iter()
            .enumerate()
            .map(|(position, site)| (site.method(), position))
            .collect();

        events.record(EventKind::DetectionComplete).message(format!(
            "{} byte buffer, {} decryptor(s) ({} native)",
            blob.len(),
            sites.len(),
            sites.iter().filter(|site| site.is_native()).count()
        ));

        Ok(ConstantsEngine {
            state,
            blob,
            artifacts,
            sites,
            by_method,
            emulator: collaborators.emulator,
            strings: StringInterner::new(),
            events: EventLog::new(),
        })
    }

    /// How far detection got.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The recognized decryptors.
    #[must_use]
    pub fn sites(&self) -> &[DecryptionSite] {
        &self.sites
    }

    /// The site whose decryptor is `method`.
    #[must_use]
    pub fn site_for(&self, method: Token) -> Option<&DecryptionSite> {
        self.by_method
            .get(&method)
            .and_then(|&position| self.sites.get(position))
    }

    /// The decrypted constants buffer.
    #[must_use]
    pub fn blob(&self) -> &DecryptedBlob {
        &self.blob
    }

    /// What the protection added to the module.
    #[must_use]
    pub fn artifacts(&self) -> &ConstantsArtifacts {
        &self.artifacts
    }

    /// Events of detection and of every decode so far.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Moves the recorded events out of the engine.
    ///
    /// Every decode appends an event, so callers decoding without end should drain the log
    /// periodically.
    pub fn take_events(&mut self) -> EventLog {
        self.events.take()
    }

    /// Number of distinct strings decoded so far.
    #[must_use]
    pub fn interned_strings(&self) -> usize {
        self.strings.len()
    }

    /// Decodes the string `site` returns for `index`.
    ///
    /// Equal strings come back as the same allocation.
    ///
    /// # Errors
    /// Returns the decode failure, which is also logged with the site and index.
    pub fn decrypt_string(&self, site: &DecryptionSite, index: u32) -> Result<Arc<str>> {
        let value = self.logged(site, index, |emulator| {
            site.decrypt_string(emulator, index)
                .map(|value| self.strings.intern(value))
        })?;
        self.events
            .record(EventKind::StringDecrypted)
            .method(site.method())
            .index(index)
            .message(format!("{value:?}"));
        Ok(value)
    }

    /// Decodes the scalar `site` returns for `index`.
    ///
    /// # Errors
    /// Returns the decode failure, which is also logged with the site and index.
    pub fn decrypt_scalar<T: Scalar + fmt::Debug>(
        &self,
        site: &DecryptionSite,
        index: u32,
    ) -> Result<T> {
        let value = self.logged(site, index, |emulator| {
            site.decrypt_scalar::<T>(emulator, index)
        })?;
        self.events
            .record(EventKind::ConstantDecrypted)
            .method(site.method())
            .index(index)
            .message(format!("{value:?}"));
        Ok(value)
    }

    /// Decodes the array bytes `site` returns for `index`.
    ///
    /// # Errors
    /// Returns the decode failure, which is also logged with the site and index.
    pub fn decrypt_array(&self, site: &DecryptionSite, index: u32) -> Result<Vec<u8>> {
        let value = self.logged(site, index, |emulator| site.decrypt_array(emulator, index))?;
        self.events
            .record(EventKind::ArrayDecrypted)
            .method(site.method())
            .index(index)
            .message(format!("{} byte(s)", value.len()));
        Ok(value)
    }

    /// Decodes the value `site` returns for `index` when instantiated with `type_arg`.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedTypeArgument`] if `type_arg` is neither a primitive, a string
    /// nor a single-dimensional array, and otherwise the decode failure.
    pub fn decrypt_as(
        &self,
        site: &DecryptionSite,
        type_arg: &TypeSig,
        index: u32,
    ) -> Result<DecryptedValue> {
        let value = match type_arg.remove_pinned_and_modifiers().element_type() {
            ElementType::String => DecryptedValue::String(self.decrypt_string(site, index)?),
            ElementType::I1 => DecryptedValue::I1(self.decrypt_scalar(site, index)?),
            ElementType::U1 => DecryptedValue::U1(self.decrypt_scalar(site, index)?),
            ElementType::I2 => DecryptedValue::I2(self.decrypt_scalar(site, index)?),
            ElementType::U2 => DecryptedValue::U2(self.decrypt_scalar(site, index)?),
            ElementType::I4 => DecryptedValue::I4(self.decrypt_scalar(site, index)?),
            ElementType::U4 => DecryptedValue::U4(self.decrypt_scalar(site, index)?),
            ElementType::I8 => DecryptedValue::I8(self.decrypt_scalar(site, index)?),
            ElementType::U8 => DecryptedValue::U8(self.decrypt_scalar(site, index)?),
            ElementType::R4 => DecryptedValue::R4(self.decrypt_scalar(site, index)?),
            ElementType::R8 => DecryptedValue::R8(self.decrypt_scalar(site, index)?),
            ElementType::SzArray => DecryptedValue::Array(self.decrypt_array(site, index)?),
            _ => return Err(Error::UnsupportedTypeArgument(type_arg.full_name())),
        };
        Ok(value)
    }

    /// Decodes the value of a call `call method_spec(index)`.
    ///
    /// `method_spec` has to instantiate the decryptor of `site` with a single type argument.
    /// Returns `Ok(None)` if it does not, or if the type argument is not one the decoders
    /// understand; the call is then not a constants call.
    ///
    /// # Errors
    /// Returns the decode failure for a recognized instantiation.
    pub fn decrypt_call(
        &self,
        module: &Module,
        site: &DecryptionSite,
        method_spec: Token,
        index: u32,
    ) -> Result<Option<DecryptedValue>> {
        let Some(spec) = module.method_spec(method_spec) else {
            return Ok(None);
        };
        let [type_arg] = spec.generic_args.as_slice() else {
            return Ok(None);
        };
        if spec.method != site.method() {
            return Ok(None);
        }

        match self.decrypt_as(site, type_arg, index) {
            Ok(value) => Ok(Some(value)),
            Err(Error::UnsupportedTypeArgument(name)) => {
                self.events
                    .record(EventKind::Info)
                    .method(site.method())
                    .index(index)
                    .message(format!("{method_spec} instantiates {name}, not a constant"));
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn logged<R>(
        &self,
        site: &DecryptionSite,
        index: u32,
        decode: impl FnOnce(&dyn NativeEmulator) -> Result<R>,
    ) -> Result<R> {
        decode(self.emulator.as_ref()).map_err(|error| {
            self.events
                .record(EventKind::Error)
                .method(site.method())
                .index(index)
                .message(error.to_string());
            error
        })
    }
}

impl fmt::Debug for ConstantsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantsEngine")
            .field("state", &self.state)
            .field("blob", &self.blob)
            .field("artifacts", &self.artifacts)
            .field("sites", &self.sites)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emulation::FnEmulator,
        metadata::builder::ModuleBuilder,
        test::{ConfuserExModuleBuilder, NativeMode},
    };

    #[test]
    fn test_detect_and_decode() {
        let fixture = ConfuserExModuleBuilder::new()
            .string(0, "Hello")
            .string(1, "Wörld ✓")
            .int32(2, -559_038_737)
            .int64(3, i64::MIN)
            .double(4, 2.5)
            .array(5, &[1, 2, 3, 4, 5])
            .arithmetic(0x0BAD_F00D, 0x1337_C0DE)
            .native_mode(NativeMode::None)
            .build();

        let engine = ConstantsEngine::detect(&fixture.module).unwrap();
        assert_eq!(engine.state(), EngineState::SitesClassified);
        assert_eq!(engine.blob().as_bytes(), fixture.plain_blob.as_slice());

        let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();
        assert_eq!(&*engine.decrypt_string(site, fixture.index_of(0)).unwrap(), "Hello");
        assert_eq!(&*engine.decrypt_string(site, fixture.index_of(1)).unwrap(), "Wörld ✓");
        assert_eq!(
            engine.decrypt_scalar::<i32>(site, fixture.index_of(2)).unwrap(),
            -559_038_737
        );
        assert_eq!(
            engine.decrypt_scalar::<i64>(site, fixture.index_of(3)).unwrap(),
            i64::MIN
        );
        assert_eq!(engine.decrypt_scalar::<f64>(site, fixture.index_of(4)).unwrap(), 2.5);
        assert_eq!(
            engine.decrypt_array(site, fixture.index_of(5)).unwrap(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(engine.events().has(EventKind::DetectionComplete));
    }

    #[test]
    fn test_artifacts() {
        let fixture = ConfuserExModuleBuilder::new().string(0, "x").build();
        let engine = ConstantsEngine::detect(&fixture.module).unwrap();
        let artifacts = engine.artifacts();

        assert_eq!(artifacts.initializer, fixture.initializer);
        assert_eq!(artifacts.array_field, fixture.array_field);
        assert_eq!(artifacts.decrypted_field, fixture.decrypted_field);
        assert_eq!(artifacts.array_type, Some(fixture.array_type));
        assert_eq!(artifacts.decompressor, fixture.decompressor);
        assert_eq!(artifacts.helper_types, fixture.helper_types);
    }

    #[test]
    fn test_initializer_outside_module_type() {
        let fixture = ConfuserExModuleBuilder::new()
            .string(0, "elsewhere")
            .int32(1, 42)
            .initializer_in("ConstantsInit")
            .build();
        let global = fixture.module.global_type().unwrap().token;
        let initializer = fixture.module.method(fixture.initializer).unwrap();
        assert_ne!(initializer.declaring_type, global);

        let engine = ConstantsEngine::detect(&fixture.module).unwrap();
        assert_eq!(engine.artifacts().initializer, fixture.initializer);

        let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();
        assert_eq!(
            &*engine.decrypt_string(site, fixture.index_of(0)).unwrap(),
            "elsewhere"
        );
        assert_eq!(engine.decrypt_scalar::<i32>(site, fixture.index_of(1)).unwrap(), 42);
        assert!(fixture
            .native_decryptor
            .is_some_and(|native| engine.site_for(native).is_some()));
    }

    #[test]
    fn test_take_events_drains_decode_history() {
        let fixture = ConfuserExModuleBuilder::new()
            .string(0, "drained")
            .native_mode(NativeMode::None)
            .build();
        let mut engine = ConstantsEngine::detect(&fixture.module).unwrap();
        let index = fixture.index_of(0);

        for _ in 0..3 {
            let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();
            engine.decrypt_string(site, index).unwrap();
        }
        let history = engine.take_events();
        assert!(history.has(EventKind::DetectionComplete));
        assert_eq!(history.count_kind(EventKind::StringDecrypted), 3);
        assert!(engine.events().is_empty());

        let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();
        assert_eq!(&*engine.decrypt_string(site, index).unwrap(), "drained");
        assert_eq!(engine.events().len(), 1);
        assert_eq!(engine.interned_strings(), 1);
    }

    #[test]
    fn test_strings_are_interned() {
        let fixture = ConfuserExModuleBuilder::new()
            .string(0, "same")
            .string(1, "same")
            .build();
        let engine = ConstantsEngine::detect(&fixture.module).unwrap();
        let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();

        let first = engine.decrypt_string(site, fixture.index_of(0)).unwrap();
        let second = engine.decrypt_string(site, fixture.index_of(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.interned_strings(), 1);
    }

    #[test]
    fn test_detection_leaves_module_untouched() {
        let fixture = ConfuserExModuleBuilder::new()
            .string(0, "pure")
            .with_nops()
            .build();
        let shape = |module: &Module| -> Vec<usize> {
            module.methods().map(|method| method.instruction_count()).collect()
        };
        let before = shape(&fixture.module);

        let first = ConstantsEngine::detect_default(&fixture.module).unwrap();
        let second = ConstantsEngine::detect_default(&fixture.module).unwrap();

        assert_eq!(shape(&fixture.module), before);
        assert_eq!(first.blob().as_bytes(), second.blob().as_bytes());
        assert_eq!(first.sites().len(), second.sites().len());
    }

    #[test]
    fn test_unprotected_module_is_undetected() {
        let module = ModuleBuilder::new("Plain.dll").build();
        let events = EventLog::new();
        let config = ConstantsConfig::default();

        let error =
            ConstantsEngine::detect_with(&module, config.clone(), Collaborators::new(&config), &events)
                .unwrap_err();

        assert!(matches!(error, Error::Undetected(_)));
        assert!(error.is_detection_failure());
        assert_eq!(events.warnings().count(), 1);
        assert!(ConstantsEngine::detect(&module).is_none());
    }

    #[test]
    fn test_native_sites_need_an_emulator() {
        let fixture = ConfuserExModuleBuilder::new()
            .string(0, "native")
            .native_mode(NativeMode::Xor(0x0055_AA00))
            .build();
        let native = fixture.native_decryptor.unwrap();
        let index = fixture.native_index_of(0);

        let default = ConstantsEngine::detect(&fixture.module).unwrap();
        let site = default.site_for(native).unwrap();
        assert!(matches!(
            default.decrypt_string(site, index),
            Err(Error::UnresolvedNativeKey { .. })
        ));
        assert_eq!(default.events().filter_method(native).filter(|e| e.kind == EventKind::Error).count(), 1);

        let config = ConstantsConfig::default();
        let collaborators = Collaborators::new(&config).with_emulator(Arc::new(FnEmulator::new(
            |_: &crate::emulation::NativeRoutine, input: i32| Some(input ^ 0x0055_AA00),
        )));
        let emulated =
            ConstantsEngine::detect_with(&fixture.module, config, collaborators, &EventLog::new())
                .unwrap();
        let site = emulated.site_for(native).unwrap();
        assert_eq!(&*emulated.decrypt_string(site, index).unwrap(), "native");
    }

    #[test]
    fn test_decrypt_call_dispatch() {
        let fixture = ConfuserExModuleBuilder::new()
            .string(0, "dispatched")
            .int16(1, -2)
            .build();
        let engine = ConstantsEngine::detect(&fixture.module).unwrap();
        let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();
        let spec = |sig: TypeSig| fixture.instantiate(sig);

        assert_eq!(
            engine
                .decrypt_call(&fixture.module, site, spec(TypeSig::String), fixture.index_of(0))
                .unwrap(),
            Some(DecryptedValue::String(Arc::from("dispatched")))
        );
        assert_eq!(
            engine
                .decrypt_call(&fixture.module, site, spec(TypeSig::I2), fixture.index_of(1))
                .unwrap(),
            Some(DecryptedValue::I2(-2))
        );
        assert_eq!(
            engine
                .decrypt_call(&fixture.module, site, spec(TypeSig::Object), fixture.index_of(0))
                .unwrap(),
            None
        );
        assert_eq!(
            engine
                .decrypt_call(&fixture.module, site, Token::new(0x2B00_0FFF), 0)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_decode_failure_is_logged() {
        let fixture = ConfuserExModuleBuilder::new().string(0, "short").build();
        let engine = ConstantsEngine::detect(&fixture.module).unwrap();
        let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();
        let far = fixture.index_for_offset(0x0100_0000);

        assert!(matches!(
            engine.decrypt_array(site, far),
            Err(Error::OffsetOutOfRange { .. })
        ));
        let logged: Vec<_> = engine.events().filter_kind(EventKind::Error).collect();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].method, Some(site.method()));
        assert_eq!(logged[0].index, Some(far));
    }

    #[test]
    fn test_detect_all_keeps_order() {
        let protected = ConfuserExModuleBuilder::new().string(0, "a").build().module;
        let plain = ModuleBuilder::new("Plain.dll").build();
        let config = ConstantsConfig::default();

        let results = ConstantsEngine::detect_all(
            &[protected.clone(), plain, protected],
            &config,
            &Collaborators::new(&config),
        );

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_collaborators_are_replaceable() {
        struct Corrupt;

        impl Decompressor for Corrupt {
            fn decompress(&self, _data: &[u8]) -> Result<Vec<u8>> {
                Err(Error::Decompression("corrupt stream".to_string()))
            }
        }

        let fixture = ConfuserExModuleBuilder::new().string(0, "swap").build();
        let config = ConstantsConfig::default();

        let explicit = Collaborators::new(&config)
            .with_simplifier(Arc::new(NopStripper))
            .with_executor(Arc::new(CilInterpreter::new(config.execution.clone())))
            .with_decompressor(Arc::new(LzmaDecompressor));
        let engine =
            ConstantsEngine::detect_with(&fixture.module, config.clone(), explicit, &EventLog::new())
                .unwrap();
        let site = engine.site_for(fixture.arithmetic_decryptor).unwrap();
        assert_eq!(&*engine.decrypt_string(site, fixture.index_of(0)).unwrap(), "swap");

        let broken = Collaborators::new(&config).with_decompressor(Arc::new(Corrupt));
        let error =
            ConstantsEngine::detect_with(&fixture.module, config, broken, &EventLog::new())
                .unwrap_err();
        assert!(error.is_detection_failure());
    }

    #[test]
    fn test_engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConstantsEngine>();
    }
}
