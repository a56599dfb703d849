//! The module model the constants engine operates on.
//!
//! This is a resolved, token-addressed view of the metadata tables: signatures are decoded into
//! [`signatures::TypeSig`] / [`signatures::MethodSig`] trees, method bodies into instruction
//! lists, and field RVA data is attached to its field. Producing a [`module::Module`] from a PE
//! file is the job of the loader in front of this crate; [`builder::ModuleBuilder`] creates
//! modules programmatically.
//!
//! # Key Components
//!
//! - [`module`] - The [`module::Module`] container and name resolution
//! - [`builder`] - Incremental module construction with sequential token allocation
//! - [`method`] - Method definitions, bodies and attribute flags
//! - [`token`] - Metadata table row references used throughout .NET
//! - [`signatures`] - Type and method signatures, with their binary encoding
//! - [`types`], [`field`], [`member`] - The remaining table rows
//!
//! # Examples
//!
//! ```rust
//! use confuserex_constants::metadata::{builder::ModuleBuilder, types::TypeAttributes};
//!
//! let mut builder = ModuleBuilder::new("Sample.dll");
//! let outer = builder.type_def("Demo", "Outer", TypeAttributes::PUBLIC, None);
//! let inner = builder.type_def("", "Inner", TypeAttributes::NESTED_PRIVATE, Some(outer));
//! let module = builder.build();
//!
//! assert_eq!(module.type_full_name(inner).as_deref(), Some("Demo.Outer/Inner"));
//! ```

/// Incremental module construction
pub mod builder;
/// Field definitions
pub mod field;
/// Member references and method specs
pub mod member;
/// Method definitions and bodies
pub mod method;
/// The module container
pub mod module;
/// Implementation of method and type signatures
pub mod signatures;
/// Commonly used metadata token type
pub mod token;
/// Type definitions and references
pub mod types;
