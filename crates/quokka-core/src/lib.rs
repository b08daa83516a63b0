//! Core data model and codecs for QuokkaDB.
//!
//! This crate is the single source of truth for document type identity.
//! It provides:
//!
//! - the typed value model ([`types::Value`], [`types::Document`],
//!   [`types::Array`], [`types::ObjectId`], [`types::Regex`]),
//! - the BSON binary codec ([`bson`]) used on the wire,
//! - the tagged extended-JSON codec ([`fjson`]) used for persistence in the
//!   backing store,
//! - the error taxonomy ([`error`]) including MongoDB-compatible command
//!   error codes.
//!
//! The type set is closed: codecs never produce a value outside it, and
//! unknown BSON types are rejected during decoding.

pub mod bson;
pub mod error;
pub mod fjson;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use types::{Array, Document, ObjectId, Regex, Value};
