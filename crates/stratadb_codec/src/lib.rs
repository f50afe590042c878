//! # StrataDB Codec
//!
//! The serializer collaborator for StrataDB.
//!
//! This crate provides:
//! - [`Value`], a dynamic object graph (null, bool, integer, float, text,
//!   bytes, array, map)
//! - [`ObjectSerializer`] / [`ObjectDeserializer`] strategy traits, pluggable
//!   per database instance for objects and metadata independently
//! - Three codecs: [`CborCodec`] (the default), [`JsonCodec`] (the
//!   property-list analogue) and [`RawCodec`] (pass-through bytes)
//! - serde transcoding helpers ([`to_value`] / [`from_value`]) so typed Rust
//!   structs can flow through `Value` rows

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod value;

pub use codec::{
    from_value, to_value, CborCodec, JsonCodec, ObjectDeserializer, ObjectSerializer, RawCodec,
};
pub use error::{CodecError, CodecResult};
pub use value::Value;
