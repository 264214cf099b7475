use std::{any, fmt};

use serde::de::DeserializeOwned;
use serde::ser::{Impossible, SerializeStruct, Serializer};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::ShstateError;

/// Size in bytes of a payload digest.
pub const DIGEST_SIZE: usize = 32;

/// SHA-256 digest of an encoded payload, used to suppress publishes when the
/// record has not changed since the last one.
pub type PayloadDigest = [u8; DIGEST_SIZE];

/// Encodes a record as self-describing MessagePack.
///
/// Field names are written out, so unrelated fields in peers built against
/// different revisions of the record do not silently misalign. Encoding an
/// unchanged value yields the same bytes, which is what change detection
/// relies on.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ShstateError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decodes exactly one record from the head of `bytes`.
///
/// The region hands us its whole payload area, so the slice usually ends in
/// zero padding or the tail of a previous, larger payload. MessagePack is
/// self-delimiting; everything after the first value is ignored.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ShstateError> {
    let mut deserializer = rmp_serde::Deserializer::new(bytes);
    Ok(T::deserialize(&mut deserializer)?)
}

/// Digest of an encoded payload.
pub fn digest(bytes: &[u8]) -> PayloadDigest {
    Sha256::digest(bytes).into()
}

/// Checks that `value` is record-shaped: a named-field struct, not a
/// scalar, sequence, map or other container. Called once at engine
/// construction; the probe never touches field values, so the check is
/// O(field count).
pub fn ensure_record<T: Serialize>(value: &T) -> Result<(), ShstateError> {
    value
        .serialize(RecordProbe)
        .map_err(|_| ShstateError::InvalidType(any::type_name::<T>().to_string()))
}

/// Probe serializer: only `serialize_struct` succeeds.
struct RecordProbe;

#[derive(Debug)]
struct NotARecord;

impl fmt::Display for NotARecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("value is not a named-field struct")
    }
}

impl std::error::Error for NotARecord {}

impl serde::ser::Error for NotARecord {
    fn custom<M: fmt::Display>(_msg: M) -> Self {
        NotARecord
    }
}

struct RecordFields;

impl SerializeStruct for RecordFields {
    type Ok = ();
    type Error = NotARecord;

    fn serialize_field<T>(&mut self, _key: &'static str, _value: &T) -> Result<(), NotARecord>
    where
        T: ?Sized + Serialize,
    {
        Ok(())
    }

    fn end(self) -> Result<(), NotARecord> {
        Ok(())
    }
}

impl Serializer for RecordProbe {
    type Ok = ();
    type Error = NotARecord;
    type SerializeSeq = Impossible<(), NotARecord>;
    type SerializeTuple = Impossible<(), NotARecord>;
    type SerializeTupleStruct = Impossible<(), NotARecord>;
    type SerializeTupleVariant = Impossible<(), NotARecord>;
    type SerializeMap = Impossible<(), NotARecord>;
    type SerializeStruct = RecordFields;
    type SerializeStructVariant = Impossible<(), NotARecord>;

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, NotARecord> {
        Ok(RecordFields)
    }

    fn serialize_bool(self, _: bool) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_i8(self, _: i8) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_i16(self, _: i16) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_i32(self, _: i32) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_i64(self, _: i64) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_u8(self, _: u8) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_u16(self, _: u16) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_u32(self, _: u32) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_u64(self, _: u64) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_f32(self, _: f32) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_f64(self, _: f64) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_char(self, _: char) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_str(self, _: &str) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_none(self) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_some<T>(self, _value: &T) -> Result<(), NotARecord>
    where
        T: ?Sized + Serialize,
    {
        Err(NotARecord)
    }

    fn serialize_unit(self) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), NotARecord> {
        Err(NotARecord)
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, _value: &T) -> Result<(), NotARecord>
    where
        T: ?Sized + Serialize,
    {
        Err(NotARecord)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), NotARecord>
    where
        T: ?Sized + Serialize,
    {
        Err(NotARecord)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, NotARecord> {
        Err(NotARecord)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, NotARecord> {
        Err(NotARecord)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, NotARecord> {
        Err(NotARecord)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, NotARecord> {
        Err(NotARecord)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, NotARecord> {
        Err(NotARecord)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, NotARecord> {
        Err(NotARecord)
    }
}
