//! OMA-TLV codec (content format 99)
//!
//! Each record starts with a type byte:
//!
//! ```text
//!  7 6   5   4 3   2 1 0
//! +---+-----+-----+-----+
//! |kind|id16| len | len3|
//! +---+-----+-----+-----+
//! ```
//!
//! `kind` is 00 object instance, 01 resource instance, 10 multiple resource
//! and 11 resource. `id16` selects a 16-bit identifier. `len` gives the width
//! of the length field (0 to 3 bytes); with width 0 the length sits in `len3`.
//! Identifier and length are big-endian. Values are the stored bytes as is.

use crate::base::WriteMode;
use crate::coap_types::Method;
use crate::error::{DecodeError, Lwm2mError, Result};
use crate::object::Object;
use crate::object_instance::ObjectInstance;
use crate::resource::Resource;
use crate::resource_instance::ResourceInstance;

const KIND_MASK: u8 = 0xC0;
const ID_16BIT: u8 = 0x20;
const LENGTH_WIDTH_MASK: u8 = 0x18;
const LENGTH_INLINE_MASK: u8 = 0x07;
const MAX_VALUE_LEN: usize = 0xFF_FFFF;

/// Record kind, the two top bits of the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    ObjectInstance,
    ResourceInstance,
    MultipleResource,
    Resource,
}

impl TlvType {
    fn bits(self) -> u8 {
        match self {
            Self::ObjectInstance => 0x00,
            Self::ResourceInstance => 0x40,
            Self::MultipleResource => 0x80,
            Self::Resource => 0xC0,
        }
    }

    fn from_type_byte(byte: u8) -> Self {
        match byte & KIND_MASK {
            0x00 => Self::ObjectInstance,
            0x40 => Self::ResourceInstance,
            0x80 => Self::MultipleResource,
            _ => Self::Resource,
        }
    }
}

/// One decoded record; `value` borrows from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub kind: TlvType,
    pub id: u16,
    pub value: &'a [u8],
}

impl<'a> TlvRecord<'a> {
    /// Nested records of an object instance or multiple resource
    pub fn children(&self) -> std::result::Result<Vec<TlvRecord<'a>>, DecodeError> {
        match self.kind {
            TlvType::ObjectInstance | TlvType::MultipleResource => decode(self.value),
            _ => Err(DecodeError::NotValid),
        }
    }
}

/// Append one record to `out`
pub fn encode_record(out: &mut Vec<u8>, kind: TlvType, id: u16, value: &[u8]) -> Result<()> {
    let len = value.len();
    if len > MAX_VALUE_LEN {
        return Err(Lwm2mError::InvalidValue(format!(
            "TLV value of {} bytes exceeds 24-bit length",
            len
        )));
    }

    let mut type_byte = kind.bits();
    if id > 0xFF {
        type_byte |= ID_16BIT;
    }
    let length_width = match len {
        0..=7 => {
            type_byte |= len as u8;
            0
        }
        8..=0xFF => 1,
        0x100..=0xFFFF => 2,
        _ => 3,
    };
    type_byte |= (length_width as u8) << 3;

    out.push(type_byte);
    if id > 0xFF {
        out.extend_from_slice(&id.to_be_bytes());
    } else {
        out.push(id as u8);
    }
    let len_bytes = (len as u32).to_be_bytes();
    out.extend_from_slice(&len_bytes[4 - length_width..]);
    out.extend_from_slice(value);
    Ok(())
}

/// Decode consecutive records
///
/// Fails with `NotValid` when a header or value is truncated.
pub fn decode(data: &[u8]) -> std::result::Result<Vec<TlvRecord<'_>>, DecodeError> {
    let mut records = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (record, consumed) = decode_one(rest)?;
        records.push(record);
        rest = &rest[consumed..];
    }
    Ok(records)
}

fn decode_one(data: &[u8]) -> std::result::Result<(TlvRecord<'_>, usize), DecodeError> {
    let type_byte = *data.first().ok_or(DecodeError::NotValid)?;
    let mut pos = 1;

    let id_width = if type_byte & ID_16BIT != 0 { 2 } else { 1 };
    let id_bytes = data.get(pos..pos + id_width).ok_or(DecodeError::NotValid)?;
    let id = id_bytes
        .iter()
        .fold(0u16, |acc, b| (acc << 8) | u16::from(*b));
    pos += id_width;

    let length_width = usize::from((type_byte & LENGTH_WIDTH_MASK) >> 3);
    let len = if length_width == 0 {
        usize::from(type_byte & LENGTH_INLINE_MASK)
    } else {
        let len_bytes = data
            .get(pos..pos + length_width)
            .ok_or(DecodeError::NotValid)?;
        pos += length_width;
        len_bytes
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
    };

    let value = data.get(pos..pos + len).ok_or(DecodeError::NotValid)?;
    let record = TlvRecord {
        kind: TlvType::from_type_byte(type_byte),
        id,
        value,
    };
    Ok((record, pos + len))
}

fn first_kind(data: &[u8]) -> Option<TlvType> {
    data.first().map(|b| TlvType::from_type_byte(*b))
}

pub fn is_object_instance(data: &[u8]) -> bool {
    first_kind(data) == Some(TlvType::ObjectInstance)
}

pub fn is_resource_instance(data: &[u8]) -> bool {
    first_kind(data) == Some(TlvType::ResourceInstance)
}

pub fn is_multiple_resource(data: &[u8]) -> bool {
    first_kind(data) == Some(TlvType::MultipleResource)
}

pub fn is_resource(data: &[u8]) -> bool {
    first_kind(data) == Some(TlvType::Resource)
}

/// Identifier of the first record
pub fn instance_id(data: &[u8]) -> Option<u16> {
    decode_one(data).ok().map(|(record, _)| record.id)
}

pub fn serialize_resource_instance(instance: &ResourceInstance) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_resource_instance(&mut out, instance)?;
    Ok(out)
}

fn encode_resource_instance(out: &mut Vec<u8>, instance: &ResourceInstance) -> Result<()> {
    let id = instance
        .base()
        .name_id()
        .ok_or_else(|| Lwm2mError::MissingNameId(instance.path().to_string()))?;
    encode_record(out, TlvType::ResourceInstance, id, instance.value())
}

/// Encode a resource, nesting its instances when it has multiple
pub fn serialize_resource(resource: &Resource) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_resource(&mut out, resource)?;
    Ok(out)
}

fn encode_resource(out: &mut Vec<u8>, resource: &Resource) -> Result<()> {
    let id = resource
        .base()
        .name_id()
        .ok_or_else(|| Lwm2mError::MissingNameId(resource.path().to_string()))?;
    if resource.supports_multiple_instances() {
        let mut nested = Vec::new();
        for instance in resource.resource_instances() {
            encode_resource_instance(&mut nested, instance)?;
        }
        encode_record(out, TlvType::MultipleResource, id, &nested)
    } else {
        encode_record(out, TlvType::Resource, id, resource.value())
    }
}

/// Encode the readable resources of an object instance
pub fn serialize_resources(resources: &[Resource]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for resource in resources {
        if resource.base().operation().allows(Method::Get) {
            encode_resource(&mut out, resource)?;
        }
    }
    Ok(out)
}

/// Encode object instances, each wrapping its resources
pub fn serialize_object_instances<'a>(
    instances: impl IntoIterator<Item = &'a ObjectInstance>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for instance in instances {
        let nested = serialize_resources(instance.resources())?;
        encode_record(&mut out, TlvType::ObjectInstance, instance.instance_id(), &nested)?;
    }
    Ok(out)
}

/// Value of a payload holding exactly one resource or resource instance
///
/// When `expected_id` is set the record must carry that identifier.
pub fn deserialize_single_value(
    data: &[u8],
    expected_id: Option<u16>,
) -> std::result::Result<Vec<u8>, DecodeError> {
    let records = decode(data)?;
    let [record] = records.as_slice() else {
        return Err(DecodeError::NotValid);
    };
    match record.kind {
        TlvType::Resource | TlvType::ResourceInstance => {}
        _ => return Err(DecodeError::NotValid),
    }
    if expected_id.is_some_and(|id| id != record.id) {
        return Err(DecodeError::NotFound);
    }
    Ok(record.value.to_vec())
}

/// Write resource instance records into a multiple-instance resource
///
/// The records may be wrapped in the resource's own multiple-resource record.
pub fn deserialize_resource_instances(
    data: &[u8],
    resource: &mut Resource,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    let records = decode(data)?;
    if let [wrapper] = records.as_slice()
        && wrapper.kind == TlvType::MultipleResource
    {
        if !resource.matches_id(wrapper.id) {
            return Err(DecodeError::NotFound);
        }
        return write_resource_instances(&wrapper.children()?, resource, mode);
    }
    write_resource_instances(&records, resource, mode)
}

fn write_resource_instances(
    records: &[TlvRecord<'_>],
    resource: &mut Resource,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    for record in records {
        if record.kind != TlvType::ResourceInstance {
            return Err(DecodeError::NotValid);
        }
        resource
            .instance_for_write(record.id, mode)?
            .set_value(record.value);
    }
    Ok(())
}

/// Write resource records into an object instance
///
/// A payload wrapped in this instance's own object-instance record is unwrapped.
pub fn deserialize_resources(
    data: &[u8],
    instance: &mut ObjectInstance,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    let records = decode(data)?;
    if let [wrapper] = records.as_slice()
        && wrapper.kind == TlvType::ObjectInstance
    {
        if wrapper.id != instance.instance_id() {
            return Err(DecodeError::NotFound);
        }
        return write_resources(&wrapper.children()?, instance, mode);
    }
    write_resources(&records, instance, mode)
}

fn write_resources(
    records: &[TlvRecord<'_>],
    instance: &mut ObjectInstance,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    for record in records {
        match record.kind {
            TlvType::Resource => {
                instance
                    .resource_for_write(record.id, false, mode)?
                    .set_value(record.value);
            }
            TlvType::MultipleResource => {
                let resource = instance.resource_for_write(record.id, true, mode)?;
                write_resource_instances(&record.children()?, resource, mode)?;
            }
            TlvType::ObjectInstance | TlvType::ResourceInstance => {
                return Err(DecodeError::NotValid);
            }
        }
    }
    Ok(())
}

/// Write object-instance records into an object
pub fn deserialize_object_instances(
    data: &[u8],
    object: &mut Object,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    for record in decode(data)? {
        if record.kind != TlvType::ObjectInstance {
            return Err(DecodeError::NotValid);
        }
        let instance = object.instance_for_write(record.id, mode)?;
        write_resources(&record.children()?, instance, mode)?;
    }
    Ok(())
}
