//! OMA-JSON codec (content format 100)
//!
//! A payload is a base name plus a list of entries, each naming a node
//! relative to the base and carrying one typed value:
//!
//! ```json
//! {"bn":"/3/0/","e":[{"n":"0","sv":"Acme"},{"n":"7/0","v":3800}]}
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::base::WriteMode;
use crate::coap_types::Method;
use crate::error::{DecodeError, Result};
use crate::object::Object;
use crate::object_instance::ObjectInstance;
use crate::resource::Resource;
use crate::resource_instance::{ResourceInstance, ResourceType, ResourceValue};

#[derive(Debug, Serialize, Deserialize)]
struct JsonPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bn: Option<String>,
    e: Vec<JsonEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    n: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<serde_json::Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bv: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ov: Option<String>,
}

impl JsonEntry {
    fn from_value(n: String, value: &ResourceValue) -> Self {
        let mut entry = Self {
            n,
            ..Self::default()
        };
        match value.kind() {
            ResourceType::Integer | ResourceType::Float | ResourceType::Time => {
                match serde_json::from_str::<serde_json::Number>(value.as_string().trim()) {
                    Ok(number) => entry.v = Some(number),
                    Err(_) => entry.sv = Some(value.as_string()),
                }
            }
            ResourceType::Boolean => match value.as_bool() {
                Some(flag) => entry.bv = Some(flag),
                None => entry.sv = Some(value.as_string()),
            },
            ResourceType::Opaque => entry.sv = Some(BASE64.encode(value.as_bytes())),
            ResourceType::Objlink => entry.ov = Some(value.as_string()),
            ResourceType::String => entry.sv = Some(value.as_string()),
        }
        entry
    }

    /// Stored bytes for this entry's value
    ///
    /// Numbers and booleans become their text, strings for opaque resources are base64.
    fn decode_value(&self, kind: ResourceType) -> std::result::Result<Vec<u8>, DecodeError> {
        if let Some(number) = &self.v {
            return Ok(number.to_string().into_bytes());
        }
        if let Some(flag) = self.bv {
            return Ok(if flag { b"1".to_vec() } else { b"0".to_vec() });
        }
        if let Some(text) = &self.sv {
            return match kind {
                ResourceType::Opaque => BASE64
                    .decode(text.as_bytes())
                    .map_err(|_| DecodeError::NotValid),
                _ => Ok(text.clone().into_bytes()),
            };
        }
        if let Some(link) = &self.ov {
            return Ok(link.clone().into_bytes());
        }
        Err(DecodeError::NotValid)
    }
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}/{}", prefix, segment)
    }
}

fn push_resource(entries: &mut Vec<JsonEntry>, resource: &Resource, prefix: &str) {
    if resource.supports_multiple_instances() {
        for instance in resource.resource_instances() {
            entries.push(JsonEntry::from_value(
                join(prefix, &instance.instance_id().to_string()),
                instance.resource_value(),
            ));
        }
    } else {
        entries.push(JsonEntry::from_value(
            prefix.to_string(),
            resource.resource_value(),
        ));
    }
}

fn push_readable_resources(entries: &mut Vec<JsonEntry>, instance: &ObjectInstance, prefix: &str) {
    for resource in instance.resources() {
        if resource.base().operation().allows(Method::Get) {
            push_resource(entries, resource, &join(prefix, resource.name()));
        }
    }
}

fn to_vec(bn: String, e: Vec<JsonEntry>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&JsonPayload { bn: Some(bn), e })?)
}

fn parse(data: &[u8]) -> std::result::Result<JsonPayload, DecodeError> {
    serde_json::from_slice::<JsonPayload>(data).map_err(|e| {
        log::debug!("Invalid OMA-JSON payload: {}", e);
        DecodeError::NotValid
    })
}

/// Entries with `bn` + `n` resolved to segments below `target`
///
/// Absolute names must lie under the target path; relative names are taken as is.
fn parse_entries(
    data: &[u8],
    target: &str,
) -> std::result::Result<Vec<(Vec<String>, JsonEntry)>, DecodeError> {
    let payload = parse(data)?;
    let base = payload.bn.unwrap_or_default();
    let target: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
    payload
        .e
        .into_iter()
        .map(|entry| {
            let segments = resolve_name(&format!("{}{}", base, entry.n), &target)?;
            Ok((segments, entry))
        })
        .collect()
}

fn resolve_name(name: &str, target: &[&str]) -> std::result::Result<Vec<String>, DecodeError> {
    let mut segments: Vec<String> = name
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if !name.starts_with('/') {
        return Ok(segments);
    }
    if segments.len() < target.len()
        || segments.iter().zip(target).any(|(s, t)| s.as_str() != *t)
    {
        log::debug!("OMA-JSON name {} outside /{}", name, target.join("/"));
        return Err(DecodeError::NotFound);
    }
    Ok(segments.split_off(target.len()))
}

fn parse_id(segment: &str) -> std::result::Result<u16, DecodeError> {
    segment.parse().map_err(|_| DecodeError::NotValid)
}

pub fn serialize_resource_instance(instance: &ResourceInstance) -> Result<Vec<u8>> {
    let entries = vec![JsonEntry::from_value(String::new(), instance.resource_value())];
    to_vec(format!("/{}", instance.path()), entries)
}

pub fn serialize_resource(resource: &Resource) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    push_resource(&mut entries, resource, "");
    let bn = if resource.supports_multiple_instances() {
        format!("/{}/", resource.path())
    } else {
        format!("/{}", resource.path())
    };
    to_vec(bn, entries)
}

pub fn serialize_object_instance(instance: &ObjectInstance) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    push_readable_resources(&mut entries, instance, "");
    to_vec(format!("/{}/", instance.path()), entries)
}

pub fn serialize_object(object: &Object) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    for instance in object.instances() {
        push_readable_resources(&mut entries, instance, &instance.instance_id().to_string());
    }
    to_vec(format!("/{}/", object.name()), entries)
}

/// Value of a payload holding exactly one entry
pub fn deserialize_single_value(
    data: &[u8],
    kind: ResourceType,
) -> std::result::Result<Vec<u8>, DecodeError> {
    match parse(data)?.e.as_slice() {
        [entry] => entry.decode_value(kind),
        _ => Err(DecodeError::NotValid),
    }
}

/// Write entries named by instance id into a multiple-instance resource
pub fn deserialize_resource_instances(
    data: &[u8],
    resource: &mut Resource,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    let kind = resource.resource_instance_type();
    for (segments, entry) in parse_entries(data, &resource.path().to_string())? {
        let id = segments
            .last()
            .ok_or(DecodeError::NotValid)
            .and_then(|s| parse_id(s))?;
        let value = entry.decode_value(kind)?;
        resource.instance_for_write(id, mode)?.set_value(&value);
    }
    Ok(())
}

/// Write entries named "res" or "res/inst" into an object instance
pub fn deserialize_resources(
    data: &[u8],
    instance: &mut ObjectInstance,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    for (segments, entry) in parse_entries(data, &instance.path().to_string())? {
        write_entry(instance, &segments, &entry, mode)?;
    }
    Ok(())
}

/// Write entries named "inst/res" or "inst/res/inst" into an object
pub fn deserialize_object_instances(
    data: &[u8],
    object: &mut Object,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    for (segments, entry) in parse_entries(data, object.name())? {
        let (first, rest) = segments.split_first().ok_or(DecodeError::NotValid)?;
        let instance = object.instance_for_write(parse_id(first)?, mode)?;
        write_entry(instance, rest, &entry, mode)?;
    }
    Ok(())
}

fn write_entry(
    instance: &mut ObjectInstance,
    segments: &[String],
    entry: &JsonEntry,
    mode: WriteMode,
) -> std::result::Result<(), DecodeError> {
    match segments {
        [resource_id] => {
            let resource = instance.resource_for_write(parse_id(resource_id)?, false, mode)?;
            let value = entry.decode_value(resource.resource_instance_type())?;
            resource.set_value(&value);
        }
        [resource_id, instance_id] => {
            let resource = instance.resource_for_write(parse_id(resource_id)?, true, mode)?;
            let value = entry.decode_value(resource.resource_instance_type())?;
            resource
                .instance_for_write(parse_id(instance_id)?, mode)?
                .set_value(&value);
        }
        _ => return Err(DecodeError::NotValid),
    }
    Ok(())
}
