//! Resource instances and typed resource values

use crate::base::{Base, BaseType, Mode, Operation, check_allowed};
use crate::coap_types::{CoapHeader, ContentFormat, Method, ResponseCode};
use crate::error::Result;
use crate::json;
use crate::path::Lwm2mPath;
use crate::tlv;

/// Data type of a resource value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceType {
    String,
    Integer,
    Float,
    Boolean,
    #[default]
    Opaque,
    Time,
    Objlink,
}

impl ResourceType {
    /// Check if values of this type take part in gt/lt/st checks
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float | Self::Time)
    }
}

/// Owned value buffer of a leaf node
///
/// Numbers and booleans are kept as their ASCII text, opaque values as raw bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceValue {
    kind: ResourceType,
    bytes: Vec<u8>,
}

impl ResourceValue {
    pub fn new(kind: ResourceType) -> Self {
        Self {
            kind,
            bytes: Vec::new(),
        }
    }

    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Replace the value, returning whether it changed
    pub fn set(&mut self, value: &[u8]) -> bool {
        if self.bytes == value {
            return false;
        }
        self.bytes = value.to_vec();
        true
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn as_i64(&self) -> Option<i64> {
        std::str::from_utf8(&self.bytes).ok()?.trim().parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        std::str::from_utf8(&self.bytes).ok()?.trim().parse().ok()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.bytes.as_slice() {
            b"1" | b"true" => Some(true),
            b"0" | b"false" => Some(false),
            _ => None,
        }
    }

    /// Reading used for threshold checks, `None` for non-numeric types
    pub fn numeric(&self) -> Option<f64> {
        if self.kind.is_numeric() {
            self.as_f64()
        } else {
            None
        }
    }
}

/// A single value of a multiple-instance resource
#[derive(Debug)]
pub struct ResourceInstance {
    base: Base,
    value: ResourceValue,
    object_name: String,
    object_instance_id: u16,
}

impl ResourceInstance {
    /// Create an instance of the resource `name`; its TLV identifier is `instance_id`
    pub(crate) fn new(
        name: &str,
        instance_id: u16,
        kind: ResourceType,
        mode: Mode,
        object_name: &str,
        object_instance_id: u16,
    ) -> Self {
        let mut base = Base::new(name, BaseType::ResourceInstance, mode);
        base.set_instance_id(instance_id);
        base.set_name_id(Some(instance_id));
        base.set_operation(Operation::GET_ALLOWED);
        Self {
            base,
            value: ResourceValue::new(kind),
            object_name: object_name.to_string(),
            object_instance_id,
        }
    }

    pub fn base(&self) -> &Base {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    pub fn instance_id(&self) -> u16 {
        self.base.instance_id()
    }

    pub fn resource_instance_type(&self) -> ResourceType {
        self.value.kind()
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn object_instance_id(&self) -> u16 {
        self.object_instance_id
    }

    pub fn path(&self) -> Lwm2mPath {
        Lwm2mPath::object(&self.object_name)
            .instance(self.object_instance_id)
            .resource(self.base.name())
            .resource_instance(self.instance_id())
    }

    pub fn value(&self) -> &[u8] {
        self.value.as_bytes()
    }

    pub fn resource_value(&self) -> &ResourceValue {
        &self.value
    }

    /// Replace the value, returning whether it changed
    pub fn set_value(&mut self, value: &[u8]) -> bool {
        self.value.set(value)
    }

    pub fn set_value_int(&mut self, value: i64) -> bool {
        self.value.set(value.to_string().as_bytes())
    }

    pub fn value_int(&self) -> Option<i64> {
        self.value.as_i64()
    }

    pub fn value_string(&self) -> String {
        self.value.as_string()
    }

    pub fn clear_value(&mut self) {
        self.value.clear();
    }

    /// Encode this instance in `format`
    pub fn encode(&self, format: ContentFormat) -> Result<Vec<u8>> {
        match format {
            ContentFormat::OmaTlv => tlv::serialize_resource_instance(self),
            ContentFormat::OmaJson => json::serialize_resource_instance(self),
            _ => Ok(self.value().to_vec()),
        }
    }

    pub fn handle_get_request(&mut self, request: &CoapHeader) -> CoapHeader {
        if let Err(response) = check_allowed(&self.base, request, Method::Get) {
            return response;
        }
        let format = ContentFormat::negotiate_leaf(request);
        let payload = match self.encode(format) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Failed to encode {}: {}", self.path(), e);
                return CoapHeader::response_to(request, ResponseCode::NotAcceptable);
            }
        };
        let mut response = self
            .base
            .response(request, ResponseCode::Content)
            .with_payload(payload, format);
        let numeric = self.value.numeric();
        if let Err(code) = self
            .base
            .handle_observation(request, &mut response, format, numeric)
        {
            return CoapHeader::response_to(request, code);
        }
        response
    }

    pub fn handle_put_request(&mut self, request: &CoapHeader) -> (CoapHeader, bool) {
        if let Err(response) = check_allowed(&self.base, request, Method::Put) {
            return (response, false);
        }
        if request.uri_query.is_some() && request.payload.is_empty() {
            let code = self.base.write_attributes(request);
            return (CoapHeader::response_to(request, code), false);
        }
        let result = match request.content_format.and_then(ContentFormat::from_u16) {
            Some(ContentFormat::OmaTlv) => {
                tlv::deserialize_single_value(&request.payload, Some(self.instance_id()))
            }
            Some(ContentFormat::OmaJson) => {
                json::deserialize_single_value(&request.payload, self.value.kind())
            }
            _ => Ok(request.payload.clone()),
        }
        .map(|value| {
            self.set_value(&value);
        });
        match result {
            Ok(()) => (CoapHeader::response_to(request, ResponseCode::Changed), true),
            Err(e) => (CoapHeader::response_to(request, e.response_code()), false),
        }
    }

    /// Resource instances have nothing to execute; an allowed POST is acknowledged
    pub fn handle_post_request(&mut self, request: &CoapHeader) -> (CoapHeader, bool) {
        if let Err(response) = check_allowed(&self.base, request, Method::Post) {
            return (response, false);
        }
        (CoapHeader::response_to(request, ResponseCode::Changed), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ResourceInstance {
        let mut ri = ResourceInstance::new("7", 1, ResourceType::Integer, Mode::Dynamic, "3", 0);
        ri.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
        ri.set_value_int(3800);
        ri
    }

    #[test]
    fn test_resource_value_conversions() {
        let mut value = ResourceValue::new(ResourceType::Integer);
        assert!(value.set(b"42"));
        assert!(!value.set(b"42"));
        assert_eq!(value.as_i64(), Some(42));
        assert_eq!(value.numeric(), Some(42.0));

        let mut flag = ResourceValue::new(ResourceType::Boolean);
        flag.set(b"1");
        assert_eq!(flag.as_bool(), Some(true));
        assert_eq!(flag.numeric(), None);
    }

    #[test]
    fn test_path_and_identity() {
        let ri = instance();
        assert_eq!(ri.path().to_string(), "3/0/7/1");
        assert_eq!(ri.base().name_id(), Some(1));
        assert_eq!(ri.base().base_type(), BaseType::ResourceInstance);
    }

    #[test]
    fn test_get_plain_text() {
        let mut ri = instance();
        let request = CoapHeader::request(Method::Get, "3/0/7/1").with_accept(ContentFormat::TextPlain);
        let response = ri.handle_get_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::Content));
        assert_eq!(response.payload, b"3800");
        assert_eq!(response.content_format, Some(0));
    }

    #[test]
    fn test_get_defaults_to_tlv() {
        let mut ri = instance();
        let request = CoapHeader::request(Method::Get, "3/0/7/1");
        let response = ri.handle_get_request(&request);
        assert_eq!(response.content_format, Some(99));
        assert!(tlv::is_resource_instance(&response.payload));
    }

    #[test]
    fn test_put_raw_value() {
        let mut ri = instance();
        let mut request = CoapHeader::request(Method::Put, "3/0/7/1");
        request.payload = b"5000".to_vec();
        let (response, updated) = ri.handle_put_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::Changed));
        assert!(updated);
        assert_eq!(ri.value_int(), Some(5000));
    }

    #[test]
    fn test_post_not_allowed() {
        let mut ri = instance();
        let request = CoapHeader::request(Method::Post, "3/0/7/1");
        let (response, updated) = ri.handle_post_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::MethodNotAllowed));
        assert!(!updated);
    }
}
