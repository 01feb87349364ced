//! Object instances: ordered containers of resources

use crate::base::{Base, BaseType, Mode, Operation, WriteMode, check_allowed};
use crate::coap_types::{CoapHeader, ContentFormat, Method, ResponseCode};
use crate::error::{DecodeError, Lwm2mError, Result};
use crate::json;
use crate::path::Lwm2mPath;
use crate::resource::Resource;
use crate::resource_instance::{ResourceInstance, ResourceType};
use crate::tlv;

/// An instance of an LWM2M object
#[derive(Debug)]
pub struct ObjectInstance {
    base: Base,
    resources: Vec<Resource>,
}

impl ObjectInstance {
    pub(crate) fn new(object_name: &str, instance_id: u16, operation: Operation) -> Self {
        let mut base = Base::new(object_name, BaseType::ObjectInstance, Mode::Dynamic);
        base.set_instance_id(instance_id);
        base.set_name_id(Some(instance_id));
        base.set_operation(operation);
        Self {
            base,
            resources: Vec::new(),
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

    pub fn object_name(&self) -> &str {
        self.base.name()
    }

    pub fn path(&self) -> Lwm2mPath {
        Lwm2mPath::object(self.base.name()).instance(self.instance_id())
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name() == name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.name() == name)
    }

    /// Create a read-only resource with a fixed value
    pub fn create_static_resource(
        &mut self,
        name: &str,
        resource_type: &str,
        kind: ResourceType,
        value: &[u8],
        multiple: bool,
    ) -> Result<&mut Resource> {
        let resource = self.push_resource(name, resource_type, kind, Mode::Static, multiple)?;
        resource.set_value(value);
        Ok(resource)
    }

    /// Create a resource whose value changes at runtime
    pub fn create_dynamic_resource(
        &mut self,
        name: &str,
        resource_type: &str,
        kind: ResourceType,
        observable: bool,
        multiple: bool,
    ) -> Result<&mut Resource> {
        let resource = self.push_resource(name, resource_type, kind, Mode::Dynamic, multiple)?;
        resource.base_mut().set_observable(observable);
        Ok(resource)
    }

    /// Create a fixed instance of the multiple-instance resource `name`
    pub fn create_static_resource_instance(
        &mut self,
        name: &str,
        resource_type: &str,
        kind: ResourceType,
        value: &[u8],
        instance_id: u16,
    ) -> Result<&mut ResourceInstance> {
        let resource = self.multiple_resource(name, resource_type, kind, Mode::Static)?;
        let instance = resource.add_resource_instance(instance_id, Mode::Static)?;
        instance.set_value(value);
        Ok(instance)
    }

    /// Create a runtime instance of the multiple-instance resource `name`
    pub fn create_dynamic_resource_instance(
        &mut self,
        name: &str,
        resource_type: &str,
        kind: ResourceType,
        observable: bool,
        instance_id: u16,
    ) -> Result<&mut ResourceInstance> {
        let resource = self.multiple_resource(name, resource_type, kind, Mode::Dynamic)?;
        let instance = resource.add_resource_instance(instance_id, Mode::Dynamic)?;
        instance.base_mut().set_observable(observable);
        Ok(instance)
    }

    pub fn remove_resource(&mut self, name: &str) -> bool {
        let before = self.resources.len();
        self.resources.retain(|r| r.name() != name);
        before != self.resources.len()
    }

    pub fn remove_resource_instance(&mut self, name: &str, instance_id: u16) -> bool {
        self.resource_mut(name)
            .is_some_and(|r| r.remove_resource_instance(instance_id))
    }

    fn push_resource(
        &mut self,
        name: &str,
        resource_type: &str,
        kind: ResourceType,
        mode: Mode,
        multiple: bool,
    ) -> Result<&mut Resource> {
        if name.is_empty() {
            return Err(Lwm2mError::InvalidValue("empty resource name".into()));
        }
        if self.resource(name).is_some() {
            return Err(Lwm2mError::AlreadyExists(format!("{}/{}", self.path(), name)));
        }
        let mut resource = Resource::new(
            name,
            kind,
            mode,
            multiple,
            self.base.name(),
            self.instance_id(),
        );
        resource.base_mut().set_resource_type(resource_type);
        self.resources.push(resource);
        let last = self.resources.len() - 1;
        Ok(&mut self.resources[last])
    }

    fn multiple_resource(
        &mut self,
        name: &str,
        resource_type: &str,
        kind: ResourceType,
        mode: Mode,
    ) -> Result<&mut Resource> {
        match self.resources.iter().position(|r| r.name() == name) {
            Some(pos) if self.resources[pos].supports_multiple_instances() => {
                Ok(&mut self.resources[pos])
            }
            Some(_) => Err(Lwm2mError::AlreadyExists(format!(
                "{}/{} is a single-instance resource",
                self.path(),
                name
            ))),
            None => self.push_resource(name, resource_type, kind, mode, true),
        }
    }

    /// Resource a decoded payload writes to
    ///
    /// Existing resources must allow PUT and match the record shape. Missing
    /// ones are created in Post mode when this instance allows POST.
    pub(crate) fn resource_for_write(
        &mut self,
        id: u16,
        multiple: bool,
        mode: WriteMode,
    ) -> std::result::Result<&mut Resource, DecodeError> {
        if let Some(pos) = self.resources.iter().position(|r| r.matches_id(id)) {
            let resource = &mut self.resources[pos];
            if !resource.base().operation().allows(Method::Put) {
                return Err(DecodeError::NotAllowed);
            }
            if resource.supports_multiple_instances() != multiple {
                return Err(DecodeError::NotValid);
            }
            return Ok(resource);
        }
        match mode {
            WriteMode::Put => Err(DecodeError::NotFound),
            WriteMode::Post if !self.base.operation().allows(Method::Post) => {
                Err(DecodeError::NotAllowed)
            }
            WriteMode::Post => {
                let mut resource = Resource::new(
                    &id.to_string(),
                    ResourceType::Opaque,
                    Mode::Dynamic,
                    multiple,
                    self.base.name(),
                    self.instance_id(),
                );
                resource.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
                self.resources.push(resource);
                let last = self.resources.len() - 1;
                Ok(&mut self.resources[last])
            }
        }
    }

    /// Encode this instance's resources in `format`
    pub fn encode(&self, format: ContentFormat) -> Result<Vec<u8>> {
        match format {
            ContentFormat::OmaJson => json::serialize_object_instance(self),
            _ => tlv::serialize_resources(&self.resources),
        }
    }

    pub fn handle_get_request(&mut self, request: &CoapHeader) -> CoapHeader {
        if let Err(response) = check_allowed(&self.base, request, Method::Get) {
            return response;
        }
        let format = ContentFormat::negotiate_container(request, self.resources.len());
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
        if let Err(code) = self
            .base
            .handle_observation(request, &mut response, format, None)
        {
            return CoapHeader::response_to(request, code);
        }
        response
    }

    pub fn handle_put_request(&mut self, request: &CoapHeader) -> (CoapHeader, bool) {
        if let Err(response) = check_allowed(&self.base, request, Method::Put) {
            return (response, false);
        }
        if request.payload.is_empty() {
            let code = match request.uri_query {
                Some(_) => self.base.write_attributes(request),
                None => ResponseCode::BadRequest,
            };
            return (CoapHeader::response_to(request, code), false);
        }
        self.write(request, WriteMode::Put)
    }

    /// Partial update: writes existing resources and creates missing ones
    pub fn handle_post_request(&mut self, request: &CoapHeader) -> (CoapHeader, bool) {
        if let Err(response) = check_allowed(&self.base, request, Method::Post) {
            return (response, false);
        }
        self.write(request, WriteMode::Post)
    }

    fn write(&mut self, request: &CoapHeader, mode: WriteMode) -> (CoapHeader, bool) {
        let result = match request.content_format.and_then(ContentFormat::from_u16) {
            Some(ContentFormat::OmaTlv) => tlv::deserialize_resources(&request.payload, self, mode),
            Some(ContentFormat::OmaJson) => {
                json::deserialize_resources(&request.payload, self, mode)
            }
            _ => {
                return (
                    CoapHeader::response_to(request, ResponseCode::NotAcceptable),
                    false,
                );
            }
        };
        match result {
            Ok(()) => (CoapHeader::response_to(request, ResponseCode::Changed), true),
            Err(e) => {
                log::debug!("Write to {} rejected: {}", self.path(), e);
                (CoapHeader::response_to(request, e.response_code()), false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_instance() -> ObjectInstance {
        let mut oi = ObjectInstance::new("3", 0, Operation::GET_PUT_POST_ALLOWED);
        oi.create_static_resource("0", "Manufacturer", ResourceType::String, b"Acme", false)
            .unwrap();
        let res = oi
            .create_dynamic_resource("13", "CurrentTime", ResourceType::Time, true, false)
            .unwrap();
        res.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
        res.set_value_int(1_700_000_000);
        oi
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut oi = device_instance();
        let result = oi.create_dynamic_resource("0", "", ResourceType::String, false, false);
        assert!(matches!(result, Err(Lwm2mError::AlreadyExists(_))));
    }

    #[test]
    fn test_resource_instances_share_parent() {
        let mut oi = device_instance();
        oi.create_dynamic_resource_instance("11", "ErrorCode", ResourceType::Integer, true, 0)
            .unwrap();
        oi.create_dynamic_resource_instance("11", "ErrorCode", ResourceType::Integer, true, 1)
            .unwrap();
        let res = oi.resource("11").unwrap();
        assert!(res.supports_multiple_instances());
        assert_eq!(res.resource_instance_count(), 2);
        assert!(
            oi.create_static_resource_instance("0", "", ResourceType::String, b"x", 0)
                .is_err()
        );
        assert!(oi.remove_resource_instance("11", 0));
        assert_eq!(oi.resource("11").unwrap().resource_instance_count(), 1);
    }

    #[test]
    fn test_static_resource_is_read_only() {
        let oi = device_instance();
        let res = oi.resource("0").unwrap();
        assert_eq!(res.base().mode(), Mode::Static);
        assert_eq!(res.base().operation(), Operation::GET_ALLOWED);
        assert_eq!(res.value(), b"Acme");
        assert_eq!(res.path().to_string(), "3/0/0");
    }

    #[test]
    fn test_get_is_tlv() {
        let mut oi = device_instance();
        let request = CoapHeader::request(Method::Get, "3/0").with_accept(ContentFormat::OmaJson);
        let response = oi.handle_get_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::Content));
        assert_eq!(response.content_format, Some(99));
        let records = tlv::decode(&response.payload).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_put_tlv_updates_writable_resource() {
        let mut oi = device_instance();
        let mut payload = Vec::new();
        tlv::encode_record(&mut payload, tlv::TlvType::Resource, 13, b"1800000000").unwrap();
        let request = CoapHeader::request(Method::Put, "3/0").with_payload(payload, ContentFormat::OmaTlv);
        let (response, updated) = oi.handle_put_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::Changed));
        assert!(updated);
        assert_eq!(oi.resource("13").unwrap().value_int(), Some(1_800_000_000));
    }

    #[test]
    fn test_put_tlv_read_only_not_allowed() {
        let mut oi = device_instance();
        let mut payload = Vec::new();
        tlv::encode_record(&mut payload, tlv::TlvType::Resource, 0, b"Evil").unwrap();
        let request = CoapHeader::request(Method::Put, "3/0").with_payload(payload, ContentFormat::OmaTlv);
        let (response, updated) = oi.handle_put_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::MethodNotAllowed));
        assert!(!updated);
    }

    #[test]
    fn test_put_tlv_unknown_resource_not_found() {
        let mut oi = device_instance();
        let mut payload = Vec::new();
        tlv::encode_record(&mut payload, tlv::TlvType::Resource, 99, b"x").unwrap();
        let request = CoapHeader::request(Method::Put, "3/0").with_payload(payload, ContentFormat::OmaTlv);
        let (response, _) = oi.handle_put_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::NotFound));
    }

    #[test]
    fn test_post_creates_resource() {
        let mut oi = device_instance();
        let mut payload = Vec::new();
        tlv::encode_record(&mut payload, tlv::TlvType::Resource, 14, b"+02:00").unwrap();
        let request = CoapHeader::request(Method::Post, "3/0").with_payload(payload, ContentFormat::OmaTlv);
        let (response, updated) = oi.handle_post_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::Changed));
        assert!(updated);
        assert_eq!(oi.resource("14").unwrap().value(), b"+02:00");
    }

    #[test]
    fn test_put_plain_text_not_acceptable() {
        let mut oi = device_instance();
        let request = CoapHeader::request(Method::Put, "3/0")
            .with_payload(b"hello".to_vec(), ContentFormat::TextPlain);
        let (response, _) = oi.handle_put_request(&request);
        assert_eq!(response.response_code(), Some(ResponseCode::NotAcceptable));
    }
}
