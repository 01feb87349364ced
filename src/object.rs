//! Objects: the roots of the resource tree

use crate::base::{Base, BaseType, Mode, Operation, WriteMode, check_allowed};
use crate::coap_types::{CoapHeader, ContentFormat, Method, ResponseCode};
use crate::error::{DecodeError, Lwm2mError, Result};
use crate::json;
use crate::object_instance::ObjectInstance;
use crate::path::Lwm2mPath;
use crate::tlv;

/// An LWM2M object and its instances
#[derive(Debug)]
pub struct Object {
    base: Base,
    instances: Vec<ObjectInstance>,
}

impl Object {
    /// Create an empty object; numeric names like "3" double as the object id
    pub fn new(name: &str) -> Self {
        let mut base = Base::new(name, BaseType::Object, Mode::Dynamic);
        base.set_operation(Operation::GET_ALLOWED);
        Self {
            base,
            instances: Vec::new(),
        }
    }

    pub fn base(&self) -> &Base {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn path(&self) -> Lwm2mPath {
        Lwm2mPath::object(self.base.name())
    }

    pub fn instances(&self) -> &[ObjectInstance] {
        &self.instances
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn object_instance(&self, instance_id: u16) -> Option<&ObjectInstance> {
        self.instances
            .iter()
            .find(|oi| oi.instance_id() == instance_id)
    }

    pub fn object_instance_mut(&mut self, instance_id: u16) -> Option<&mut ObjectInstance> {
        self.instances
            .iter_mut()
            .find(|oi| oi.instance_id() == instance_id)
    }

    /// Lowest instance id not in use
    pub fn next_free_instance_id(&self) -> Option<u16> {
        (0..=u16::MAX).find(|id| self.object_instance(*id).is_none())
    }

    /// Create an instance, picking the lowest free id when none is given
    ///
    /// The instance starts with this object's operation mask.
    pub fn create_object_instance(&mut self, instance_id: Option<u16>) -> Result<&mut ObjectInstance> {
        let id = match instance_id {
            Some(id) if self.object_instance(id).is_some() => {
                return Err(Lwm2mError::AlreadyExists(format!("{}/{}", self.name(), id)));
            }
            Some(id) => id,
            None => self.next_free_instance_id().ok_or_else(|| {
                Lwm2mError::InvalidValue(format!("no free instance id in {}", self.name()))
            })?,
        };
        Ok(self.push_instance(id))
    }

    fn push_instance(&mut self, instance_id: u16) -> &mut ObjectInstance {
        let instance = ObjectInstance::new(self.base.name(), instance_id, self.base.operation());
        self.instances.push(instance);
        let last = self.instances.len() - 1;
        &mut self.instances[last]
    }

    pub fn remove_object_instance(&mut self, instance_id: u16) -> bool {
        let before = self.instances.len();
        self.instances.retain(|oi| oi.instance_id() != instance_id);
        before != self.instances.len()
    }

    /// Instance a decoded payload writes to; created in Post mode when missing
    pub(crate) fn instance_for_write(
        &mut self,
        instance_id: u16,
        mode: WriteMode,
    ) -> std::result::Result<&mut ObjectInstance, DecodeError> {
        if let Some(pos) = self
            .instances
            .iter()
            .position(|oi| oi.instance_id() == instance_id)
        {
            return Ok(&mut self.instances[pos]);
        }
        match mode {
            WriteMode::Put => Err(DecodeError::NotFound),
            WriteMode::Post if !self.base.operation().allows(Method::Post) => {
                Err(DecodeError::NotAllowed)
            }
            WriteMode::Post => Ok(self.push_instance(instance_id)),
        }
    }

    /// Encode all instances in `format`
    pub fn encode(&self, format: ContentFormat) -> Result<Vec<u8>> {
        match format {
            ContentFormat::OmaJson => json::serialize_object(self),
            _ => tlv::serialize_object_instances(&self.instances),
        }
    }

    pub fn handle_get_request(&mut self, request: &CoapHeader) -> CoapHeader {
        if let Err(response) = check_allowed(&self.base, request, Method::Get) {
            return response;
        }
        let format = ContentFormat::negotiate_container(request, self.instances.len());
        let payload = match self.encode(format) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Failed to encode {}: {}", self.name(), e);
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
        let result = match request.content_format.and_then(ContentFormat::from_u16) {
            Some(ContentFormat::OmaTlv) => {
                tlv::deserialize_object_instances(&request.payload, self, WriteMode::Put)
            }
            Some(ContentFormat::OmaJson) => {
                json::deserialize_object_instances(&request.payload, self, WriteMode::Put)
            }
            _ => Err(DecodeError::NotValid),
        };
        match result {
            Ok(()) => (CoapHeader::response_to(request, ResponseCode::Changed), true),
            Err(e) => {
                log::debug!("PUT on {} rejected: {}", self.name(), e);
                (CoapHeader::response_to(request, e.response_code()), false)
            }
        }
    }

    /// Create an object instance from a POST
    ///
    /// The payload either wraps resources in an object-instance record or
    /// carries bare resources, in which case the instance gets `requested_id`
    /// or the lowest free id. On success the response is 2.01 with the new
    /// instance path as Location-Path.
    pub fn handle_post_request(
        &mut self,
        request: &CoapHeader,
        requested_id: Option<u16>,
    ) -> (CoapHeader, bool) {
        if let Err(response) = check_allowed(&self.base, request, Method::Post) {
            return (response, false);
        }
        let format = request
            .content_format
            .and_then(ContentFormat::from_u16)
            .unwrap_or(ContentFormat::OmaTlv);
        let payload = request.payload.as_slice();

        let wrapped = format == ContentFormat::OmaTlv && tlv::is_object_instance(payload);
        let instance_id = if wrapped {
            tlv::instance_id(payload)
        } else {
            requested_id.or_else(|| self.next_free_instance_id())
        };
        let Some(instance_id) = instance_id else {
            return (CoapHeader::response_to(request, ResponseCode::BadRequest), false);
        };
        if requested_id.is_some_and(|id| id != instance_id)
            || self.object_instance(instance_id).is_some()
        {
            log::debug!("Instance {}/{} cannot be created", self.name(), instance_id);
            return (CoapHeader::response_to(request, ResponseCode::BadRequest), false);
        }

        let result = match format {
            ContentFormat::OmaTlv if wrapped => {
                tlv::deserialize_object_instances(payload, self, WriteMode::Post)
            }
            ContentFormat::OmaTlv => {
                let instance = self.push_instance(instance_id);
                tlv::deserialize_resources(payload, instance, WriteMode::Post)
            }
            ContentFormat::OmaJson => {
                let instance = self.push_instance(instance_id);
                json::deserialize_resources(payload, instance, WriteMode::Post)
            }
            _ => Err(DecodeError::NotValid),
        };

        match result {
            Ok(()) => {
                log::info!("Created object instance {}/{}", self.name(), instance_id);
                let mut response = CoapHeader::response_to(request, ResponseCode::Created);
                response.location_path = Some(format!("{}/{}", self.name(), instance_id));
                (response, true)
            }
            Err(e) => {
                self.remove_object_instance(instance_id);
                log::debug!("POST on {} rejected: {}", self.name(), e);
                (CoapHeader::response_to(request, e.response_code()), false)
            }
        }
    }
}
