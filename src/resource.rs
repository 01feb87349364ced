//! Resources: single-value or multiple-instance leaves of an object instance

use crate::base::{Base, BaseType, ExecuteCallback, Mode, Operation, WriteMode, check_allowed};
use crate::coap_types::{CoapHeader, ContentFormat, Method, ResponseCode};
use crate::error::{DecodeError, Lwm2mError, Result};
use crate::json;
use crate::path::Lwm2mPath;
use crate::resource_instance::{ResourceInstance, ResourceType, ResourceValue};
use crate::tlv;

/// A resource of an object instance
///
/// A multiple-instance resource keeps its values only in its instances.
#[derive(Debug)]
pub struct Resource {
    base: Base,
    value: ResourceValue,
    multiple: bool,
    instances: Vec<ResourceInstance>,
    execute: Option<ExecuteCallback>,
    delayed_response: bool,
    delayed_token: Option<Vec<u8>>,
    object_name: String,
    object_instance_id: u16,
}

impl Resource {
    pub(crate) fn new(
        name: &str,
        kind: ResourceType,
        mode: Mode,
        multiple: bool,
        object_name: &str,
        object_instance_id: u16,
    ) -> Self {
        let mut base = Base::new(name, BaseType::Resource, mode);
        base.set_operation(Operation::GET_ALLOWED);
        Self {
            base,
            value: ResourceValue::new(kind),
            multiple,
            instances: Vec::new(),
            execute: None,
            delayed_response: false,
            delayed_token: None,
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

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn path(&self) -> Lwm2mPath {
        Lwm2mPath::object(&self.object_name)
            .instance(self.object_instance_id)
            .resource(self.base.name())
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn object_instance_id(&self) -> u16 {
        self.object_instance_id
    }

    pub fn resource_instance_type(&self) -> ResourceType {
        self.value.kind()
    }

    pub fn supports_multiple_instances(&self) -> bool {
        self.multiple
    }

    /// Check if `id` is this resource's TLV identifier
    pub(crate) fn matches_id(&self, id: u16) -> bool {
        self.base.name_id() == Some(id)
    }

    pub fn value(&self) -> &[u8] {
        self.value.as_bytes()
    }

    pub fn resource_value(&self) -> &ResourceValue {
        &self.value
    }

    /// Replace the value, returning whether it changed
    ///
    /// Multiple-instance resources hold no value of their own and return false.
    pub fn set_value(&mut self, value: &[u8]) -> bool {
        if self.multiple {
            log::warn!("Ignoring value for multiple-instance resource {}", self.path());
            return false;
        }
        self.value.set(value)
    }

    pub fn set_value_int(&mut self, value: i64) -> bool {
        self.set_value(value.to_string().as_bytes())
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

    pub fn resource_instances(&self) -> &[ResourceInstance] {
        &self.instances
    }

    pub fn resource_instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn resource_instance(&self, instance_id: u16) -> Option<&ResourceInstance> {
        self.instances
            .iter()
            .find(|ri| ri.instance_id() == instance_id)
    }

    pub fn resource_instance_mut(&mut self, instance_id: u16) -> Option<&mut ResourceInstance> {
        self.instances
            .iter_mut()
            .find(|ri| ri.instance_id() == instance_id)
    }

    /// Add an instance to a multiple-instance resource
    pub fn add_resource_instance(
        &mut self,
        instance_id: u16,
        mode: Mode,
    ) -> Result<&mut ResourceInstance> {
        if !self.multiple {
            return Err(Lwm2mError::InvalidValue(format!(
                "{} is a single-instance resource",
                self.path()
            )));
        }
        if self.resource_instance(instance_id).is_some() {
            return Err(Lwm2mError::AlreadyExists(format!(
                "{}/{}",
                self.path(),
                instance_id
            )));
        }
        Ok(self.push_instance(instance_id, mode))
    }

    fn push_instance(&mut self, instance_id: u16, mode: Mode) -> &mut ResourceInstance {
        let mut instance = ResourceInstance::new(
            self.base.name(),
            instance_id,
            self.value.kind(),
            mode,
            &self.object_name,
            self.object_instance_id,
        );
        instance.base_mut().set_operation(self.base.operation());
        self.instances.push(instance);
        let last = self.instances.len() - 1;
        &mut self.instances[last]
    }

    pub fn remove_resource_instance(&mut self, instance_id: u16) -> bool {
        let before = self.instances.len();
        self.instances.retain(|ri| ri.instance_id() != instance_id);
        before != self.instances.len()
    }

    /// Instance a decoded payload writes to; created in Post mode when missing
    pub(crate) fn instance_for_write(
        &mut self,
        instance_id: u16,
        mode: WriteMode,
    ) -> std::result::Result<&mut ResourceInstance, DecodeError> {
        if !self.multiple {
            return Err(DecodeError::NotValid);
        }
        if let Some(pos) = self
            .instances
            .iter()
            .position(|ri| ri.instance_id() == instance_id)
        {
            return Ok(&mut self.instances[pos]);
        }
        match mode {
            WriteMode::Put => Err(DecodeError::NotFound),
            WriteMode::Post => Ok(self.push_instance(instance_id, Mode::Dynamic)),
        }
    }

    pub fn set_execute_function(&mut self, callback: impl FnMut(&[u8]) + 'static) {
        self.execute = Some(ExecuteCallback::new(callback));
    }

    /// Run the execute callback with the POST arguments
    pub fn execute(&mut self, arguments: &[u8]) -> bool {
        match self.execute.as_mut() {
            Some(callback) => {
                callback.call(arguments);
                true
            }
            None => false,
        }
    }

    /// Answer POST with an empty ACK and send the result later
    pub fn set_delayed_response(&mut self, delayed: bool) {
        self.delayed_response = delayed;
    }

    pub fn delayed_response(&self) -> bool {
        self.delayed_response
    }

    /// Token of the POST awaiting its delayed response
    pub fn delayed_token(&self) -> Option<&[u8]> {
        self.delayed_token.as_deref()
    }

    pub(crate) fn take_delayed_token(&mut self) -> Option<Vec<u8>> {
        self.delayed_token.take()
    }

    /// Encode this resource in `format`
    pub fn encode(&self, format: ContentFormat) -> Result<Vec<u8>> {
        match format {
            ContentFormat::OmaTlv => tlv::serialize_resource(self),
            ContentFormat::OmaJson => json::serialize_resource(self),
            _ => Ok(self.value().to_vec()),
        }
    }

    /// Numeric reading for threshold checks
    pub(crate) fn numeric_value(&self) -> Option<f64> {
        if self.multiple {
            None
        } else {
            self.value.numeric()
        }
    }

    pub fn handle_get_request(&mut self, request: &CoapHeader) -> CoapHeader {
        if let Err(response) = check_allowed(&self.base, request, Method::Get) {
            return response;
        }
        let format = if self.multiple {
            ContentFormat::negotiate_container(request, self.instances.len())
        } else {
            ContentFormat::negotiate_leaf(request)
        };
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
        let numeric = self.numeric_value();
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

        let format = request.content_format.and_then(ContentFormat::from_u16);
        let result = match (format, self.multiple) {
            (Some(ContentFormat::OmaTlv), true) => {
                tlv::deserialize_resource_instances(&request.payload, self, WriteMode::Put)
            }
            (Some(ContentFormat::OmaJson), true) => {
                json::deserialize_resource_instances(&request.payload, self, WriteMode::Put)
            }
            (_, true) => Err(DecodeError::NotValid),
            (Some(ContentFormat::OmaTlv), false) => {
                tlv::deserialize_single_value(&request.payload, self.base.name_id()).map(
                    |value| {
                        self.set_value(&value);
                    },
                )
            }
            (Some(ContentFormat::OmaJson), false) => {
                json::deserialize_single_value(&request.payload, self.value.kind()).map(
                    |value| {
                        self.set_value(&value);
                    },
                )
            }
            (_, false) => {
                self.set_value(&request.payload);
                Ok(())
            }
        };

        match result {
            Ok(()) => (CoapHeader::response_to(request, ResponseCode::Changed), true),
            Err(e) => {
                log::debug!("PUT on {} rejected: {}", self.path(), e);
                (CoapHeader::response_to(request, e.response_code()), false)
            }
        }
    }

    /// Execute the resource
    ///
    /// A delayed-response resource stores the request token and answers with an
    /// empty ACK; the real response follows later.
    pub fn handle_post_request(&mut self, request: &CoapHeader) -> (CoapHeader, bool) {
        if let Err(response) = check_allowed(&self.base, request, Method::Post) {
            return (response, false);
        }
        self.execute(&request.payload);
        if self.delayed_response {
            self.delayed_token = Some(request.token.clone());
            return (CoapHeader::empty_ack(request), false);
        }
        (CoapHeader::response_to(request, ResponseCode::Changed), false)
    }
}
