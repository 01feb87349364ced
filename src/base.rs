//! Fields and behavior shared by every node of the resource tree

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Instant;

use crate::coap_types::{CoapHeader, ContentFormat, Method, ResponseCode, observe};
use crate::report_handler::{NotificationAttributes, ReportDecision, ReportHandler};

/// CoAP methods a node accepts, as a bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Operation(u8);

impl Operation {
    pub const NOT_ALLOWED: Self = Self(0x00);
    pub const GET_ALLOWED: Self = Self(0x01);
    pub const PUT_ALLOWED: Self = Self(0x02);
    pub const GET_PUT_ALLOWED: Self = Self(0x03);
    pub const POST_ALLOWED: Self = Self(0x04);
    pub const GET_POST_ALLOWED: Self = Self(0x05);
    pub const PUT_POST_ALLOWED: Self = Self(0x06);
    pub const GET_PUT_POST_ALLOWED: Self = Self(0x07);
    pub const DELETE_ALLOWED: Self = Self(0x08);
    pub const GET_PUT_POST_DELETE_ALLOWED: Self = Self(0x0F);

    /// Raw mask
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Check if every bit of `other` is set
    pub fn contains(self, other: Operation) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if `method` may be executed
    pub fn allows(self, method: Method) -> bool {
        let required = match method {
            Method::Get => Self::GET_ALLOWED,
            Method::Put => Self::PUT_ALLOWED,
            Method::Post => Self::POST_ALLOWED,
            Method::Delete => Self::DELETE_ALLOWED,
        };
        self.contains(required)
    }
}

impl BitOr for Operation {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Operation {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How a node's value is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Fixed value, read-only
    Static,
    /// Value may change at runtime
    #[default]
    Dynamic,
    /// Value produced on demand by the application
    Directory,
}

/// Level of a node in the resource tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Object,
    ObjectInstance,
    Resource,
    ResourceInstance,
}

impl BaseType {
    /// Observation level bit a node of this type sets when observed
    pub fn observation_level(self) -> ObservationLevel {
        match self {
            Self::Object => ObservationLevel::O,
            Self::ObjectInstance => ObservationLevel::OI,
            Self::Resource | Self::ResourceInstance => ObservationLevel::R,
        }
    }
}

/// Which levels of the tree currently observe a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObservationLevel(u8);

impl ObservationLevel {
    pub const NONE: Self = Self(0x00);
    pub const R: Self = Self(0x01);
    pub const OI: Self = Self(0x02);
    pub const O: Self = Self(0x04);
    pub const OOI: Self = Self(0x06);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: ObservationLevel) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Whether a decoded payload updates existing nodes or may create new ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Only existing nodes are written
    Put,
    /// Missing nodes are created
    Post,
}

/// Boxed application callback
pub struct Callback<F: ?Sized>(Box<F>);

impl<F: ?Sized> fmt::Debug for Callback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// Called with the node path after a server write completed
pub type ValueUpdatedCallback = Callback<dyn FnMut(&str)>;

/// Called with the POST payload when a resource is executed
pub type ExecuteCallback = Callback<dyn FnMut(&[u8])>;

impl Callback<dyn FnMut(&str)> {
    pub fn new(f: impl FnMut(&str) + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn call(&mut self, path: &str) {
        (self.0)(path)
    }
}

impl Callback<dyn FnMut(&[u8])> {
    pub fn new(f: impl FnMut(&[u8]) + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn call(&mut self, arguments: &[u8]) {
        (self.0)(arguments)
    }
}

/// Active observation of a node
#[derive(Debug, Clone)]
pub struct Observation {
    token: Vec<u8>,
    number: u16,
    format: ContentFormat,
    report: ReportHandler,
}

impl Observation {
    /// Token the server registered the observation with
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Observe number the next notification carries
    pub fn number(&self) -> u16 {
        self.number
    }

    /// Content format negotiated when the observation started
    pub fn format(&self) -> ContentFormat {
        self.format
    }

    pub fn report_handler(&self) -> &ReportHandler {
        &self.report
    }

    pub(crate) fn report_handler_mut(&mut self) -> &mut ReportHandler {
        &mut self.report
    }

    /// Take the current observe number and advance it
    pub(crate) fn next_number(&mut self) -> u16 {
        let number = self.number;
        self.number = self.number.wrapping_add(1);
        number
    }
}

/// Common node state: identity, permissions and observation
#[derive(Debug)]
pub struct Base {
    name: String,
    name_id: Option<u16>,
    instance_id: u16,
    base_type: BaseType,
    mode: Mode,
    operation: Operation,
    resource_type: String,
    interface_description: String,
    coap_content_type: u8,
    max_age: u32,
    observable: bool,
    observation_level: ObservationLevel,
    attributes: NotificationAttributes,
    observation: Option<Observation>,
    value_updated: Option<ValueUpdatedCallback>,
}

impl Base {
    /// Numeric names double as the TLV identifier
    pub(crate) fn new(name: &str, base_type: BaseType, mode: Mode) -> Self {
        Self {
            name: name.to_string(),
            name_id: name.parse().ok(),
            instance_id: 0,
            base_type,
            mode,
            operation: Operation::NOT_ALLOWED,
            resource_type: String::new(),
            interface_description: String::new(),
            coap_content_type: 0,
            max_age: 0,
            observable: false,
            observation_level: ObservationLevel::NONE,
            attributes: NotificationAttributes::default(),
            observation: None,
            value_updated: None,
        }
    }

    /// Get the node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric alias used as the TLV identifier
    pub fn name_id(&self) -> Option<u16> {
        self.name_id
    }

    /// Set the numeric alias
    pub fn set_name_id(&mut self, name_id: Option<u16>) {
        self.name_id = name_id;
    }

    /// Instance id within the parent
    pub fn instance_id(&self) -> u16 {
        self.instance_id
    }

    pub(crate) fn set_instance_id(&mut self, instance_id: u16) {
        self.instance_id = instance_id;
    }

    /// Get the node kind
    pub fn base_type(&self) -> BaseType {
        self.base_type
    }

    /// Get the storage mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Get the allowed methods
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Set the allowed methods
    pub fn set_operation(&mut self, operation: Operation) {
        self.operation = operation;
    }

    /// Get the `rt` link attribute
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Set the `rt` link attribute
    pub fn set_resource_type(&mut self, resource_type: &str) {
        self.resource_type = resource_type.to_string();
    }

    /// Get the `if` link attribute
    pub fn interface_description(&self) -> &str {
        &self.interface_description
    }

    /// Set the `if` link attribute
    pub fn set_interface_description(&mut self, description: &str) {
        self.interface_description = description.to_string();
    }

    /// Get the `ct` link attribute
    pub fn coap_content_type(&self) -> u8 {
        self.coap_content_type
    }

    /// Set the `ct` link attribute
    pub fn set_coap_content_type(&mut self, content_type: u8) {
        self.coap_content_type = content_type;
    }

    /// Get the Max-Age in seconds
    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    /// Set the Max-Age in seconds
    pub fn set_max_age(&mut self, max_age: u32) {
        self.max_age = max_age;
    }

    /// Check if the node accepts Observe
    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Allow or refuse Observe
    pub fn set_observable(&mut self, observable: bool) {
        self.observable = observable;
    }

    /// Get the levels this node is observed at
    pub fn observation_level(&self) -> ObservationLevel {
        self.observation_level
    }

    pub fn add_observation_level(&mut self, level: ObservationLevel) {
        self.observation_level.0 |= level.0;
    }

    pub fn remove_observation_level(&mut self, level: ObservationLevel) {
        self.observation_level.0 &= !level.0;
    }

    /// Check if an observation is active
    pub fn is_under_observation(&self) -> bool {
        self.observation.is_some()
    }

    /// Get the active observation
    pub fn observation(&self) -> Option<&Observation> {
        self.observation.as_ref()
    }

    pub(crate) fn observation_mut(&mut self) -> Option<&mut Observation> {
        self.observation.as_mut()
    }

    /// Token of the active observation
    pub fn observation_token(&self) -> Option<&[u8]> {
        self.observation.as_ref().map(|o| o.token.as_slice())
    }

    /// Stop observing this node. Starting an observation takes a GET with Observe=0.
    pub fn set_under_observation(&mut self, observed: bool) {
        if !observed && self.observation.take().is_some() {
            self.remove_observation_level(self.base_type.observation_level());
        }
    }

    /// Attributes stored through Write-Attributes
    pub fn attributes(&self) -> &NotificationAttributes {
        &self.attributes
    }

    /// Merge Write-Attributes into the stored set
    pub fn set_attributes(&mut self, attributes: &NotificationAttributes) {
        self.attributes.merge(attributes);
        if let Some(observation) = self.observation.as_mut() {
            observation.report.set_attributes(attributes);
        }
    }

    /// Set the callback run after a server write
    pub fn set_value_updated_function(&mut self, callback: impl FnMut(&str) + 'static) {
        self.value_updated = Some(ValueUpdatedCallback::new(callback));
    }

    pub fn is_value_updated_function_set(&self) -> bool {
        self.value_updated.is_some()
    }

    /// Run the value-updated callback; false when none is set
    pub fn execute_value_updated(&mut self, path: &str) -> bool {
        match self.value_updated.as_mut() {
            Some(callback) => {
                callback.call(path);
                true
            }
            None => false,
        }
    }

    /// Apply the Observe option of a successful GET
    ///
    /// Observe=0 on an observable node starts an observation with the request
    /// token and stamps the response; Observe=1 cancels it. Non-observable
    /// nodes ignore the option.
    pub(crate) fn handle_observation(
        &mut self,
        request: &CoapHeader,
        response: &mut CoapHeader,
        format: ContentFormat,
        value: Option<f64>,
    ) -> std::result::Result<(), ResponseCode> {
        if !self.observable {
            return Ok(());
        }
        match request.observe {
            Some(observe::REGISTER) => {
                let mut attributes = self.attributes.clone();
                if request.uri_query.is_some() {
                    let requested = NotificationAttributes::parse(&request.query())
                        .map_err(|_| ResponseCode::BadRequest)?;
                    attributes.merge(&requested);
                }
                let mut report = ReportHandler::new(attributes);
                report.notification_sent(Instant::now(), value);
                let mut observation = Observation {
                    token: request.token.clone(),
                    number: 0,
                    format,
                    report,
                };
                response.observe = Some(u32::from(observation.next_number()));
                self.observation = Some(observation);
                self.add_observation_level(self.base_type.observation_level());
                log::debug!("Observation started on {}", self.name);
            }
            Some(observe::DEREGISTER) => {
                self.set_under_observation(false);
                log::debug!("Observation cancelled on {}", self.name);
            }
            _ => {}
        }
        Ok(())
    }

    /// Write-Attributes: a PUT with a query and no payload
    pub(crate) fn write_attributes(&mut self, request: &CoapHeader) -> ResponseCode {
        match NotificationAttributes::parse(&request.query()) {
            Ok(attributes) => {
                self.set_attributes(&attributes);
                ResponseCode::Changed
            }
            Err(e) => {
                log::debug!("Rejected attributes for {}: {}", self.name, e);
                ResponseCode::BadRequest
            }
        }
    }

    /// Feed a value change to the report handler
    pub fn notification_update(&mut self, now: Instant, value: Option<f64>) -> ReportDecision {
        match self.observation.as_mut() {
            Some(observation) => observation.report.value_changed(now, value),
            None => ReportDecision::Suppress,
        }
    }

    /// Base response for a request, stamped with max-age
    pub(crate) fn response(&self, request: &CoapHeader, code: ResponseCode) -> CoapHeader {
        let mut response = CoapHeader::response_to(request, code);
        if self.max_age > 0 && code == ResponseCode::Content {
            response.max_age = Some(self.max_age);
        }
        response
    }
}

/// Check the operation mask, building a 4.05 response when `method` is not allowed
pub(crate) fn check_allowed(
    base: &Base,
    request: &CoapHeader,
    method: Method,
) -> std::result::Result<(), CoapHeader> {
    if base.operation().allows(method) {
        Ok(())
    } else {
        log::debug!("{} not allowed on {}", method, base.name());
        Err(CoapHeader::response_to(
            request,
            ResponseCode::MethodNotAllowed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_operation_mask() {
        let op = Operation::GET_ALLOWED | Operation::POST_ALLOWED;
        assert_eq!(op, Operation::GET_POST_ALLOWED);
        assert!(op.allows(Method::Get));
        assert!(op.allows(Method::Post));
        assert!(!op.allows(Method::Put));
        assert!(!op.allows(Method::Delete));
        assert!(!Operation::NOT_ALLOWED.allows(Method::Get));
    }

    #[test]
    fn test_numeric_name_sets_name_id() {
        assert_eq!(Base::new("5", BaseType::Resource, Mode::Dynamic).name_id(), Some(5));
        assert_eq!(Base::new("temp", BaseType::Resource, Mode::Dynamic).name_id(), None);
    }

    #[test]
    fn test_observation_levels() {
        let mut base = Base::new("3", BaseType::Object, Mode::Dynamic);
        base.add_observation_level(ObservationLevel::O);
        base.add_observation_level(ObservationLevel::OI);
        assert!(base.observation_level().contains(ObservationLevel::OOI));
        base.remove_observation_level(ObservationLevel::O);
        assert_eq!(base.observation_level(), ObservationLevel::OI);
        base.remove_observation_level(ObservationLevel::OI);
        assert!(base.observation_level().is_none());
    }

    #[test]
    fn test_observation_lifecycle() {
        let mut base = Base::new("1", BaseType::Resource, Mode::Dynamic);
        base.set_observable(true);

        let request = CoapHeader::request(Method::Get, "3/0/1")
            .with_token(&[0xAA])
            .with_observe(observe::REGISTER);
        let mut response = CoapHeader::response_to(&request, ResponseCode::Content);
        base.handle_observation(&request, &mut response, ContentFormat::TextPlain, None)
            .unwrap();
        assert!(base.is_under_observation());
        assert_eq!(base.observation_token(), Some(&[0xAA][..]));
        assert_eq!(response.observe, Some(0));
        assert_eq!(base.observation().map(|o| o.number()), Some(1));

        let cancel = CoapHeader::request(Method::Get, "3/0/1").with_observe(observe::DEREGISTER);
        let mut response = CoapHeader::response_to(&cancel, ResponseCode::Content);
        base.handle_observation(&cancel, &mut response, ContentFormat::TextPlain, None)
            .unwrap();
        assert!(!base.is_under_observation());
        assert!(base.observation_level().is_none());
    }

    #[test]
    fn test_observe_ignored_when_not_observable() {
        let mut base = Base::new("1", BaseType::Resource, Mode::Dynamic);
        let request = CoapHeader::request(Method::Get, "3/0/1").with_observe(observe::REGISTER);
        let mut response = CoapHeader::response_to(&request, ResponseCode::Content);
        base.handle_observation(&request, &mut response, ContentFormat::TextPlain, None)
            .unwrap();
        assert!(!base.is_under_observation());
        assert_eq!(response.observe, None);
    }

    #[test]
    fn test_invalid_observe_query_is_bad_request() {
        let mut base = Base::new("1", BaseType::Resource, Mode::Dynamic);
        base.set_observable(true);
        let request = CoapHeader::request(Method::Get, "3/0/1")
            .with_observe(observe::REGISTER)
            .with_query("pmin=x");
        let mut response = CoapHeader::response_to(&request, ResponseCode::Content);
        let result = base.handle_observation(&request, &mut response, ContentFormat::OmaTlv, None);
        assert_eq!(result, Err(ResponseCode::BadRequest));
        assert!(!base.is_under_observation());
    }

    #[test]
    fn test_value_updated_callback() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut base = Base::new("1", BaseType::Resource, Mode::Dynamic);
        assert!(!base.execute_value_updated("3/0/1"));

        base.set_value_updated_function(move |path| sink.borrow_mut().push(path.to_string()));
        assert!(base.is_value_updated_function_set());
        assert!(base.execute_value_updated("3/0/1"));
        assert_eq!(*seen.borrow(), vec!["3/0/1".to_string()]);
    }
}
