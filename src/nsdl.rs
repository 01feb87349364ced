//! NSDL Interface
//!
//! Owns the resource tree and connects it to an external CoAP engine. This is
//! the core of the library: inbound requests go through [`NsdlInterface::resource_callback`],
//! responses to the client's own Register/Update/De-register/Bootstrap requests
//! go through [`NsdlInterface::received_from_server_callback`], and state changes
//! are reported to an [`NsdlObserver`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::base::{BaseType, Operation};
use crate::coap_types::{
    CoapHeader, ContentFormat, MessageCode, MessageType, Method, ResponseCode,
};
use crate::config::{ClientConfig, EndpointParams, resolve_uri};
use crate::error::{Lwm2mError, RegistrationError, Result};
use crate::factory;
use crate::node::{self, NodeMut, NodeRef};
use crate::object::Object;
use crate::path::Lwm2mPath;
use crate::report_handler::ReportDecision;
use crate::tlv;

/// Lifetime used when the configuration sets none, in seconds
pub const DEFAULT_LIFETIME: u32 = 86400;

/// Uri-Path of the Bootstrap-Finish request
pub const BOOTSTRAP_FINISH_PATH: &str = "bs";

/// Registration and bootstrap progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Idle,
    Bootstrapping,
    BootstrapDone,
    BootstrapError,
    Registering,
    Registered,
    UpdateInProgress,
    Unregistering,
}

/// Timers the application drives through [`NsdlInterface::timer_expired`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Flush pmin-deferred and pmax-due notifications
    Notification,
    /// Send a registration update
    RegistrationUpdate,
}

/// One routable node as published to the CoAP engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub path: Lwm2mPath,
    pub resource_type: String,
    pub interface_description: String,
    pub content_type: u8,
    pub observable: bool,
    pub operation: Operation,
}

impl ResourceEntry {
    fn from_node(node: NodeRef<'_>) -> Self {
        let base = node.base();
        Self {
            path: node.path(),
            resource_type: base.resource_type().to_string(),
            interface_description: base.interface_description().to_string(),
            content_type: base.coap_content_type(),
            observable: base.is_observable(),
            operation: base.operation(),
        }
    }

    /// CoRE link-format rendering, e.g. `</3/0/13>;rt="CurrentTime";obs`
    pub fn link(&self) -> String {
        let mut link = format!("</{}>", self.path);
        if !self.resource_type.is_empty() {
            link.push_str(&format!(";rt=\"{}\"", self.resource_type));
        }
        if !self.interface_description.is_empty() {
            link.push_str(&format!(";if=\"{}\"", self.interface_description));
        }
        if self.content_type != 0 {
            link.push_str(&format!(";ct={}", self.content_type));
        }
        if self.observable {
            link.push_str(";obs");
        }
        link
    }
}

/// External CoAP engine the interface sends through
///
/// Every send returns the CoAP message id it used; 0 means the message could
/// not be built or handed to the transport.
pub trait CoapEngine {
    /// Send Register with the endpoint parameters and the link-format payload
    fn register_endpoint(&mut self, params: &EndpointParams, links: &str, server: SocketAddr)
    -> u16;

    /// Send Update to the registration at `location`
    fn update_registration(&mut self, location: &str, lifetime: u32, server: SocketAddr) -> u16;

    /// Send De-register for the registration at `location`
    fn unregister_endpoint(&mut self, location: &str, server: SocketAddr) -> u16;

    /// Send Bootstrap-Request
    fn oma_bootstrap(&mut self, params: &EndpointParams, bootstrap_server: SocketAddr) -> u16;

    /// Add a node to the engine's resource table
    fn create_resource(&mut self, entry: &ResourceEntry) -> bool;

    /// Remove a node from the engine's resource table
    fn delete_resource(&mut self, path: &str) -> bool;

    /// Send a response or notification
    fn send_message(&mut self, message: &CoapHeader, address: SocketAddr) -> u16;
}

/// Receiver of registration and value-change events
pub trait NsdlObserver {
    fn client_registered(&mut self, server: SocketAddr);
    fn registration_updated(&mut self, server: SocketAddr);
    fn client_unregistered(&mut self);
    /// `retry` asks the owner to register again; false marks a terminal error
    fn registration_error(&mut self, error: RegistrationError, retry: bool);
    fn bootstrap_done(&mut self);
    fn bootstrap_error(&mut self);
    /// A server write changed the node at `path`
    fn value_updated(&mut self, path: &Lwm2mPath);
}

#[derive(Debug)]
struct DelayedResponse {
    token: Vec<u8>,
    path: Lwm2mPath,
    address: SocketAddr,
}

/// LWM2M client interface over a CoAP engine
///
/// # Example
/// ```ignore
/// let mut nsdl = NsdlInterface::from_config(engine, observer, &config)?;
/// nsdl.add_object(factory::create_device(&info, "U")?)?;
/// nsdl.start();
/// // From the receive loop:
/// nsdl.resource_callback(&request, peer)?;
/// nsdl.received_from_server_callback(&response, peer);
/// ```
pub struct NsdlInterface<E, O> {
    engine: E,
    observer: O,
    objects: Vec<Object>,
    params: EndpointParams,
    server: Option<SocketAddr>,
    bootstrap_server: Option<SocketAddr>,
    state: RegistrationState,
    location: Option<String>,
    lifetime: u32,
    register_msg_id: Option<u16>,
    update_msg_id: Option<u16>,
    unregister_msg_id: Option<u16>,
    bootstrap_msg_id: Option<u16>,
    resources_created: bool,
    pending_notifications: HashMap<u16, Lwm2mPath>,
    delayed_responses: Vec<DelayedResponse>,
}

impl<E: CoapEngine, O: NsdlObserver> NsdlInterface<E, O> {
    /// Create an interface with no objects and no server address
    pub fn new(engine: E, observer: O, params: EndpointParams) -> Self {
        let lifetime = params.lifetime.unwrap_or(DEFAULT_LIFETIME);
        Self {
            engine,
            observer,
            objects: Vec::new(),
            params,
            server: None,
            bootstrap_server: None,
            state: RegistrationState::Idle,
            location: None,
            lifetime,
            register_msg_id: None,
            update_msg_id: None,
            unregister_msg_id: None,
            bootstrap_msg_id: None,
            resources_created: false,
            pending_notifications: HashMap::new(),
            delayed_responses: Vec::new(),
        }
    }

    /// Create an interface from a validated configuration, resolving the server URIs
    pub fn from_config(engine: E, observer: O, config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let mut nsdl = Self::new(engine, observer, config.endpoint_params());
        nsdl.server = config.server_address()?;
        nsdl.bootstrap_server = config.bootstrap_server_address()?;
        Ok(nsdl)
    }

    /// Get a reference to the CoAP engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Get a mutable reference to the CoAP engine
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Get a reference to the observer
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Get a mutable reference to the observer
    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Current registration state
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Registration lifetime in seconds
    pub fn lifetime(&self) -> u32 {
        self.lifetime
    }

    /// Location-Path of the current registration
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Endpoint parameters sent with Register
    pub fn endpoint_params(&self) -> &EndpointParams {
        &self.params
    }

    /// Address of the LWM2M server
    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Set the address of the LWM2M server
    pub fn set_server_address(&mut self, server: SocketAddr) {
        self.server = Some(server);
    }

    /// Set the address of the bootstrap server
    pub fn set_bootstrap_server_address(&mut self, server: SocketAddr) {
        self.bootstrap_server = Some(server);
    }

    /// Check if the client holds a registration
    pub fn is_registered(&self) -> bool {
        matches!(
            self.state,
            RegistrationState::Registered | RegistrationState::UpdateInProgress
        )
    }

    /// Check if a Register request is awaiting its response
    pub fn is_register_ongoing(&self) -> bool {
        self.register_msg_id.is_some()
    }

    /// Interval after which a registration update keeps the registration alive
    pub fn registration_update_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.lifetime) * 3 / 4)
    }

    fn set_lifetime(&mut self, lifetime: u32) {
        self.lifetime = lifetime;
        self.params.lifetime = Some(lifetime);
    }

    /// Get the registered objects
    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    /// Get an object by name
    pub fn object(&self, name: &str) -> Option<&Object> {
        self.objects.iter().find(|o| o.name() == name)
    }

    /// Get a mutable object by name
    pub fn object_mut(&mut self, name: &str) -> Option<&mut Object> {
        self.objects.iter_mut().find(|o| o.name() == name)
    }

    /// Add an object; once registered its nodes are published right away
    pub fn add_object(&mut self, object: Object) -> Result<()> {
        if self.object(object.name()).is_some() {
            return Err(Lwm2mError::AlreadyExists(object.name().to_string()));
        }
        let path = object.path();
        self.objects.push(object);
        if self.resources_created {
            self.publish(&path);
        }
        Ok(())
    }

    /// Remove an object and its entries in the engine's resource table
    pub fn remove_object(&mut self, name: &str) -> Option<Object> {
        let pos = self.objects.iter().position(|o| o.name() == name)?;
        if self.resources_created {
            self.unpublish(&Lwm2mPath::object(name), true);
        }
        Some(self.objects.remove(pos))
    }

    /// Look up the node at `path`
    pub fn find_resource(&self, path: &Lwm2mPath) -> Option<NodeRef<'_>> {
        node::find(&self.objects, path)
    }

    /// Look up the node at `path` for modification
    pub fn find_resource_mut(&mut self, path: &Lwm2mPath) -> Option<NodeMut<'_>> {
        node::find_mut(&mut self.objects, path)
    }

    /// Every node of the tree as a resource table entry
    pub fn resource_entries(&self) -> Vec<ResourceEntry> {
        let mut entries = Vec::new();
        node::walk(&self.objects, &mut |node| {
            entries.push(ResourceEntry::from_node(node))
        });
        entries
    }

    /// Publish every node to the engine's resource table
    ///
    /// Runs once per registration cycle; later calls return true without
    /// touching the engine.
    pub fn create_nsdl_list_structure(&mut self) -> bool {
        if self.resources_created {
            return true;
        }
        let mut ok = true;
        for entry in self.resource_entries() {
            if !self.engine.create_resource(&entry) {
                log::warn!("Engine refused resource {}", entry.path);
                ok = false;
            }
        }
        self.resources_created = ok;
        ok
    }

    /// Registration payload in CoRE link format
    ///
    /// Lists object instances and resources, plus objects without instances.
    pub fn registration_links(&self) -> String {
        let mut links = Vec::new();
        node::walk(&self.objects, &mut |node| {
            let listed = match node {
                NodeRef::Object(object) => object.instance_count() == 0,
                NodeRef::ObjectInstance(_) | NodeRef::Resource(_) => true,
                NodeRef::ResourceInstance(_) => false,
            };
            if listed {
                links.push(ResourceEntry::from_node(node).link());
            }
        });
        links.join(",")
    }

    fn publish(&mut self, root: &Lwm2mPath) {
        for entry in self.resource_entries() {
            if entry.path.starts_with(root) && !self.engine.create_resource(&entry) {
                log::warn!("Engine refused resource {}", entry.path);
            }
        }
    }

    fn unpublish(&mut self, root: &Lwm2mPath, include_root: bool) {
        for entry in self.resource_entries() {
            if entry.path.starts_with(root) && (include_root || entry.path != *root) {
                self.engine.delete_resource(&entry.path.to_string());
            }
        }
    }

    /// Begin with Bootstrap-Request when a bootstrap server is set, otherwise Register
    pub fn start(&mut self) -> bool {
        if self.bootstrap_server.is_some() {
            self.send_bootstrap_message()
        } else {
            self.send_register_message()
        }
    }

    /// Send Register
    ///
    /// Returns true when the request went out or one is already in flight.
    pub fn send_register_message(&mut self) -> bool {
        if self.register_msg_id.is_some() {
            log::debug!("Register already in flight");
            return true;
        }
        let Some(server) = self.server else {
            log::warn!("Cannot register: no server address");
            return false;
        };
        if !self.create_nsdl_list_structure() {
            log::warn!("Cannot register: resource table incomplete");
            return false;
        }
        let links = self.registration_links();
        let msg_id = self.engine.register_endpoint(&self.params, &links, server);
        if msg_id == 0 {
            log::warn!("Register to {} could not be sent", server);
            return false;
        }
        log::info!("Registering {} with {}", self.params.endpoint_name, server);
        self.register_msg_id = Some(msg_id);
        self.state = RegistrationState::Registering;
        true
    }

    /// Send Update, optionally changing the lifetime
    pub fn send_update_registration(&mut self, lifetime: Option<u32>) -> bool {
        if self.update_msg_id.is_some() {
            log::debug!("Update already in flight");
            return true;
        }
        let (Some(server), Some(location)) = (self.server, self.location.clone()) else {
            log::warn!("Cannot update: not registered");
            return false;
        };
        if let Some(lifetime) = lifetime.filter(|l| *l > 0) {
            self.set_lifetime(lifetime);
        }
        let msg_id = self
            .engine
            .update_registration(&location, self.lifetime, server);
        if msg_id == 0 {
            log::warn!("Update to {} could not be sent", server);
            return false;
        }
        self.update_msg_id = Some(msg_id);
        self.state = RegistrationState::UpdateInProgress;
        true
    }

    /// Send De-register
    pub fn send_unregister_message(&mut self) -> bool {
        if self.unregister_msg_id.is_some() {
            log::debug!("De-register already in flight");
            return true;
        }
        let (Some(server), Some(location)) = (self.server, self.location.clone()) else {
            log::warn!("Cannot de-register: not registered");
            return false;
        };
        let msg_id = self.engine.unregister_endpoint(&location, server);
        if msg_id == 0 {
            log::warn!("De-register to {} could not be sent", server);
            return false;
        }
        self.unregister_msg_id = Some(msg_id);
        self.state = RegistrationState::Unregistering;
        true
    }

    /// Send Bootstrap-Request
    pub fn send_bootstrap_message(&mut self) -> bool {
        if self.bootstrap_msg_id.is_some() {
            log::debug!("Bootstrap already in flight");
            return true;
        }
        let Some(bootstrap_server) = self.bootstrap_server else {
            log::warn!("Cannot bootstrap: no bootstrap server address");
            return false;
        };
        let msg_id = self.engine.oma_bootstrap(&self.params, bootstrap_server);
        if msg_id == 0 {
            log::warn!("Bootstrap-Request to {} could not be sent", bootstrap_server);
            return false;
        }
        log::info!("Bootstrapping from {}", bootstrap_server);
        self.bootstrap_msg_id = Some(msg_id);
        self.state = RegistrationState::Bootstrapping;
        true
    }

    /// Handle a response to one of the client's own requests
    ///
    /// Matches the message id against the outstanding Register, Update,
    /// De-register and Bootstrap requests and fires exactly one observer
    /// callback. Empty ACK/RESET messages settle pending notifications.
    /// Returns whether the message matched anything outstanding.
    pub fn received_from_server_callback(&mut self, response: &CoapHeader, from: SocketAddr) -> bool {
        let msg_id = response.msg_id;
        let Some(code) = response.response_code() else {
            return self.settle_notification(response);
        };

        if self.register_msg_id == Some(msg_id) {
            self.register_msg_id = None;
            if code == ResponseCode::Created {
                self.location = response.location_path.clone();
                self.apply_lifetime_option(response);
                self.state = RegistrationState::Registered;
                log::info!("Registered at {:?}, lifetime {}s", self.location, self.lifetime);
                self.observer.client_registered(from);
            } else {
                self.state = RegistrationState::Idle;
                self.report_rejection(code);
            }
            return true;
        }

        if self.update_msg_id == Some(msg_id) {
            self.update_msg_id = None;
            if code.is_success() {
                self.apply_lifetime_option(response);
                self.state = RegistrationState::Registered;
                log::info!("Registration updated, lifetime {}s", self.lifetime);
                self.observer.registration_updated(from);
            } else if code.is_server_error() {
                self.state = RegistrationState::Registered;
                self.report_rejection(code);
            } else {
                self.end_registration();
                self.report_rejection(code);
            }
            return true;
        }

        if self.unregister_msg_id == Some(msg_id) {
            self.unregister_msg_id = None;
            if code.is_success() {
                self.end_registration();
                log::info!("Unregistered");
                self.observer.client_unregistered();
            } else {
                self.state = RegistrationState::Registered;
                self.report_rejection(code);
            }
            return true;
        }

        if self.bootstrap_msg_id == Some(msg_id) {
            self.bootstrap_msg_id = None;
            if code.is_success() {
                log::debug!("Bootstrap-Request accepted, awaiting Bootstrap-Finish");
            } else {
                log::warn!("Bootstrap-Request rejected with {}", code);
                self.state = RegistrationState::BootstrapError;
                self.observer.bootstrap_error();
            }
            return true;
        }

        if code.is_success() {
            log::warn!("Unexpected {} for message {}", code, msg_id);
            self.observer
                .registration_error(RegistrationError::UnexpectedResponse(code), false);
        } else {
            log::debug!("Ignoring {} for unknown message {}", code, msg_id);
        }
        false
    }

    fn report_rejection(&mut self, code: ResponseCode) {
        let retry = code.is_server_error();
        log::warn!("Server answered {} (retry: {})", code, retry);
        self.observer
            .registration_error(RegistrationError::Rejected(code), retry);
    }

    fn end_registration(&mut self) {
        if self.resources_created {
            let objects: Vec<Lwm2mPath> = self.objects.iter().map(Object::path).collect();
            for path in objects {
                self.unpublish(&path, true);
            }
        }
        self.resources_created = false;
        self.location = None;
        self.state = RegistrationState::Idle;
    }

    fn apply_lifetime_option(&mut self, response: &CoapHeader) {
        if let Some(lifetime) = response
            .lifetime_option
            .as_deref()
            .and_then(parse_lifetime)
        {
            self.set_lifetime(lifetime);
        }
    }

    fn finish_bootstrap(&mut self, request: &CoapHeader) -> CoapHeader {
        self.bootstrap_msg_id = None;
        self.state = RegistrationState::BootstrapDone;
        if let Some(server) = self.server_from_security() {
            self.server = Some(server);
        }
        log::info!("Bootstrap finished, server {:?}", self.server);
        self.observer.bootstrap_done();
        CoapHeader::response_to(request, ResponseCode::Changed)
    }

    /// Address of the first non-bootstrap Security instance
    fn server_from_security(&self) -> Option<SocketAddr> {
        let security = self.object(factory::SECURITY_OBJECT)?;
        let uri = security.instances().iter().find_map(|instance| {
            let bootstrap = instance
                .resource(factory::security::BOOTSTRAP_SERVER)
                .and_then(|r| r.resource_value().as_bool())
                .unwrap_or(false);
            if bootstrap {
                return None;
            }
            instance
                .resource(factory::security::SERVER_URI)
                .map(|r| r.value_string())
        })?;
        match resolve_uri(&uri) {
            Ok(address) => Some(address),
            Err(e) => {
                log::warn!("Security object holds unusable server URI: {}", e);
                None
            }
        }
    }

    /// Handle a request from a server and send the response
    ///
    /// RESET messages are never answered. Paths that do not resolve get 4.04.
    /// Fails only when the engine cannot send the response.
    pub fn resource_callback(&mut self, request: &CoapHeader, from: SocketAddr) -> Result<()> {
        if request.msg_type == MessageType::Reset {
            self.settle_notification(request);
            return Ok(());
        }
        let MessageCode::Request(method) = request.msg_code else {
            self.settle_notification(request);
            return Ok(());
        };

        log::debug!("{} /{} from {}", method, request.uri_path, from);
        let (response, updated) = self.handle_request(request, method, from);
        self.prune_pending_notifications();
        let sent = self.send(&response, from);

        let succeeded = response.response_code().is_some_and(ResponseCode::is_success);
        if method == Method::Post && succeeded && is_update_trigger(&request.uri_path) {
            self.send_update_registration(None);
        }
        if let Some(path) = updated {
            self.value_updated(&path);
            self.report_change(&path);
        }
        sent.map(|_| ())
    }

    fn handle_request(
        &mut self,
        request: &CoapHeader,
        method: Method,
        from: SocketAddr,
    ) -> (CoapHeader, Option<Lwm2mPath>) {
        if method == Method::Post
            && self.state == RegistrationState::Bootstrapping
            && request.uri_path.trim_matches('/') == BOOTSTRAP_FINISH_PATH
        {
            return (self.finish_bootstrap(request), None);
        }

        let Ok(path) = Lwm2mPath::parse(&request.uri_path) else {
            log::debug!("Unresolvable path /{}", request.uri_path);
            return (CoapHeader::response_to(request, ResponseCode::NotFound), None);
        };

        let missing_instance =
            path.level() == BaseType::ObjectInstance && self.find_resource(&path).is_none();
        match method {
            Method::Delete => return (self.delete_node(request, &path), None),
            Method::Post if missing_instance => return self.create_instance(request, &path),
            Method::Put if missing_instance && self.state == RegistrationState::Bootstrapping => {
                return self.bootstrap_write_instance(request, &path);
            }
            _ => {}
        }

        let Some(mut node) = node::find_mut(&mut self.objects, &path) else {
            log::debug!("No node at /{}", path);
            return (CoapHeader::response_to(request, ResponseCode::NotFound), None);
        };
        let (response, updated) = node.handle_request(request, method);

        if method == Method::Post && response.msg_code == MessageCode::Empty {
            if self.delayed_responses.iter().any(|d| d.path == path) {
                log::debug!("Delayed response for /{} superseded", path);
                self.delayed_responses.retain(|d| d.path != path);
            }
            self.delayed_responses.push(DelayedResponse {
                token: request.token.clone(),
                path: path.clone(),
                address: from,
            });
        }
        if let Some(created) = response.location_path.as_deref()
            && let Ok(created) = Lwm2mPath::parse(created)
            && self.resources_created
        {
            self.publish(&created);
        }
        (response, updated.then_some(path))
    }

    /// POST to `O/I` where the instance does not exist yet
    fn create_instance(
        &mut self,
        request: &CoapHeader,
        path: &Lwm2mPath,
    ) -> (CoapHeader, Option<Lwm2mPath>) {
        let Some(object) = self.object_mut(&path.object) else {
            return (CoapHeader::response_to(request, ResponseCode::NotFound), None);
        };
        let (response, updated) = object.handle_post_request(request, path.object_instance);
        if updated && self.resources_created {
            self.publish(path);
        }
        (response, updated.then(|| path.clone()))
    }

    /// Bootstrap-Write to an instance that does not exist yet creates it
    fn bootstrap_write_instance(
        &mut self,
        request: &CoapHeader,
        path: &Lwm2mPath,
    ) -> (CoapHeader, Option<Lwm2mPath>) {
        let Some(object) = self.object_mut(&path.object) else {
            return (CoapHeader::response_to(request, ResponseCode::NotFound), None);
        };
        let Ok(instance) = object.create_object_instance(path.object_instance) else {
            return (CoapHeader::response_to(request, ResponseCode::BadRequest), None);
        };
        let instance_id = instance.instance_id();
        let (response, updated) = instance.handle_post_request(request);
        if !updated {
            object.remove_object_instance(instance_id);
            return (response, None);
        }
        log::debug!("Bootstrap-Write created /{}", path);
        (response, Some(path.clone()))
    }

    fn delete_node(&mut self, request: &CoapHeader, path: &Lwm2mPath) -> CoapHeader {
        let allowed = match self.find_resource(path) {
            Some(node) => node.base().operation().allows(Method::Delete),
            None => return CoapHeader::response_to(request, ResponseCode::NotFound),
        };
        if !allowed {
            return CoapHeader::response_to(request, ResponseCode::MethodNotAllowed);
        }
        if self.resources_created {
            self.unpublish(path, path.level() != BaseType::Object);
        }

        let removed = match (
            self.objects.iter_mut().find(|o| o.name() == path.object),
            path.object_instance,
            path.resource.as_deref(),
            path.resource_instance,
        ) {
            (Some(object), None, _, _) => {
                let ids: Vec<u16> = object.instances().iter().map(|oi| oi.instance_id()).collect();
                for id in ids {
                    object.remove_object_instance(id);
                }
                true
            }
            (Some(object), Some(instance_id), None, _) => object.remove_object_instance(instance_id),
            (Some(object), Some(instance_id), Some(resource), None) => object
                .object_instance_mut(instance_id)
                .is_some_and(|oi| oi.remove_resource(resource)),
            (Some(object), Some(instance_id), Some(resource), Some(resource_instance)) => object
                .object_instance_mut(instance_id)
                .and_then(|oi| oi.resource_mut(resource))
                .is_some_and(|r| r.remove_resource_instance(resource_instance)),
            (None, ..) => false,
        };
        self.pending_notifications.retain(|_, p| !p.starts_with(path));

        if removed {
            log::info!("Deleted /{}", path);
            CoapHeader::response_to(request, ResponseCode::Deleted)
        } else {
            CoapHeader::response_to(request, ResponseCode::NotFound)
        }
    }

    fn send(&mut self, message: &CoapHeader, address: SocketAddr) -> Result<u16> {
        match self.engine.send_message(message, address) {
            0 => {
                log::error!("Engine failed to send {:?} to {}", message.msg_code, address);
                Err(Lwm2mError::SendFailed(format!(
                    "{:?} to {}",
                    message.msg_code, address
                )))
            }
            msg_id => Ok(msg_id),
        }
    }

    /// Route a server write at `path` to the node's value-updated callback,
    /// or to the observer when the node has none
    pub fn value_updated(&mut self, path: &Lwm2mPath) {
        let path_str = path.to_string();
        let handled = node::find_mut(&mut self.objects, path)
            .is_some_and(|mut node| node.base_mut().execute_value_updated(&path_str));
        if !handled {
            self.observer.value_updated(path);
        }
    }

    /// Set the value of a resource or resource instance from the application
    ///
    /// A change runs notification bookkeeping for the node and its observed
    /// ancestors. Returns whether the value changed.
    pub fn set_resource_value(&mut self, path: &Lwm2mPath, value: &[u8]) -> Result<bool> {
        let changed = match node::find_mut(&mut self.objects, path) {
            Some(NodeMut::Resource(resource)) if !resource.supports_multiple_instances() => {
                resource.set_value(value)
            }
            Some(NodeMut::ResourceInstance(instance)) => instance.set_value(value),
            Some(_) => {
                return Err(Lwm2mError::InvalidPath(format!(
                    "{} does not hold a value",
                    path
                )));
            }
            None => return Err(Lwm2mError::ResourceNotFound(path.to_string())),
        };
        if changed {
            self.report_change(path);
        }
        Ok(changed)
    }

    /// Feed a change at `path` to the report handlers of it and its ancestors
    fn report_change(&mut self, path: &Lwm2mPath) {
        let now = Instant::now();
        let changed_instances: Vec<u16> = path.object_instance.into_iter().collect();
        for target in path.ancestors() {
            let decision = match node::find_mut(&mut self.objects, &target) {
                Some(mut node) if node.base().is_under_observation() => {
                    let value = if target == *path {
                        node.as_ref().numeric_value()
                    } else {
                        None
                    };
                    node.base_mut().notification_update(now, value)
                }
                _ => continue,
            };
            match decision {
                ReportDecision::Send => {
                    self.observation_to_be_sent(&target, &changed_instances, false);
                }
                ReportDecision::Defer => log::debug!("Notification for /{} deferred", target),
                ReportDecision::Suppress => {}
            }
        }
    }

    /// Send a notification for the observed node at `path`
    ///
    /// For an observed object, only `changed_instances` are encoded unless the
    /// list is empty or `send_object` asks for the whole object. A payload that
    /// cannot be encoded aborts the send. Returns whether the notification went out.
    pub fn observation_to_be_sent(
        &mut self,
        path: &Lwm2mPath,
        changed_instances: &[u16],
        send_object: bool,
    ) -> bool {
        let Some(server) = self.server else {
            log::debug!("No server for notification of /{}", path);
            return false;
        };
        let Some(mut node) = node::find_mut(&mut self.objects, path) else {
            return false;
        };
        let Some(format) = node.base().observation().map(|o| o.format()) else {
            log::debug!("/{} is not under observation", path);
            return false;
        };

        let payload = match &node {
            NodeMut::Object(object)
                if !send_object
                    && !changed_instances.is_empty()
                    && format == ContentFormat::OmaTlv =>
            {
                tlv::serialize_object_instances(
                    object
                        .instances()
                        .iter()
                        .filter(|oi| changed_instances.contains(&oi.instance_id())),
                )
            }
            _ => node.as_ref().encode(format),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Notification for /{} aborted: {}", path, e);
                return false;
            }
        };

        let value = node.as_ref().numeric_value();
        let Some(observation) = node.base_mut().observation_mut() else {
            return false;
        };
        let number = observation.number();
        let message = CoapHeader {
            msg_type: MessageType::Confirmable,
            msg_code: MessageCode::Response(ResponseCode::Content),
            token: observation.token().to_vec(),
            observe: Some(u32::from(number)),
            ..CoapHeader::default()
        }
        .with_payload(payload, format);

        let msg_id = self.engine.send_message(&message, server);
        if msg_id == 0 {
            log::warn!("Notification for /{} could not be sent", path);
            observation.report_handler_mut().mark_pending();
            return false;
        }
        observation.next_number();
        observation
            .report_handler_mut()
            .notification_sent(Instant::now(), value);
        log::debug!("Notification {} for /{} sent", number, path);

        // One unacknowledged notification per path
        self.pending_notifications.retain(|_, pending| *pending != *path);
        self.pending_notifications.insert(msg_id, path.clone());
        true
    }

    /// Drop unacknowledged notifications whose observation has ended
    fn prune_pending_notifications(&mut self) {
        let objects = &self.objects;
        self.pending_notifications.retain(|_, path| {
            node::find(objects, path).is_some_and(|node| node.base().is_under_observation())
        });
    }

    /// Number of notifications still waiting for an ACK or RESET
    pub fn pending_notification_count(&self) -> usize {
        self.pending_notifications.len()
    }

    /// Clear or cancel the notification an empty ACK or RESET answers
    fn settle_notification(&mut self, message: &CoapHeader) -> bool {
        let Some(path) = self.pending_notifications.remove(&message.msg_id) else {
            return false;
        };
        if message.msg_type == MessageType::Reset {
            if let Some(mut node) = node::find_mut(&mut self.objects, &path) {
                node.base_mut().set_under_observation(false);
            }
            log::info!("Observation of /{} cancelled by RESET", path);
        }
        true
    }

    /// Paths of all nodes under observation
    pub fn observed_paths(&self) -> Vec<Lwm2mPath> {
        let mut paths = Vec::new();
        node::walk(&self.objects, &mut |node| {
            if node.base().is_under_observation() {
                paths.push(node.path());
            }
        });
        paths
    }

    /// Earliest instant a notification timer is due
    pub fn next_notification_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        node::walk(&self.objects, &mut |node| {
            if let Some(due) = node
                .base()
                .observation()
                .and_then(|o| o.report_handler().next_deadline())
            {
                deadline = Some(deadline.map_or(due, |d| d.min(due)));
            }
        });
        deadline
    }

    /// Handle an application timer
    pub fn timer_expired(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Notification => {
                self.prune_pending_notifications();
                let now = Instant::now();
                let mut due = Vec::new();
                for path in self.observed_paths() {
                    if let Some(mut node) = node::find_mut(&mut self.objects, &path)
                        && let Some(observation) = node.base_mut().observation_mut()
                        && observation.report_handler_mut().timer_expired(now)
                            == ReportDecision::Send
                    {
                        due.push(path);
                    }
                }
                for path in due {
                    self.observation_to_be_sent(&path, &[], true);
                }
            }
            TimerKind::RegistrationUpdate => {
                self.send_update_registration(None);
            }
        }
    }

    /// Send the response to a POST that was answered with an empty ACK
    pub fn complete_delayed_response(
        &mut self,
        token: &[u8],
        code: ResponseCode,
        payload: &[u8],
    ) -> Result<()> {
        let pos = self
            .delayed_responses
            .iter()
            .position(|d| d.token == token)
            .ok_or_else(|| Lwm2mError::NoPendingResponse(format!("token {:02x?}", token)))?;
        let delayed = self.delayed_responses.remove(pos);
        if let Some(NodeMut::Resource(resource)) = node::find_mut(&mut self.objects, &delayed.path)
        {
            resource.take_delayed_token();
        }

        let mut message = CoapHeader {
            msg_type: MessageType::Confirmable,
            msg_code: MessageCode::Response(code),
            token: delayed.token,
            ..CoapHeader::default()
        };
        if !payload.is_empty() {
            message = message.with_payload(payload.to_vec(), ContentFormat::TextPlain);
        }
        self.send(&message, delayed.address)?;
        log::debug!("Delayed response for /{} sent", delayed.path);
        Ok(())
    }

    /// Complete the pending POST on the resource at `path` with 2.04 and its value
    pub fn send_delayed_post_response(&mut self, path: &Lwm2mPath) -> Result<()> {
        let Some(NodeRef::Resource(resource)) = self.find_resource(path) else {
            return Err(Lwm2mError::ResourceNotFound(path.to_string()));
        };
        let token = resource
            .delayed_token()
            .ok_or_else(|| Lwm2mError::NoPendingResponse(path.to_string()))?
            .to_vec();
        let value = resource.value().to_vec();
        self.complete_delayed_response(&token, ResponseCode::Changed, &value)
    }
}

/// ASCII lifetime from the registration option; empty or zero leaves it unchanged
fn parse_lifetime(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes)
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|lifetime| *lifetime > 0)
}

/// Check if `uri_path` is a Server object's Registration Update Trigger
fn is_update_trigger(uri_path: &str) -> bool {
    Lwm2mPath::parse(uri_path).is_ok_and(|path| {
        path.object == factory::SERVER_OBJECT
            && path.resource.as_deref() == Some(factory::server::REGISTRATION_UPDATE_TRIGGER)
            && path.resource_instance.is_none()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_types::observe;
    use crate::resource_instance::ResourceType;

    #[derive(Debug, Default)]
    struct RecordingEngine {
        last_id: u16,
        fail: bool,
        registers: Vec<String>,
        updates: Vec<(String, u32)>,
        unregisters: Vec<String>,
        bootstraps: usize,
        created: Vec<String>,
        deleted: Vec<String>,
        sent: Vec<CoapHeader>,
    }

    impl RecordingEngine {
        fn next_id(&mut self) -> u16 {
            if self.fail {
                return 0;
            }
            self.last_id += 1;
            self.last_id
        }
    }

    impl CoapEngine for RecordingEngine {
        fn register_endpoint(&mut self, _: &EndpointParams, links: &str, _: SocketAddr) -> u16 {
            self.registers.push(links.to_string());
            self.next_id()
        }

        fn update_registration(&mut self, location: &str, lifetime: u32, _: SocketAddr) -> u16 {
            self.updates.push((location.to_string(), lifetime));
            self.next_id()
        }

        fn unregister_endpoint(&mut self, location: &str, _: SocketAddr) -> u16 {
            self.unregisters.push(location.to_string());
            self.next_id()
        }

        fn oma_bootstrap(&mut self, _: &EndpointParams, _: SocketAddr) -> u16 {
            self.bootstraps += 1;
            self.next_id()
        }

        fn create_resource(&mut self, entry: &ResourceEntry) -> bool {
            self.created.push(entry.path.to_string());
            true
        }

        fn delete_resource(&mut self, path: &str) -> bool {
            self.deleted.push(path.to_string());
            true
        }

        fn send_message(&mut self, message: &CoapHeader, _: SocketAddr) -> u16 {
            self.sent.push(message.clone());
            self.next_id()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Registered,
        Updated,
        Unregistered,
        Error(RegistrationError, bool),
        BootstrapDone,
        BootstrapError,
        ValueUpdated(String),
    }

    #[derive(Debug, Default)]
    struct RecordingObserver {
        events: Vec<Event>,
    }

    impl NsdlObserver for RecordingObserver {
        fn client_registered(&mut self, _: SocketAddr) {
            self.events.push(Event::Registered);
        }
        fn registration_updated(&mut self, _: SocketAddr) {
            self.events.push(Event::Updated);
        }
        fn client_unregistered(&mut self) {
            self.events.push(Event::Unregistered);
        }
        fn registration_error(&mut self, error: RegistrationError, retry: bool) {
            self.events.push(Event::Error(error, retry));
        }
        fn bootstrap_done(&mut self) {
            self.events.push(Event::BootstrapDone);
        }
        fn bootstrap_error(&mut self) {
            self.events.push(Event::BootstrapError);
        }
        fn value_updated(&mut self, path: &Lwm2mPath) {
            self.events.push(Event::ValueUpdated(path.to_string()));
        }
    }

    type TestInterface = NsdlInterface<RecordingEngine, RecordingObserver>;

    fn server() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn interface() -> TestInterface {
        let mut nsdl = NsdlInterface::new(
            RecordingEngine::default(),
            RecordingObserver::default(),
            EndpointParams::new("test-ep"),
        );
        nsdl.set_server_address(server());

        let mut object = Object::new("3303");
        object.base_mut().set_operation(Operation::GET_PUT_POST_DELETE_ALLOWED);
        let instance = object.create_object_instance(None).unwrap();
        let value = instance
            .create_dynamic_resource("5700", "Temperature", ResourceType::Float, true, false)
            .unwrap();
        value.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
        value.set_value(b"21.5");
        nsdl.add_object(object).unwrap();
        nsdl
    }

    fn created(code: ResponseCode, msg_id: u16) -> CoapHeader {
        let request = CoapHeader::request(Method::Post, "rd").with_msg_id(msg_id);
        CoapHeader::response_to(&request, code)
    }

    fn registered() -> TestInterface {
        let mut nsdl = interface();
        assert!(nsdl.send_register_message());
        let mut response = created(ResponseCode::Created, nsdl.engine().last_id);
        response.location_path = Some("rd/5a3f".into());
        nsdl.received_from_server_callback(&response, server());
        nsdl.observer_mut().events.clear();
        nsdl
    }

    #[test]
    fn test_register_flow() {
        let mut nsdl = interface();
        assert!(nsdl.send_register_message());
        assert!(nsdl.is_register_ongoing());
        assert_eq!(nsdl.state(), RegistrationState::Registering);
        assert_eq!(nsdl.engine().registers, vec!["</3303/0>,</3303/0/5700>;rt=\"Temperature\";obs"]);

        assert!(nsdl.send_register_message());
        assert_eq!(nsdl.engine().registers.len(), 1);

        let mut response = created(ResponseCode::Created, nsdl.engine().last_id);
        response.location_path = Some("rd/5a3f".into());
        response.lifetime_option = Some(b"4000".to_vec());
        assert!(nsdl.received_from_server_callback(&response, server()));

        assert_eq!(nsdl.observer().events, vec![Event::Registered]);
        assert!(!nsdl.is_register_ongoing());
        assert_eq!(nsdl.state(), RegistrationState::Registered);
        assert_eq!(nsdl.lifetime(), 4000);
        assert_eq!(nsdl.location(), Some("rd/5a3f"));
        assert_eq!(nsdl.registration_update_interval(), Duration::from_secs(3000));
    }

    #[test]
    fn test_resource_table_created_once() {
        let mut nsdl = interface();
        assert!(nsdl.create_nsdl_list_structure());
        assert_eq!(nsdl.engine().created, vec!["3303", "3303/0", "3303/0/5700"]);
        assert!(nsdl.create_nsdl_list_structure());
        assert_eq!(nsdl.engine().created.len(), 3);
    }

    #[test]
    fn test_register_send_failure() {
        let mut nsdl = interface();
        nsdl.engine_mut().fail = true;
        assert!(!nsdl.send_register_message());
        assert_eq!(nsdl.state(), RegistrationState::Idle);
        assert!(!nsdl.is_register_ongoing());
        assert!(nsdl.observer().events.is_empty());
    }

    #[test]
    fn test_register_rejections() {
        let mut nsdl = interface();
        nsdl.send_register_message();
        let response = created(ResponseCode::ServiceUnavailable, nsdl.engine().last_id);
        nsdl.received_from_server_callback(&response, server());
        nsdl.send_register_message();
        let response = created(ResponseCode::Forbidden, nsdl.engine().last_id);
        nsdl.received_from_server_callback(&response, server());

        assert_eq!(
            nsdl.observer().events,
            vec![
                Event::Error(RegistrationError::Rejected(ResponseCode::ServiceUnavailable), true),
                Event::Error(RegistrationError::Rejected(ResponseCode::Forbidden), false),
            ]
        );
        assert_eq!(nsdl.state(), RegistrationState::Idle);
    }

    #[test]
    fn test_unmatched_success_is_protocol_error() {
        let mut nsdl = registered();
        let late = created(ResponseCode::Created, 999);
        assert!(!nsdl.received_from_server_callback(&late, server()));
        assert_eq!(
            nsdl.observer().events,
            vec![Event::Error(RegistrationError::UnexpectedResponse(ResponseCode::Created), false)]
        );
        assert_eq!(nsdl.state(), RegistrationState::Registered);
    }

    #[test]
    fn test_update_and_unregister() {
        let mut nsdl = registered();
        assert!(nsdl.send_update_registration(Some(300)));
        assert!(nsdl.send_update_registration(Some(600)));
        assert_eq!(nsdl.engine().updates, vec![("rd/5a3f".to_string(), 300)]);
        assert_eq!(nsdl.state(), RegistrationState::UpdateInProgress);

        let response = created(ResponseCode::Changed, nsdl.engine().last_id);
        nsdl.received_from_server_callback(&response, server());
        assert_eq!(nsdl.state(), RegistrationState::Registered);

        assert!(nsdl.send_unregister_message());
        let response = created(ResponseCode::Deleted, nsdl.engine().last_id);
        nsdl.received_from_server_callback(&response, server());
        assert_eq!(nsdl.observer().events, vec![Event::Updated, Event::Unregistered]);
        assert_eq!(nsdl.state(), RegistrationState::Idle);
        assert_eq!(nsdl.location(), None);
        assert!(nsdl.engine().deleted.contains(&"3303/0/5700".to_string()));
    }

    #[test]
    fn test_update_requires_registration() {
        let mut nsdl = interface();
        assert!(!nsdl.send_update_registration(None));
        assert!(!nsdl.send_unregister_message());
        assert!(nsdl.engine().updates.is_empty());
    }

    #[test]
    fn test_reset_is_never_answered() {
        let mut nsdl = registered();
        let sent = nsdl.engine().sent.len();
        for path in ["3303/0/5700", "9/9"] {
            let mut request = CoapHeader::request(Method::Get, path);
            request.msg_type = MessageType::Reset;
            nsdl.resource_callback(&request, server()).unwrap();
        }
        assert_eq!(nsdl.engine().sent.len(), sent);
    }

    #[test]
    fn test_unknown_path_not_found() {
        let mut nsdl = registered();
        for path in ["9", "3303/4", "3303/0/1", "a/b"] {
            let request = CoapHeader::request(Method::Get, path);
            nsdl.resource_callback(&request, server()).unwrap();
            let response = nsdl.engine().sent.last().unwrap();
            assert_eq!(response.response_code(), Some(ResponseCode::NotFound), "{}", path);
        }
    }

    #[test]
    fn test_send_failure_is_error() {
        let mut nsdl = registered();
        nsdl.engine_mut().fail = true;
        let request = CoapHeader::request(Method::Get, "3303/0/5700");
        assert!(matches!(
            nsdl.resource_callback(&request, server()),
            Err(Lwm2mError::SendFailed(_))
        ));
    }

    #[test]
    fn test_observe_notify_and_reset() {
        let mut nsdl = registered();
        let path = Lwm2mPath::parse("3303/0/5700").unwrap();
        let request = CoapHeader::request(Method::Get, "3303/0/5700")
            .with_token(&[0xCA, 0xFE])
            .with_observe(observe::REGISTER)
            .with_accept(ContentFormat::TextPlain);
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(nsdl.engine().sent.last().unwrap().observe, Some(0));
        assert_eq!(nsdl.observed_paths(), vec![path.clone()]);

        assert!(nsdl.set_resource_value(&path, b"22.0").unwrap());
        let notification = nsdl.engine().sent.last().unwrap().clone();
        assert_eq!(notification.msg_type, MessageType::Confirmable);
        assert_eq!(notification.token, vec![0xCA, 0xFE]);
        assert_eq!(notification.observe, Some(1));
        assert_eq!(notification.payload, b"22.0");

        assert!(!nsdl.set_resource_value(&path, b"22.0").unwrap());

        let mut reset = CoapHeader::default();
        reset.msg_type = MessageType::Reset;
        reset.msg_id = nsdl.engine().last_id;
        nsdl.resource_callback(&reset, server()).unwrap();
        assert!(nsdl.observed_paths().is_empty());
    }

    #[test]
    fn test_pmin_defers_notification() {
        let mut nsdl = registered();
        let path = Lwm2mPath::parse("3303/0/5700").unwrap();
        let request = CoapHeader::request(Method::Get, "3303/0/5700")
            .with_observe(observe::REGISTER)
            .with_query("pmin=600");
        nsdl.resource_callback(&request, server()).unwrap();
        let sent = nsdl.engine().sent.len();

        nsdl.set_resource_value(&path, b"30").unwrap();
        nsdl.timer_expired(TimerKind::Notification);
        assert_eq!(nsdl.engine().sent.len(), sent);
        assert!(nsdl.next_notification_deadline().is_some());
    }

    #[test]
    fn test_object_observation_carries_changed_instance() {
        let mut nsdl = registered();
        nsdl.object_mut("3303")
            .unwrap()
            .base_mut()
            .set_observable(true);
        nsdl.object_mut("3303")
            .unwrap()
            .create_object_instance(None)
            .unwrap();
        let request = CoapHeader::request(Method::Get, "3303").with_observe(observe::REGISTER);
        nsdl.resource_callback(&request, server()).unwrap();

        let path = Lwm2mPath::parse("3303/0/5700").unwrap();
        nsdl.set_resource_value(&path, b"18").unwrap();
        let notification = nsdl.engine().sent.last().unwrap();
        assert_eq!(notification.observe, Some(1));
        let records = tlv::decode(&notification.payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 0);
    }

    #[test]
    fn test_value_updated_routing() {
        let mut nsdl = registered();
        let request = CoapHeader::request(Method::Put, "3303/0/5700")
            .with_payload(b"19.5".to_vec(), ContentFormat::TextPlain);
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(nsdl.observer().events, vec![Event::ValueUpdated("3303/0/5700".into())]);

        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        let path = Lwm2mPath::parse("3303/0/5700").unwrap();
        nsdl.find_resource_mut(&path)
            .unwrap()
            .base_mut()
            .set_value_updated_function(move |p| sink.borrow_mut().push(p.to_string()));
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(nsdl.observer().events.len(), 1);
        assert_eq!(*seen.borrow(), vec!["3303/0/5700".to_string()]);
    }

    #[test]
    fn test_delete_instance() {
        let mut nsdl = registered();
        let request = CoapHeader::request(Method::Delete, "3303/0/5700");
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(
            nsdl.engine().sent.last().unwrap().response_code(),
            Some(ResponseCode::MethodNotAllowed)
        );

        let request = CoapHeader::request(Method::Delete, "3303/0");
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(
            nsdl.engine().sent.last().unwrap().response_code(),
            Some(ResponseCode::Deleted)
        );
        assert!(nsdl.object("3303").unwrap().object_instance(0).is_none());
        assert_eq!(nsdl.engine().deleted, vec!["3303/0", "3303/0/5700"]);
    }

    #[test]
    fn test_post_creates_and_publishes_instance() {
        let mut nsdl = registered();
        let mut payload = Vec::new();
        tlv::encode_record(&mut payload, tlv::TlvType::Resource, 5700, b"5").unwrap();
        let request = CoapHeader::request(Method::Post, "3303/7")
            .with_payload(payload, ContentFormat::OmaTlv);
        nsdl.resource_callback(&request, server()).unwrap();

        let response = nsdl.engine().sent.last().unwrap();
        assert_eq!(response.response_code(), Some(ResponseCode::Created));
        assert_eq!(response.location_path.as_deref(), Some("3303/7"));
        assert!(nsdl.engine().created.contains(&"3303/7/5700".to_string()));
        assert_eq!(
            nsdl.observer().events,
            vec![Event::ValueUpdated("3303/7".into())]
        );
    }

    #[test]
    fn test_delayed_post_response() {
        let mut nsdl = registered();
        let path = Lwm2mPath::parse("3303/0/5605").unwrap();
        let object = nsdl.object_mut("3303").unwrap();
        let reset = object
            .object_instance_mut(0)
            .unwrap()
            .create_dynamic_resource("5605", "Reset", ResourceType::Opaque, false, false)
            .unwrap();
        reset.base_mut().set_operation(Operation::POST_ALLOWED);
        reset.set_delayed_response(true);

        let request = CoapHeader::request(Method::Post, "3303/0/5605")
            .with_msg_id(42)
            .with_token(&[1, 2, 3]);
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(nsdl.engine().sent.last().unwrap().msg_code, MessageCode::Empty);

        nsdl.send_delayed_post_response(&path).unwrap();
        let response = nsdl.engine().sent.last().unwrap();
        assert_eq!(response.response_code(), Some(ResponseCode::Changed));
        assert_eq!(response.token, vec![1, 2, 3]);
        assert_eq!(response.msg_type, MessageType::Confirmable);
        assert!(matches!(
            nsdl.send_delayed_post_response(&path),
            Err(Lwm2mError::NoPendingResponse(_))
        ));
    }

    #[test]
    fn test_registration_update_trigger() {
        let mut nsdl = registered();
        nsdl.add_object(factory::create_server(1, 3600, "U").unwrap())
            .unwrap();
        let request = CoapHeader::request(Method::Post, "1/0/8");
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(nsdl.engine().updates.len(), 1);
        assert!(nsdl.engine().created.contains(&"1/0/8".to_string()));
    }

    #[test]
    fn test_bootstrap_flow() {
        let mut nsdl = NsdlInterface::new(
            RecordingEngine::default(),
            RecordingObserver::default(),
            EndpointParams::new("bs-ep"),
        );
        let bootstrap_server: SocketAddr = "127.0.0.1:5783".parse().unwrap();
        nsdl.set_bootstrap_server_address(bootstrap_server);
        nsdl.add_object(factory::create_security("coap://127.0.0.1:5999", true, 0).unwrap())
            .unwrap();

        assert!(nsdl.start());
        assert_eq!(nsdl.engine().bootstraps, 1);
        let response = created(ResponseCode::Changed, nsdl.engine().last_id);
        nsdl.received_from_server_callback(&response, bootstrap_server);
        assert_eq!(nsdl.state(), RegistrationState::Bootstrapping);

        let mut payload = Vec::new();
        tlv::encode_record(&mut payload, tlv::TlvType::Resource, 0, b"coap://127.0.0.1:6000").unwrap();
        tlv::encode_record(&mut payload, tlv::TlvType::Resource, 1, b"0").unwrap();
        let write = CoapHeader::request(Method::Put, "0/1").with_payload(payload, ContentFormat::OmaTlv);
        nsdl.resource_callback(&write, bootstrap_server).unwrap();
        assert_eq!(
            nsdl.engine().sent.last().unwrap().response_code(),
            Some(ResponseCode::Changed)
        );

        let finish = CoapHeader::request(Method::Post, "bs");
        nsdl.resource_callback(&finish, bootstrap_server).unwrap();
        assert_eq!(nsdl.state(), RegistrationState::BootstrapDone);
        assert_eq!(
            nsdl.server_address(),
            Some("127.0.0.1:6000".parse().unwrap())
        );
        assert!(nsdl.observer().events.contains(&Event::BootstrapDone));
    }

    #[test]
    fn test_bootstrap_rejected() {
        let mut nsdl = interface();
        nsdl.set_bootstrap_server_address(server());
        assert!(nsdl.start());
        let response = created(ResponseCode::BadRequest, nsdl.engine().last_id);
        nsdl.received_from_server_callback(&response, server());
        assert_eq!(nsdl.state(), RegistrationState::BootstrapError);
        assert_eq!(nsdl.observer().events, vec![Event::BootstrapError]);
    }

    fn observe_temperature(nsdl: &mut TestInterface) -> Lwm2mPath {
        let request = CoapHeader::request(Method::Get, "3303/0/5700")
            .with_token(&[0xBE, 0xEF])
            .with_observe(observe::REGISTER)
            .with_accept(ContentFormat::TextPlain);
        nsdl.resource_callback(&request, server()).unwrap();
        Lwm2mPath::parse("3303/0/5700").unwrap()
    }

    #[test]
    fn test_unacknowledged_notifications_bounded() {
        let mut nsdl = registered();
        let path = observe_temperature(&mut nsdl);
        for i in 0..50 {
            nsdl.set_resource_value(&path, format!("{}.25", i).as_bytes()).unwrap();
        }
        assert_eq!(nsdl.engine().sent.last().unwrap().observe, Some(50));
        assert_eq!(nsdl.pending_notification_count(), 1);

        let cancel = CoapHeader::request(Method::Get, "3303/0/5700")
            .with_token(&[0xBE, 0xEF])
            .with_observe(observe::DEREGISTER);
        nsdl.resource_callback(&cancel, server()).unwrap();
        assert!(nsdl.observed_paths().is_empty());
        assert_eq!(nsdl.pending_notification_count(), 0);
    }

    #[test]
    fn test_cancelled_by_application_drops_pending() {
        let mut nsdl = registered();
        let path = observe_temperature(&mut nsdl);
        nsdl.set_resource_value(&path, b"25.0").unwrap();
        assert_eq!(nsdl.pending_notification_count(), 1);

        nsdl.find_resource_mut(&path)
            .unwrap()
            .base_mut()
            .set_under_observation(false);
        nsdl.timer_expired(TimerKind::Notification);
        assert_eq!(nsdl.pending_notification_count(), 0);
    }

    #[test]
    fn test_failed_notification_keeps_observation_state() {
        let mut nsdl = registered();
        let path = observe_temperature(&mut nsdl);
        let sent = nsdl.engine().sent.len();

        nsdl.engine_mut().fail = true;
        assert!(nsdl.set_resource_value(&path, b"26.0").unwrap());
        assert!(!nsdl.observation_to_be_sent(&path, &[], false));
        let observation = nsdl.find_resource(&path).unwrap().base().observation().cloned();
        assert_eq!(observation.as_ref().map(|o| o.number()), Some(1));
        assert!(observation.is_some_and(|o| o.report_handler().is_pending()));
        assert_eq!(nsdl.pending_notification_count(), 0);

        nsdl.engine_mut().fail = false;
        nsdl.timer_expired(TimerKind::Notification);
        let notification = nsdl.engine().sent.last().unwrap();
        assert_eq!(notification.observe, Some(1));
        assert_eq!(notification.payload, b"26.0");
        assert_eq!(nsdl.engine().sent.len(), sent + 3);
    }

    #[test]
    fn test_write_reported_when_response_fails() {
        let mut nsdl = registered();
        nsdl.engine_mut().fail = true;
        let request = CoapHeader::request(Method::Put, "3303/0/5700")
            .with_payload(b"30.0".to_vec(), ContentFormat::TextPlain);
        assert!(matches!(
            nsdl.resource_callback(&request, server()),
            Err(Lwm2mError::SendFailed(_))
        ));
        let path = Lwm2mPath::parse("3303/0/5700").unwrap();
        let Some(NodeRef::Resource(resource)) = nsdl.find_resource(&path) else {
            panic!("resource missing");
        };
        assert_eq!(resource.value(), b"30.0");
        assert_eq!(
            nsdl.observer().events,
            vec![Event::ValueUpdated("3303/0/5700".into())]
        );
    }

    fn add_unnamed_resource(nsdl: &mut TestInterface) {
        let label = nsdl
            .object_mut("3303")
            .unwrap()
            .object_instance_mut(0)
            .unwrap()
            .create_dynamic_resource("label", "", ResourceType::String, false, false)
            .unwrap();
        label.base_mut().set_operation(Operation::GET_ALLOWED);
        label.set_value(b"kitchen");
    }

    #[test]
    fn test_unencodable_get_not_acceptable() {
        let mut nsdl = registered();
        add_unnamed_resource(&mut nsdl);
        let request = CoapHeader::request(Method::Get, "3303/0");
        nsdl.resource_callback(&request, server()).unwrap();
        let response = nsdl.engine().sent.last().unwrap();
        assert_eq!(response.response_code(), Some(ResponseCode::NotAcceptable));
        assert!(response.payload.is_empty());
    }

    #[test]
    fn test_unencodable_notification_not_sent() {
        let mut nsdl = registered();
        let path = Lwm2mPath::parse("3303/0").unwrap();
        nsdl.find_resource_mut(&path)
            .unwrap()
            .base_mut()
            .set_observable(true);
        let request = CoapHeader::request(Method::Get, "3303/0").with_observe(observe::REGISTER);
        nsdl.resource_callback(&request, server()).unwrap();
        assert_eq!(nsdl.observed_paths(), vec![path.clone()]);

        add_unnamed_resource(&mut nsdl);
        let sent = nsdl.engine().sent.len();
        assert!(!nsdl.observation_to_be_sent(&path, &[], false));
        assert_eq!(nsdl.engine().sent.len(), sent);
        assert_eq!(nsdl.pending_notification_count(), 0);
    }

    #[test]
    fn test_second_delayed_post_supersedes_first() {
        let mut nsdl = registered();
        let path = Lwm2mPath::parse("3303/0/5605").unwrap();
        let reset = nsdl
            .object_mut("3303")
            .unwrap()
            .object_instance_mut(0)
            .unwrap()
            .create_dynamic_resource("5605", "Reset", ResourceType::Opaque, false, false)
            .unwrap();
        reset.base_mut().set_operation(Operation::POST_ALLOWED);
        reset.set_delayed_response(true);

        for token in [[1u8], [2u8]] {
            let request = CoapHeader::request(Method::Post, "3303/0/5605").with_token(&token);
            nsdl.resource_callback(&request, server()).unwrap();
        }
        assert!(matches!(
            nsdl.complete_delayed_response(&[1], ResponseCode::Changed, b""),
            Err(Lwm2mError::NoPendingResponse(_))
        ));
        nsdl.send_delayed_post_response(&path).unwrap();
        assert_eq!(nsdl.engine().sent.last().unwrap().token, vec![2]);
        assert!(matches!(
            nsdl.send_delayed_post_response(&path),
            Err(Lwm2mError::NoPendingResponse(_))
        ));
    }

    #[test]
    fn test_parse_lifetime() {
        assert_eq!(parse_lifetime(b"4000"), Some(4000));
        assert_eq!(parse_lifetime(b"0"), None);
        assert_eq!(parse_lifetime(b""), None);
        assert_eq!(parse_lifetime(b"12a"), None);
    }
}
