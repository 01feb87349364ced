//! Builders for the standard LWM2M objects: Security, Server and Device

use crate::base::Operation;
use crate::error::Result;
use crate::object::Object;
use crate::object_instance::ObjectInstance;
use crate::resource_instance::ResourceType;

pub const SECURITY_OBJECT: &str = "0";
pub const SERVER_OBJECT: &str = "1";
pub const DEVICE_OBJECT: &str = "3";

/// Resource ids of the Security object
pub mod security {
    pub const SERVER_URI: &str = "0";
    pub const BOOTSTRAP_SERVER: &str = "1";
    pub const SECURITY_MODE: &str = "2";
    pub const SHORT_SERVER_ID: &str = "10";

    /// Security mode "NoSec"
    pub const MODE_NO_SEC: i64 = 3;
}

/// Resource ids of the Server object
pub mod server {
    pub const SHORT_SERVER_ID: &str = "0";
    pub const LIFETIME: &str = "1";
    pub const NOTIFICATION_STORING: &str = "6";
    pub const BINDING: &str = "7";
    pub const REGISTRATION_UPDATE_TRIGGER: &str = "8";
}

/// Resource ids of the Device object
pub mod device {
    pub const MANUFACTURER: &str = "0";
    pub const MODEL_NUMBER: &str = "1";
    pub const SERIAL_NUMBER: &str = "2";
    pub const FIRMWARE_VERSION: &str = "3";
    pub const REBOOT: &str = "4";
    pub const ERROR_CODE: &str = "11";
    pub const CURRENT_TIME: &str = "13";
    pub const BINDING: &str = "16";
}

/// Fixed identity strings of the Device object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_version: String,
}

/// Security object with one instance for `server_uri`
///
/// Writable by a bootstrap server; new instances may be created by POST.
pub fn create_security(server_uri: &str, bootstrap: bool, short_server_id: u16) -> Result<Object> {
    let mut object = Object::new(SECURITY_OBJECT);
    object.base_mut().set_operation(Operation::GET_PUT_POST_ALLOWED);
    let instance = object.create_object_instance(None)?;

    for (name, resource_type, kind) in [
        (security::SERVER_URI, "LWM2M Server URI", ResourceType::String),
        (security::BOOTSTRAP_SERVER, "Bootstrap-Server", ResourceType::Boolean),
        (security::SECURITY_MODE, "Security Mode", ResourceType::Integer),
        (security::SHORT_SERVER_ID, "Short Server ID", ResourceType::Integer),
    ] {
        instance
            .create_dynamic_resource(name, resource_type, kind, false, false)?
            .base_mut()
            .set_operation(Operation::GET_PUT_ALLOWED);
    }

    set_value(instance, security::SERVER_URI, server_uri.as_bytes());
    set_value(instance, security::BOOTSTRAP_SERVER, if bootstrap { b"1" } else { b"0" });
    set_value(
        instance,
        security::SECURITY_MODE,
        security::MODE_NO_SEC.to_string().as_bytes(),
    );
    set_value(
        instance,
        security::SHORT_SERVER_ID,
        short_server_id.to_string().as_bytes(),
    );
    Ok(object)
}

fn set_value(instance: &mut ObjectInstance, name: &str, value: &[u8]) {
    if let Some(resource) = instance.resource_mut(name) {
        resource.set_value(value);
    }
}

/// Server object with one instance
pub fn create_server(short_server_id: u16, lifetime: u32, binding: &str) -> Result<Object> {
    let mut object = Object::new(SERVER_OBJECT);
    object.base_mut().set_operation(Operation::GET_PUT_POST_ALLOWED);
    let instance = object.create_object_instance(None)?;

    instance
        .create_dynamic_resource(
            server::SHORT_SERVER_ID,
            "Short Server ID",
            ResourceType::Integer,
            false,
            false,
        )?
        .set_value_int(i64::from(short_server_id));

    let resource = instance.create_dynamic_resource(
        server::LIFETIME,
        "Lifetime",
        ResourceType::Integer,
        true,
        false,
    )?;
    resource.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
    resource.set_value_int(i64::from(lifetime));

    let resource = instance.create_dynamic_resource(
        server::NOTIFICATION_STORING,
        "Notification Storing When Disabled or Offline",
        ResourceType::Boolean,
        false,
        false,
    )?;
    resource.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
    resource.set_value(b"0");

    let resource = instance.create_dynamic_resource(
        server::BINDING,
        "Binding",
        ResourceType::String,
        false,
        false,
    )?;
    resource.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
    resource.set_value(binding.as_bytes());

    instance
        .create_dynamic_resource(
            server::REGISTRATION_UPDATE_TRIGGER,
            "Registration Update Trigger",
            ResourceType::Opaque,
            false,
            false,
        )?
        .base_mut()
        .set_operation(Operation::POST_ALLOWED);

    Ok(object)
}

/// Device object with one instance
///
/// Reboot (4) is executable without a callback; attach one with
/// [`crate::resource::Resource::set_execute_function`].
pub fn create_device(info: &DeviceInfo, binding: &str) -> Result<Object> {
    let mut object = Object::new(DEVICE_OBJECT);
    let instance = object.create_object_instance(None)?;

    for (name, resource_type, value) in [
        (device::MANUFACTURER, "Manufacturer", &info.manufacturer),
        (device::MODEL_NUMBER, "Model Number", &info.model_number),
        (device::SERIAL_NUMBER, "Serial Number", &info.serial_number),
        (device::FIRMWARE_VERSION, "Firmware Version", &info.firmware_version),
    ] {
        instance.create_static_resource(
            name,
            resource_type,
            ResourceType::String,
            value.as_bytes(),
            false,
        )?;
    }

    instance
        .create_dynamic_resource(device::REBOOT, "Reboot", ResourceType::Opaque, false, false)?
        .base_mut()
        .set_operation(Operation::POST_ALLOWED);

    instance
        .create_dynamic_resource_instance(
            device::ERROR_CODE,
            "Error Code",
            ResourceType::Integer,
            true,
            0,
        )?
        .set_value_int(0);
    if let Some(resource) = instance.resource_mut(device::ERROR_CODE) {
        resource.base_mut().set_observable(true);
    }

    let resource = instance.create_dynamic_resource(
        device::CURRENT_TIME,
        "Current Time",
        ResourceType::Time,
        true,
        false,
    )?;
    resource.base_mut().set_operation(Operation::GET_PUT_ALLOWED);
    resource.set_value_int(0);

    instance.create_static_resource(
        device::BINDING,
        "Supported Binding and Modes",
        ResourceType::String,
        binding.as_bytes(),
        false,
    )?;

    Ok(object)
}
