//! lwm2m-client - LWM2M client engine
//!
//! This library keeps an LWM2M resource tree (Object / Object Instance /
//! Resource / Resource Instance), answers CoAP requests against it with OMA TLV,
//! OMA JSON or plain-text payloads, tracks observations, and drives the
//! Register / Update / De-register / Bootstrap exchanges with an LWM2M server
//! through an external CoAP engine.
//!
//! # Example
//!
//! ```no_run
//! use lwm2m_client::{ClientConfig, CoapEngine, NsdlInterface, NsdlObserver};
//! use lwm2m_client::factory::{self, DeviceInfo};
//! # fn run<E: CoapEngine, O: NsdlObserver>(engine: E, observer: O) -> lwm2m_client::Result<()> {
//!
//! let config = ClientConfig::from_file("client.json")?;
//! let mut nsdl = NsdlInterface::from_config(engine, observer, &config)?;
//!
//! nsdl.add_object(factory::create_device(&DeviceInfo::default(), "U")?)?;
//! nsdl.start();
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod coap_types;
pub mod config;
mod error;
pub mod factory;
pub mod json;
pub mod node;
pub mod nsdl;
pub mod object;
pub mod object_instance;
pub mod path;
pub mod report_handler;
pub mod resource;
pub mod resource_instance;
pub mod tlv;

pub use base::{Base, BaseType, Mode, Operation};
pub use config::{ClientConfig, EndpointParams};
pub use error::{DecodeError, Lwm2mError, RegistrationError, Result};
pub use node::{NodeMut, NodeRef};
pub use nsdl::{CoapEngine, NsdlInterface, NsdlObserver, RegistrationState, ResourceEntry, TimerKind};
pub use object::Object;
pub use object_instance::ObjectInstance;
pub use path::Lwm2mPath;
pub use report_handler::{NotificationAttributes, ReportDecision, ReportHandler};
pub use resource::Resource;
pub use resource_instance::{ResourceInstance, ResourceType, ResourceValue};
