//! LWM2M URI path resolution
//!
//! A path addresses one node of the resource tree: `Object`,
//! `Object/Instance`, `Object/Instance/Resource` or
//! `Object/Instance/Resource/ResourceInstance`.

use std::fmt;
use std::str::FromStr;

use crate::base::BaseType;
use crate::error::{Lwm2mError, Result};

/// Path to a node of the resource tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lwm2mPath {
    pub object: String,
    pub object_instance: Option<u16>,
    pub resource: Option<String>,
    pub resource_instance: Option<u16>,
}

impl Lwm2mPath {
    /// Path to an object
    pub fn object(name: &str) -> Self {
        Self {
            object: name.to_string(),
            object_instance: None,
            resource: None,
            resource_instance: None,
        }
    }

    /// Parse a '/'-delimited path like "3/0/1"
    pub fn parse(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();

        if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(Lwm2mError::InvalidPath(path.to_string()));
        }

        let id = |segment: &str| {
            segment
                .parse::<u16>()
                .map_err(|_| Lwm2mError::InvalidPath(path.to_string()))
        };

        let mut result = Self::object(parts[0]);
        if let Some(instance) = parts.get(1) {
            result.object_instance = Some(id(instance)?);
        }
        if let Some(resource) = parts.get(2) {
            result.resource = Some(resource.to_string());
        }
        if let Some(instance) = parts.get(3) {
            result.resource_instance = Some(id(instance)?);
        }
        Ok(result)
    }

    /// Extend an object path with an instance id
    pub fn instance(mut self, id: u16) -> Self {
        self.object_instance = Some(id);
        self
    }

    /// Extend an object-instance path with a resource name
    pub fn resource(mut self, name: &str) -> Self {
        self.resource = Some(name.to_string());
        self
    }

    /// Extend a resource path with a resource-instance id
    pub fn resource_instance(mut self, id: u16) -> Self {
        self.resource_instance = Some(id);
        self
    }

    /// Kind of node this path addresses
    pub fn level(&self) -> BaseType {
        match (self.object_instance, &self.resource, self.resource_instance) {
            (None, _, _) => BaseType::Object,
            (Some(_), None, _) => BaseType::ObjectInstance,
            (Some(_), Some(_), None) => BaseType::Resource,
            (Some(_), Some(_), Some(_)) => BaseType::ResourceInstance,
        }
    }

    /// Path one level up, `None` for an object path
    pub fn parent(&self) -> Option<Self> {
        let mut parent = self.clone();
        if parent.resource_instance.take().is_some() {
            return Some(parent);
        }
        if parent.resource.take().is_some() {
            return Some(parent);
        }
        if parent.object_instance.take().is_some() {
            return Some(parent);
        }
        None
    }

    /// This path followed by all of its ancestors, deepest first
    pub fn ancestors(&self) -> Vec<Self> {
        let mut paths = vec![self.clone()];
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            paths.push(path);
        }
        paths
    }

    /// Check whether `self` is `other` or lies below it
    pub fn starts_with(&self, other: &Lwm2mPath) -> bool {
        self.ancestors().contains(other)
    }
}

impl fmt::Display for Lwm2mPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object)?;
        if let Some(instance) = self.object_instance {
            write!(f, "/{}", instance)?;
        }
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        if let Some(instance) = self.resource_instance {
            write!(f, "/{}", instance)?;
        }
        Ok(())
    }
}

impl FromStr for Lwm2mPath {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
