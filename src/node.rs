//! Resolution of LWM2M paths to nodes of the resource tree
//!
//! Dispatch on the node kind happens once, here, after which the caller works
//! with a [`NodeRef`] or [`NodeMut`] that forwards to the concrete handler.

use crate::base::Base;
use crate::coap_types::{CoapHeader, ContentFormat, Method, ResponseCode};
use crate::error::Result;
use crate::object::Object;
use crate::object_instance::ObjectInstance;
use crate::path::Lwm2mPath;
use crate::resource::Resource;
use crate::resource_instance::ResourceInstance;

/// Shared reference to any node
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Object(&'a Object),
    ObjectInstance(&'a ObjectInstance),
    Resource(&'a Resource),
    ResourceInstance(&'a ResourceInstance),
}

/// Mutable reference to any node
#[derive(Debug)]
pub enum NodeMut<'a> {
    Object(&'a mut Object),
    ObjectInstance(&'a mut ObjectInstance),
    Resource(&'a mut Resource),
    ResourceInstance(&'a mut ResourceInstance),
}

impl<'a> NodeRef<'a> {
    pub fn base(&self) -> &'a Base {
        match *self {
            Self::Object(o) => o.base(),
            Self::ObjectInstance(oi) => oi.base(),
            Self::Resource(r) => r.base(),
            Self::ResourceInstance(ri) => ri.base(),
        }
    }

    pub fn path(&self) -> Lwm2mPath {
        match self {
            Self::Object(o) => o.path(),
            Self::ObjectInstance(oi) => oi.path(),
            Self::Resource(r) => r.path(),
            Self::ResourceInstance(ri) => ri.path(),
        }
    }

    pub fn encode(&self, format: ContentFormat) -> Result<Vec<u8>> {
        match self {
            Self::Object(o) => o.encode(format),
            Self::ObjectInstance(oi) => oi.encode(format),
            Self::Resource(r) => r.encode(format),
            Self::ResourceInstance(ri) => ri.encode(format),
        }
    }

    /// Numeric reading of a leaf, used for gt/lt/st checks
    pub fn numeric_value(&self) -> Option<f64> {
        match self {
            Self::Resource(r) => r.numeric_value(),
            Self::ResourceInstance(ri) => ri.resource_value().numeric(),
            _ => None,
        }
    }
}

impl NodeMut<'_> {
    pub fn base(&self) -> &Base {
        match self {
            Self::Object(o) => o.base(),
            Self::ObjectInstance(oi) => oi.base(),
            Self::Resource(r) => r.base(),
            Self::ResourceInstance(ri) => ri.base(),
        }
    }

    pub fn base_mut(&mut self) -> &mut Base {
        match self {
            Self::Object(o) => o.base_mut(),
            Self::ObjectInstance(oi) => oi.base_mut(),
            Self::Resource(r) => r.base_mut(),
            Self::ResourceInstance(ri) => ri.base_mut(),
        }
    }

    pub fn as_ref(&self) -> NodeRef<'_> {
        match self {
            Self::Object(o) => NodeRef::Object(o),
            Self::ObjectInstance(oi) => NodeRef::ObjectInstance(oi),
            Self::Resource(r) => NodeRef::Resource(r),
            Self::ResourceInstance(ri) => NodeRef::ResourceInstance(ri),
        }
    }

    /// Run the handler for `method`
    ///
    /// Returns the response and whether the node's value was updated. DELETE
    /// needs the parent and is not handled here.
    pub fn handle_request(&mut self, request: &CoapHeader, method: Method) -> (CoapHeader, bool) {
        match (self, method) {
            (Self::Object(o), Method::Get) => (o.handle_get_request(request), false),
            (Self::ObjectInstance(oi), Method::Get) => (oi.handle_get_request(request), false),
            (Self::Resource(r), Method::Get) => (r.handle_get_request(request), false),
            (Self::ResourceInstance(ri), Method::Get) => (ri.handle_get_request(request), false),
            (Self::Object(o), Method::Put) => o.handle_put_request(request),
            (Self::ObjectInstance(oi), Method::Put) => oi.handle_put_request(request),
            (Self::Resource(r), Method::Put) => r.handle_put_request(request),
            (Self::ResourceInstance(ri), Method::Put) => ri.handle_put_request(request),
            (Self::Object(o), Method::Post) => o.handle_post_request(request, None),
            (Self::ObjectInstance(oi), Method::Post) => oi.handle_post_request(request),
            (Self::Resource(r), Method::Post) => r.handle_post_request(request),
            (Self::ResourceInstance(ri), Method::Post) => ri.handle_post_request(request),
            (_, Method::Delete) => (
                CoapHeader::response_to(request, ResponseCode::MethodNotAllowed),
                false,
            ),
        }
    }
}

/// Look up the node `path` addresses
pub fn find<'a>(objects: &'a [Object], path: &Lwm2mPath) -> Option<NodeRef<'a>> {
    let object = objects.iter().find(|o| o.name() == path.object)?;
    let Some(instance_id) = path.object_instance else {
        return Some(NodeRef::Object(object));
    };
    let instance = object.object_instance(instance_id)?;
    let Some(resource_name) = path.resource.as_deref() else {
        return Some(NodeRef::ObjectInstance(instance));
    };
    let resource = instance.resource(resource_name)?;
    let Some(resource_instance_id) = path.resource_instance else {
        return Some(NodeRef::Resource(resource));
    };
    resource
        .resource_instance(resource_instance_id)
        .map(NodeRef::ResourceInstance)
}

/// Mutable variant of [`find`]
pub fn find_mut<'a>(objects: &'a mut [Object], path: &Lwm2mPath) -> Option<NodeMut<'a>> {
    let object = objects.iter_mut().find(|o| o.name() == path.object)?;
    let Some(instance_id) = path.object_instance else {
        return Some(NodeMut::Object(object));
    };
    let instance = object.object_instance_mut(instance_id)?;
    let Some(resource_name) = path.resource.as_deref() else {
        return Some(NodeMut::ObjectInstance(instance));
    };
    let resource = instance.resource_mut(resource_name)?;
    let Some(resource_instance_id) = path.resource_instance else {
        return Some(NodeMut::Resource(resource));
    };
    resource
        .resource_instance_mut(resource_instance_id)
        .map(NodeMut::ResourceInstance)
}

/// Visit every node, parents before children
pub fn walk<'a>(objects: &'a [Object], visit: &mut impl FnMut(NodeRef<'a>)) {
    for object in objects {
        visit(NodeRef::Object(object));
        for instance in object.instances() {
            visit(NodeRef::ObjectInstance(instance));
            for resource in instance.resources() {
                visit(NodeRef::Resource(resource));
                for resource_instance in resource.resource_instances() {
                    visit(NodeRef::ResourceInstance(resource_instance));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseType;
    use crate::resource_instance::ResourceType;

    fn tree() -> Vec<Object> {
        let mut object = Object::new("3");
        let instance = object.create_object_instance(None).unwrap();
        instance
            .create_static_resource("0", "", ResourceType::String, b"Acme", false)
            .unwrap();
        instance
            .create_dynamic_resource_instance("11", "", ResourceType::Integer, false, 0)
            .unwrap();
        vec![object]
    }

    #[test]
    fn test_find_each_level() {
        let objects = tree();
        for (path, level) in [
            ("3", BaseType::Object),
            ("3/0", BaseType::ObjectInstance),
            ("3/0/0", BaseType::Resource),
            ("3/0/11/0", BaseType::ResourceInstance),
        ] {
            let path = Lwm2mPath::parse(path).unwrap();
            let node = find(&objects, &path).unwrap();
            assert_eq!(node.base().base_type(), level);
            assert_eq!(node.path(), path);
        }
    }

    #[test]
    fn test_find_missing() {
        let objects = tree();
        for path in ["4", "3/1", "3/0/5", "3/0/11/3", "3/0/0/0"] {
            assert!(find(&objects, &Lwm2mPath::parse(path).unwrap()).is_none(), "{}", path);
        }
    }

    #[test]
    fn test_walk_visits_parents_first() {
        let objects = tree();
        let mut paths = Vec::new();
        walk(&objects, &mut |node| paths.push(node.path().to_string()));
        assert_eq!(paths, vec!["3", "3/0", "3/0/0", "3/0/11", "3/0/11/0"]);
    }

    #[test]
    fn test_delete_not_dispatched_to_node() {
        let mut objects = tree();
        let path = Lwm2mPath::parse("3/0/0").unwrap();
        let mut node = find_mut(&mut objects, &path).unwrap();
        let request = CoapHeader::request(Method::Delete, "3/0/0");
        let (response, updated) = node.handle_request(&request, Method::Delete);
        assert_eq!(response.response_code(), Some(ResponseCode::MethodNotAllowed));
        assert!(!updated);
    }
}
