//! LWM2M-specific CoAP types and constants
//!
//! This module defines the parsed CoAP header exchanged with the external CoAP
//! engine. These abstractions allow the library to work with any CoAP implementation.

/// CoAP Content-Format identifiers used by LWM2M
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ContentFormat {
    /// text/plain
    TextPlain = 0,
    /// application/link-format
    LinkFormat = 40,
    /// application/octet-stream
    OctetStream = 42,
    /// application/vnd.oma.lwm2m+tlv
    OmaTlv = 99,
    /// application/vnd.oma.lwm2m+json
    OmaJson = 100,
}

impl ContentFormat {
    /// Convert from raw content-format ID
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::TextPlain),
            40 => Some(Self::LinkFormat),
            42 => Some(Self::OctetStream),
            99 => Some(Self::OmaTlv),
            100 => Some(Self::OmaJson),
            _ => None,
        }
    }

    /// Get the raw content-format ID
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Format for a leaf node: TLV, then JSON, then plain value, TLV when unspecified.
    pub(crate) fn negotiate_leaf(request: &CoapHeader) -> Self {
        match request.requested_format().and_then(Self::from_u16) {
            Some(Self::OmaJson) => Self::OmaJson,
            Some(Self::TextPlain) => Self::TextPlain,
            Some(Self::OctetStream) => Self::OctetStream,
            _ => Self::OmaTlv,
        }
    }

    /// Format for a container: TLV unless JSON was asked for and there is at most one child.
    pub(crate) fn negotiate_container(request: &CoapHeader, children: usize) -> Self {
        match request.requested_format().and_then(Self::from_u16) {
            Some(Self::OmaJson) if children <= 1 => Self::OmaJson,
            _ => Self::OmaTlv,
        }
    }
}

/// CoAP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Read
    Get,
    /// Write / Write-Attributes
    Put,
    /// Execute / Create / partial update
    Post,
    /// Delete
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Put => f.write_str("PUT"),
            Method::Post => f.write_str("POST"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

/// CoAP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

/// CoAP response codes used by LWM2M
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    // Success codes
    /// 2.01 Created
    Created,
    /// 2.02 Deleted
    Deleted,
    /// 2.04 Changed
    Changed,
    /// 2.05 Content
    Content,

    // Client error codes
    /// 4.00 Bad Request
    BadRequest,
    /// 4.01 Unauthorized
    Unauthorized,
    /// 4.03 Forbidden
    Forbidden,
    /// 4.04 Not Found
    NotFound,
    /// 4.05 Method Not Allowed
    MethodNotAllowed,
    /// 4.06 Not Acceptable
    NotAcceptable,
    /// 4.15 Unsupported Content-Format
    UnsupportedContentFormat,

    // Server error codes
    /// 5.00 Internal Server Error
    InternalServerError,
    /// 5.03 Service Unavailable
    ServiceUnavailable,
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (class, detail) = self.to_code_pair();
        write!(f, "{}.{:02}", class, detail)
    }
}

impl ResponseCode {
    /// Convert to CoAP response code format (class.detail)
    pub fn to_code_pair(self) -> (u8, u8) {
        match self {
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::Forbidden => (4, 3),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::NotAcceptable => (4, 6),
            Self::UnsupportedContentFormat => (4, 15),
            Self::InternalServerError => (5, 0),
            Self::ServiceUnavailable => (5, 3),
        }
    }

    /// Convert from a (class, detail) pair
    pub fn from_code_pair(class: u8, detail: u8) -> Option<Self> {
        match (class, detail) {
            (2, 1) => Some(Self::Created),
            (2, 2) => Some(Self::Deleted),
            (2, 4) => Some(Self::Changed),
            (2, 5) => Some(Self::Content),
            (4, 0) => Some(Self::BadRequest),
            (4, 1) => Some(Self::Unauthorized),
            (4, 3) => Some(Self::Forbidden),
            (4, 4) => Some(Self::NotFound),
            (4, 5) => Some(Self::MethodNotAllowed),
            (4, 6) => Some(Self::NotAcceptable),
            (4, 15) => Some(Self::UnsupportedContentFormat),
            (5, 0) => Some(Self::InternalServerError),
            (5, 3) => Some(Self::ServiceUnavailable),
            _ => None,
        }
    }

    /// Check if this is a success code
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Deleted | Self::Changed | Self::Content
        )
    }

    /// Check if this is a 5.xx code
    pub fn is_server_error(self) -> bool {
        self.to_code_pair().0 == 5
    }
}

/// Code field of a CoAP message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageCode {
    /// 0.00, empty ACK/RST
    #[default]
    Empty,
    Request(Method),
    Response(ResponseCode),
}

impl MessageCode {
    /// The response code, if this is a response
    pub fn response(self) -> Option<ResponseCode> {
        match self {
            Self::Response(code) => Some(code),
            _ => None,
        }
    }
}

/// Observe option values sent by the server
pub mod observe {
    /// Register an observation
    pub const REGISTER: u32 = 0;
    /// Cancel an observation
    pub const DEREGISTER: u32 = 1;
}

/// Parsed `key=value` pairs from a URI query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    pub pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse query parameters from a query string
    pub fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for part in query.split('&').filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((key, value)) => params.pairs.push((key.to_string(), value.to_string())),
                None => params.pairs.push((part.to_string(), String::new())),
            }
        }
        params
    }

    /// Value of the first occurrence of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed CoAP message (transport-agnostic)
///
/// Requests arrive from the CoAP engine in this form and responses and
/// notifications are handed back to it in the same form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoapHeader {
    pub msg_type: MessageType,
    pub msg_code: MessageCode,
    pub msg_id: u16,
    pub token: Vec<u8>,
    /// '/'-delimited, no leading slash
    pub uri_path: String,
    pub uri_query: Option<String>,
    pub content_format: Option<u16>,
    pub accept: Option<u16>,
    pub observe: Option<u32>,
    pub max_age: Option<u32>,
    pub location_path: Option<String>,
    /// Lifetime carried by a registration response, ASCII decimal
    pub lifetime_option: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl CoapHeader {
    /// Create a confirmable request
    pub fn request(method: Method, uri_path: &str) -> Self {
        Self {
            msg_code: MessageCode::Request(method),
            uri_path: uri_path.trim_start_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Create a response to `request`
    ///
    /// A confirmable request gets a piggybacked ACK with the same message id.
    pub fn response_to(request: &CoapHeader, code: ResponseCode) -> Self {
        let (msg_type, msg_id) = match request.msg_type {
            MessageType::Confirmable => (MessageType::Acknowledgement, request.msg_id),
            _ => (MessageType::NonConfirmable, 0),
        };
        Self {
            msg_type,
            msg_code: MessageCode::Response(code),
            msg_id,
            token: request.token.clone(),
            ..Self::default()
        }
    }

    /// Create an empty ACK for `request`, used to defer the real response
    pub fn empty_ack(request: &CoapHeader) -> Self {
        Self {
            msg_type: MessageType::Acknowledgement,
            msg_code: MessageCode::Empty,
            msg_id: request.msg_id,
            ..Self::default()
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Vec<u8>, format: ContentFormat) -> Self {
        self.payload = payload;
        self.content_format = Some(format.as_u16());
        self
    }

    pub fn with_msg_id(mut self, msg_id: u16) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn with_type(mut self, msg_type: MessageType) -> Self {
        self.msg_type = msg_type;
        self
    }

    pub fn with_token(mut self, token: &[u8]) -> Self {
        self.token = token.to_vec();
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.uri_query = Some(query.to_string());
        self
    }

    pub fn with_observe(mut self, observe: u32) -> Self {
        self.observe = Some(observe);
        self
    }

    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.accept = Some(format.as_u16());
        self
    }

    /// Response code, if this is a response
    pub fn response_code(&self) -> Option<ResponseCode> {
        self.msg_code.response()
    }

    /// Accept option, falling back to Content-Format
    pub fn requested_format(&self) -> Option<u16> {
        self.accept.or(self.content_format)
    }

    /// Parsed URI query
    pub fn query(&self) -> QueryParams {
        self.uri_query
            .as_deref()
            .map(QueryParams::parse)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_format_conversion() {
        assert_eq!(ContentFormat::from_u16(99), Some(ContentFormat::OmaTlv));
        assert_eq!(ContentFormat::OmaJson.as_u16(), 100);
        assert_eq!(ContentFormat::from_u16(50), None);
    }

    #[test]
    fn test_response_code() {
        assert_eq!(ResponseCode::Content.to_code_pair(), (2, 5));
        assert_eq!(ResponseCode::from_code_pair(4, 6), Some(ResponseCode::NotAcceptable));
        assert!(ResponseCode::Changed.is_success());
        assert!(!ResponseCode::NotFound.is_success());
        assert!(ResponseCode::ServiceUnavailable.is_server_error());
        assert_eq!(ResponseCode::MethodNotAllowed.to_string(), "4.05");
    }

    #[test]
    fn test_query_params_parse() {
        let params = QueryParams::parse("pmax=200&pmin=120&cancel");
        assert_eq!(params.get("pmin"), Some("120"));
        assert_eq!(params.get("pmax"), Some("200"));
        assert_eq!(params.get("cancel"), Some(""));
        assert_eq!(params.get("gt"), None);
    }

    #[test]
    fn test_response_to_confirmable() {
        let request = CoapHeader::request(Method::Get, "/3/0")
            .with_msg_id(42)
            .with_token(&[1, 2]);
        assert_eq!(request.uri_path, "3/0");

        let response = CoapHeader::response_to(&request, ResponseCode::Content);
        assert_eq!(response.msg_type, MessageType::Acknowledgement);
        assert_eq!(response.msg_id, 42);
        assert_eq!(response.token, vec![1, 2]);
        assert_eq!(response.response_code(), Some(ResponseCode::Content));
    }

    #[test]
    fn test_response_to_non_confirmable() {
        let request = CoapHeader::request(Method::Get, "3")
            .with_type(MessageType::NonConfirmable)
            .with_msg_id(7);
        let response = CoapHeader::response_to(&request, ResponseCode::Content);
        assert_eq!(response.msg_type, MessageType::NonConfirmable);
        assert_eq!(response.msg_id, 0);
    }

    #[test]
    fn test_negotiate_formats() {
        let plain = CoapHeader::request(Method::Get, "3/0/0").with_accept(ContentFormat::TextPlain);
        assert_eq!(ContentFormat::negotiate_leaf(&plain), ContentFormat::TextPlain);

        let unspecified = CoapHeader::request(Method::Get, "3/0/0");
        assert_eq!(ContentFormat::negotiate_leaf(&unspecified), ContentFormat::OmaTlv);

        let json = CoapHeader::request(Method::Get, "3/0").with_accept(ContentFormat::OmaJson);
        assert_eq!(ContentFormat::negotiate_container(&json, 1), ContentFormat::OmaJson);
        assert_eq!(ContentFormat::negotiate_container(&json, 2), ContentFormat::OmaTlv);
    }
}
