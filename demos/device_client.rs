//! LWM2M device client over UDP
//!
//! Usage:
//!   cargo run --example device_client -- --server coap://127.0.0.1:5683 [--endpoint my-device]
//!   cargo run --example device_client -- --config client.json [--verbose]
//!

use clap::Parser;
use coap_lite::{CoapOption, MessageClass, MessageType as CoapMessageType, Packet, RequestType};
use lwm2m_client::coap_types::{CoapHeader, MessageCode, MessageType, Method, ResponseCode};
use lwm2m_client::factory::{self, DeviceInfo};
use lwm2m_client::{
    ClientConfig, CoapEngine, EndpointParams, Lwm2mPath, NsdlInterface, NsdlObserver,
    RegistrationError, ResourceEntry, TimerKind,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const LINK_FORMAT: u32 = 40;
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "lwm2m-device")]
#[command(about = "LWM2M device client - register a Device object with an LWM2M server")]
struct Args {
    /// Client configuration file (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// LWM2M server URI
    #[arg(short, long, default_value = "coap://127.0.0.1:5683")]
    server: String,

    /// Endpoint client name
    #[arg(short, long, default_value = "rust-lwm2m-device")]
    endpoint: String,

    /// Registration lifetime in seconds
    #[arg(short, long, default_value = "300")]
    lifetime: u32,

    /// Local UDP port
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// CoAP engine sending over a UDP socket
struct UdpEngine {
    socket: UdpSocket,
    message_id: u16,
    verbose: bool,
}

impl UdpEngine {
    fn next_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1).max(1);
        self.message_id
    }

    fn send_request(
        &mut self,
        method: RequestType,
        path: &str,
        query: &str,
        payload: Vec<u8>,
        to: SocketAddr,
    ) -> u16 {
        let id = self.next_id();
        let mut packet = Packet::new();
        packet.header.set_type(CoapMessageType::Confirmable);
        packet.header.message_id = id;
        packet.header.code = MessageClass::Request(method);
        packet.set_token(id.to_be_bytes().to_vec());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        for pair in query.split('&').filter(|s| !s.is_empty()) {
            packet.add_option(CoapOption::UriQuery, pair.as_bytes().to_vec());
        }
        if !payload.is_empty() {
            packet.add_option(CoapOption::ContentFormat, encode_uint(LINK_FORMAT));
            packet.payload = payload;
        }
        self.transmit(&packet, to)
    }

    fn transmit(&mut self, packet: &Packet, to: SocketAddr) -> u16 {
        let bytes = match packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("  ✗ Cannot encode packet: {:?}", e);
                return 0;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to) {
            eprintln!("  ✗ Send to {} failed: {}", to, e);
            return 0;
        }
        if self.verbose {
            println!("  → {:?} #{} ({} bytes)", packet.header.code, packet.header.message_id, bytes.len());
        }
        packet.header.message_id
    }
}

impl CoapEngine for UdpEngine {
    fn register_endpoint(&mut self, params: &EndpointParams, links: &str, server: SocketAddr) -> u16 {
        self.send_request(
            RequestType::Post,
            "rd",
            &params.registration_query(),
            links.as_bytes().to_vec(),
            server,
        )
    }

    fn update_registration(&mut self, location: &str, lifetime: u32, server: SocketAddr) -> u16 {
        self.send_request(
            RequestType::Post,
            location,
            &format!("lt={}", lifetime),
            Vec::new(),
            server,
        )
    }

    fn unregister_endpoint(&mut self, location: &str, server: SocketAddr) -> u16 {
        self.send_request(RequestType::Delete, location, "", Vec::new(), server)
    }

    fn oma_bootstrap(&mut self, params: &EndpointParams, bootstrap_server: SocketAddr) -> u16 {
        let query = format!("ep={}", params.endpoint_name);
        self.send_request(RequestType::Post, "bs", &query, Vec::new(), bootstrap_server)
    }

    fn create_resource(&mut self, entry: &ResourceEntry) -> bool {
        if self.verbose {
            println!("  + {}", entry.link());
        }
        true
    }

    fn delete_resource(&mut self, path: &str) -> bool {
        if self.verbose {
            println!("  - </{}>", path);
        }
        true
    }

    fn send_message(&mut self, message: &CoapHeader, address: SocketAddr) -> u16 {
        let mut message = message.clone();
        if message.msg_id == 0 {
            message.msg_id = self.next_id();
        }
        self.transmit(&to_packet(&message), address)
    }
}

/// Observer printing registration events
#[derive(Default)]
struct ConsoleObserver {
    retry_at: Option<Instant>,
    next_update: Option<Instant>,
    update_interval: Duration,
}

impl NsdlObserver for ConsoleObserver {
    fn client_registered(&mut self, server: SocketAddr) {
        println!("✓ Registered with {}", server);
        self.next_update = Some(Instant::now() + self.update_interval);
    }

    fn registration_updated(&mut self, server: SocketAddr) {
        println!("✓ Registration updated with {}", server);
        self.next_update = Some(Instant::now() + self.update_interval);
    }

    fn client_unregistered(&mut self) {
        println!("✓ Unregistered");
        self.next_update = None;
    }

    fn registration_error(&mut self, error: RegistrationError, retry: bool) {
        println!("✗ Registration error: {} (retry: {})", error, retry);
        if retry {
            self.retry_at = Some(Instant::now() + RETRY_DELAY);
        }
    }

    fn bootstrap_done(&mut self) {
        println!("✓ Bootstrap finished");
        self.retry_at = Some(Instant::now());
    }

    fn bootstrap_error(&mut self) {
        println!("✗ Bootstrap failed");
    }

    fn value_updated(&mut self, path: &Lwm2mPath) {
        println!("  Server wrote /{}", path);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => {
            let config = ClientConfig {
                lifetime: Some(args.lifetime),
                binding: Some("U".into()),
                server_uri: Some(args.server.clone()),
                ..ClientConfig::new(&args.endpoint)
            };
            config.validate()?;
            config
        }
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              LWM2M Device Client                             ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let socket = UdpSocket::bind(("0.0.0.0", args.port))?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    println!("Endpoint:  {}", config.endpoint_name);
    println!("Server:    {}", config.server_uri.as_deref().unwrap_or("-"));
    println!("Local:     {}", socket.local_addr()?);

    let engine = UdpEngine {
        socket: socket.try_clone()?,
        message_id: 0,
        verbose: args.verbose,
    };
    let mut nsdl = NsdlInterface::from_config(engine, ConsoleObserver::default(), &config)?;
    nsdl.observer_mut().update_interval = nsdl.registration_update_interval();

    let info = DeviceInfo {
        manufacturer: "lwm2m-client".into(),
        model_number: "demo".into(),
        serial_number: std::process::id().to_string(),
        firmware_version: env!("CARGO_PKG_VERSION").into(),
    };
    let mut device = factory::create_device(&info, "U")?;
    if let Some(reboot) = device
        .object_instance_mut(0)
        .and_then(|oi| oi.resource_mut(factory::device::REBOOT))
    {
        reboot.set_execute_function(|_| println!("  Reboot requested (ignored by demo)"));
    }
    nsdl.add_object(device)?;
    let lifetime = nsdl.lifetime();
    nsdl.add_object(factory::create_server(1, lifetime, "U")?)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\n\nReceived Ctrl+C, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    println!("\n────────────────────────────────────────────────────────────────");
    if !nsdl.start() {
        println!("✗ Could not send the first request");
    }

    let current_time = Lwm2mPath::parse("3/0/13")?;
    let mut buf = [0u8; 1500];
    let mut last_tick = Instant::now();

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => handle_datagram(&mut nsdl, &buf[..len], src, args.verbose),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let now = Instant::now();
        if now.duration_since(last_tick) >= Duration::from_secs(1) {
            last_tick = now;
            let secs = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
            nsdl.set_resource_value(&current_time, secs.to_string().as_bytes())?;
        }
        if nsdl.next_notification_deadline().is_some_and(|d| d <= now) {
            nsdl.timer_expired(TimerKind::Notification);
        }
        if nsdl.observer().next_update.is_some_and(|t| t <= now) {
            nsdl.observer_mut().next_update = None;
            nsdl.timer_expired(TimerKind::RegistrationUpdate);
        }
        if nsdl.observer().retry_at.is_some_and(|t| t <= now) {
            nsdl.observer_mut().retry_at = None;
            nsdl.send_register_message();
        }
    }

    if nsdl.is_registered() && nsdl.send_unregister_message() {
        let deadline = Instant::now() + Duration::from_secs(2);
        while nsdl.is_registered() && Instant::now() < deadline {
            if let Ok((len, src)) = socket.recv_from(&mut buf) {
                handle_datagram(&mut nsdl, &buf[..len], src, args.verbose);
            }
        }
    }
    println!("────────────────────────────────────────────────────────────────");
    Ok(())
}

fn handle_datagram(
    nsdl: &mut NsdlInterface<UdpEngine, ConsoleObserver>,
    bytes: &[u8],
    src: SocketAddr,
    verbose: bool,
) {
    let Ok(packet) = Packet::from_bytes(bytes) else {
        return;
    };
    let Some(header) = from_packet(&packet) else {
        return;
    };
    if verbose {
        println!(
            "[{}] {:?} /{} #{} ({} bytes)",
            src,
            header.msg_code,
            header.uri_path,
            header.msg_id,
            header.payload.len()
        );
    }
    match header.msg_code {
        MessageCode::Request(_) => {
            if let Err(e) = nsdl.resource_callback(&header, src) {
                eprintln!("  ✗ {}", e);
            }
        }
        MessageCode::Response(_) | MessageCode::Empty => {
            if header.msg_type == MessageType::Reset {
                let _ = nsdl.resource_callback(&header, src);
            } else {
                nsdl.received_from_server_callback(&header, src);
            }
        }
    }
}

fn from_packet(packet: &Packet) -> Option<CoapHeader> {
    let msg_code = match packet.header.code {
        MessageClass::Empty => MessageCode::Empty,
        MessageClass::Request(RequestType::Get) => MessageCode::Request(Method::Get),
        MessageClass::Request(RequestType::Put) => MessageCode::Request(Method::Put),
        MessageClass::Request(RequestType::Post) => MessageCode::Request(Method::Post),
        MessageClass::Request(RequestType::Delete) => MessageCode::Request(Method::Delete),
        MessageClass::Response(_) => {
            let code = u8::from(packet.header.code);
            MessageCode::Response(ResponseCode::from_code_pair(code >> 5, code & 0x1F)?)
        }
        _ => return None,
    };
    let msg_type = match packet.header.get_type() {
        CoapMessageType::Confirmable => MessageType::Confirmable,
        CoapMessageType::NonConfirmable => MessageType::NonConfirmable,
        CoapMessageType::Acknowledgement => MessageType::Acknowledgement,
        CoapMessageType::Reset => MessageType::Reset,
    };

    let joined = |option: CoapOption, separator: &str| {
        packet.get_option(option).map(|values| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect::<Vec<_>>()
                .join(separator)
        })
    };
    let uint = |option: CoapOption| {
        packet
            .get_option(option)
            .and_then(|values| values.front())
            .map(|v| decode_uint(v))
    };

    Some(CoapHeader {
        msg_type,
        msg_code,
        msg_id: packet.header.message_id,
        token: packet.get_token().to_vec(),
        uri_path: joined(CoapOption::UriPath, "/").unwrap_or_default(),
        uri_query: joined(CoapOption::UriQuery, "&"),
        content_format: uint(CoapOption::ContentFormat).map(|v| v as u16),
        accept: uint(CoapOption::Accept).map(|v| v as u16),
        observe: uint(CoapOption::Observe),
        max_age: uint(CoapOption::MaxAge),
        location_path: joined(CoapOption::LocationPath, "/"),
        lifetime_option: None,
        payload: packet.payload.clone(),
    })
}

fn to_packet(header: &CoapHeader) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(match header.msg_type {
        MessageType::Confirmable => CoapMessageType::Confirmable,
        MessageType::NonConfirmable => CoapMessageType::NonConfirmable,
        MessageType::Acknowledgement => CoapMessageType::Acknowledgement,
        MessageType::Reset => CoapMessageType::Reset,
    });
    packet.header.message_id = header.msg_id;
    packet.header.code = match header.msg_code {
        MessageCode::Empty => MessageClass::Empty,
        MessageCode::Request(method) => MessageClass::Request(match method {
            Method::Get => RequestType::Get,
            Method::Put => RequestType::Put,
            Method::Post => RequestType::Post,
            Method::Delete => RequestType::Delete,
        }),
        MessageCode::Response(code) => {
            let (class, detail) = code.to_code_pair();
            MessageClass::from((class << 5) | detail)
        }
    };
    packet.set_token(header.token.clone());
    if let Some(observe) = header.observe {
        packet.add_option(CoapOption::Observe, encode_uint(observe));
    }
    if let Some(location) = &header.location_path {
        for segment in location.split('/').filter(|s| !s.is_empty()) {
            packet.add_option(CoapOption::LocationPath, segment.as_bytes().to_vec());
        }
    }
    if let Some(format) = header.content_format {
        packet.add_option(CoapOption::ContentFormat, encode_uint(u32::from(format)));
    }
    if let Some(max_age) = header.max_age {
        packet.add_option(CoapOption::MaxAge, encode_uint(max_age));
    }
    packet.payload = header.payload.clone();
    packet
}

/// Minimal big-endian encoding of a CoAP uint option
fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0, |acc, b| (acc << 8) | u32::from(*b))
}
