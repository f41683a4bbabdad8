//! Network services.
//!
//! Five services share one dispatcher: raw output, raw input, SBS
//! output, SBS input and HTTP. Outputs fan decoded frames out through
//! broadcast channels; inputs parse upstream feeds back into the same
//! processing path the demodulator uses. In passive mode everything
//! listens; with `--net-active` the two input services connect outward
//! instead, and a failed connect asks the whole process to exit.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use crate::aircraft::{AircraftStore, PositionSource, SbsUpdate};
use crate::config::Config;
use crate::crc::IcaoCache;
use crate::decoder::{self, FixOptions, ModesMessage};
use crate::http;
use crate::stats::Stats;

const BROADCAST_CAPACITY: usize = 1024;
const ACTIVE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Service identities, fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    RawOut,
    RawIn,
    SbsOut,
    SbsIn,
    Http,
}

impl Service {
    pub const ALL: [Service; 5] =
        [Service::RawOut, Service::RawIn, Service::SbsOut, Service::SbsIn, Service::Http];

    pub fn index(self) -> usize {
        match self {
            Service::RawOut => 0,
            Service::RawIn => 1,
            Service::SbsOut => 2,
            Service::SbsIn => 3,
            Service::Http => 4,
        }
    }

    pub fn descr(self) -> &'static str {
        match self {
            Service::RawOut => "Raw TCP output",
            Service::RawIn => "Raw TCP input",
            Service::SbsOut => "SBS TCP output",
            Service::SbsIn => "SBS TCP input",
            Service::Http => "HTTP server",
        }
    }
}

/// Process-wide exit request: set by the signal handler or by an
/// active-connect failure, observed by every loop.
pub struct ExitFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl ExitFlag {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn request_exit(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }

    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Re-check after registering so a request between the check
            // and the await cannot be missed.
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ExitFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// One CIDR deny rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidrRule {
    V4 { net: u32, prefix: u8 },
    V6 { net: u128, prefix: u8 },
}

impl CidrRule {
    /// Parse `a.b.c.d/len`, `addr6/len` or a bare address (full-length
    /// prefix).
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len.parse::<u8>().ok()?)),
            None => (s, None),
        };
        match addr.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return None;
                }
                Some(CidrRule::V4 {
                    net: u32::from(v4),
                    prefix,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return None;
                }
                Some(CidrRule::V6 {
                    net: u128::from(v6),
                    prefix,
                })
            }
        }
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        // IPv4-mapped IPv6 peers are matched against the v4 rules.
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => ip,
            },
            v4 => v4,
        };
        match (*self, ip) {
            (CidrRule::V4 { net, prefix }, IpAddr::V4(addr)) => {
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                (u32::from(addr) ^ net) & mask == 0
            }
            (CidrRule::V6 { net, prefix }, IpAddr::V6(addr)) => {
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
                (u128::from(addr) ^ net) & mask == 0
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DenyList {
    rules: Vec<CidrRule>,
}

impl DenyList {
    pub fn from_rules(rules: Vec<CidrRule>) -> Self {
        Self { rules }
    }

    pub fn is_denied(&self, ip: IpAddr) -> bool {
        self.rules.iter().any(|r| r.matches(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Shared state of the network layer.
pub struct NetContext {
    pub config: Config,
    pub store: Arc<RwLock<AircraftStore>>,
    pub stats: Arc<Stats>,
    pub exit: Arc<ExitFlag>,
    pub deny: DenyList,
    pub raw_tx: broadcast::Sender<String>,
    pub sbs_tx: broadcast::Sender<String>,
    /// ICAO cache for frames arriving over the network.
    icao_cache: Mutex<IcaoCache>,
    unique_ips: Mutex<[HashSet<IpAddr>; 5]>,
}

impl NetContext {
    pub fn new(
        config: Config,
        store: Arc<RwLock<AircraftStore>>,
        stats: Arc<Stats>,
        exit: Arc<ExitFlag>,
    ) -> Self {
        let deny = DenyList::from_rules(config.deny_rules.clone());
        let (raw_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (sbs_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            config,
            store,
            stats,
            exit,
            deny,
            raw_tx,
            sbs_tx,
            icao_cache: Mutex::new(IcaoCache::new()),
            unique_ips: Mutex::new(Default::default()),
        }
    }

    fn fix_options(&self) -> FixOptions {
        FixOptions {
            one_bit: self.config.fix_errors,
            two_bit: self.config.aggressive,
        }
    }
}

/// Registry update plus fan-out for one accepted frame. The registry
/// mutation and both rebroadcasts complete before the next frame is
/// processed, so clients observe frames in decode order.
pub fn process_decoded_message(ctx: &NetContext, mm: &ModesMessage, now: Instant) {
    Stats::inc(&ctx.stats.messages_total);

    let (position, source) = {
        let mut store = ctx.store.write();
        let source = store.update_from_message(mm, now);
        (store.position_of(mm.icao_address()), source)
    };
    match source {
        Some(PositionSource::Global) => Stats::inc(&ctx.stats.cpr_global_ok),
        Some(PositionSource::Local) => Stats::inc(&ctx.stats.cpr_local_ok),
        None => {}
    }

    let _ = ctx.raw_tx.send(format!("{}\n", mm.to_raw_string()));
    if let Some(line) = mm.to_sbs_string(position) {
        let _ = ctx.sbs_tx.send(line + "\r\n");
    }
}

/// Accept-time bookkeeping: unique-IP accounting always runs, then the
/// deny rules decide whether the peer gets a connection at all.
pub(crate) fn admit_client(ctx: &NetContext, service: Service, ip: IpAddr) -> bool {
    let stats = &ctx.stats.services[service.index()];

    {
        let mut sets = ctx.unique_ips.lock();
        if sets[service.index()].insert(ip) {
            Stats::inc(&stats.unique_clients);
        }
    }

    if ctx.deny.is_denied(ip) {
        Stats::inc(&stats.clients_denied);
        debug!("denied {} connection from {}", service.descr(), ip);
        return false;
    }

    if !ip.is_loopback() {
        debug!("accepted {} connection from {}", service.descr(), ip);
    }
    Stats::inc(&stats.clients_accepted);
    true
}

/// Run every enabled service until the exit flag is raised.
pub async fn run_servers(
    ctx: Arc<NetContext>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut handles = Vec::new();

    {
        let ctx = Arc::clone(&ctx);
        let port = ctx.config.net_ro_port;
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_output_server(ctx, Service::RawOut, port).await {
                error!("{}: {}", Service::RawOut.descr(), e);
            }
        }));
    }
    {
        let ctx = Arc::clone(&ctx);
        let port = ctx.config.net_sbs_port;
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_output_server(ctx, Service::SbsOut, port).await {
                error!("{}: {}", Service::SbsOut.descr(), e);
            }
        }));
    }
    {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            if let Err(e) = http::run_http_server(ctx).await {
                error!("{}: {}", Service::Http.descr(), e);
            }
        }));
    }

    if ctx.config.net_active {
        // Outward connections to the configured feeders; a feeder we
        // cannot reach is fatal because the user asked for it.
        if let Some(host) = ctx.config.host_raw_in.clone() {
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                run_active_input(ctx, Service::RawIn, host).await;
            }));
        }
        if let Some(host) = ctx.config.host_sbs_in.clone() {
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                run_active_input(ctx, Service::SbsIn, host).await;
            }));
        }
    } else {
        let ctx_tcp = Arc::clone(&ctx);
        let port = ctx.config.net_ri_port;
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_raw_input_server(ctx_tcp, port).await {
                error!("{}: {}", Service::RawIn.descr(), e);
            }
        }));
        let ctx_udp = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_raw_input_udp(ctx_udp, port).await {
                error!("Raw UDP input: {}", e);
            }
        }));
    }

    ctx.exit.wait().await;
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Generic line-broadcast output service. A client that cannot keep up
/// with the send buffer is closed instead of queueing without bound.
async fn run_output_server(
    ctx: Arc<NetContext>,
    service: Service,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("{} listening on port {}", service.descr(), port);

    let tx = match service {
        Service::SbsOut => ctx.sbs_tx.clone(),
        _ => ctx.raw_tx.clone(),
    };

    loop {
        let (mut socket, addr) = listener.accept().await?;
        if !admit_client(&ctx, service, addr.ip()) {
            let _ = socket.shutdown().await;
            continue;
        }

        let mut rx = tx.subscribe();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let stats = &ctx.stats.services[service.index()];
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if socket.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                        Stats::add(&stats.bytes_sent, line.len() as u64);
                        Stats::inc(&stats.messages_sent);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("{} client {} lagged {} messages, closing", service.descr(), addr, n);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            let _ = socket.shutdown().await;
            Stats::inc(&stats.clients_removed);
            debug!("{} client {} disconnected", service.descr(), addr);
        });
    }
}

/// Events produced by the raw input framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// A well-formed `*<hex>;` frame (hex payload only).
    Frame(String),
    /// Framed but not a valid message (bad length or non-hex).
    Invalid,
    /// A `*;` with nothing in it.
    Empty,
}

/// Buffered `*…;` stream parser. Bytes between frames are discarded; a
/// `*` always resynchronises; partial frames stay buffered until the
/// closing `;` arrives.
#[derive(Default)]
pub struct RawFramer {
    buf: Vec<u8>,
}

/// Longest acceptable frame body: 28 hex digits plus slack for
/// embedded whitespace.
const RAW_FRAME_MAX: usize = 64;

impl RawFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract at most one event, shifting the buffer past it.
    pub fn next_event(&mut self) -> Option<RawEvent> {
        loop {
            let start = self.buf.iter().position(|&b| b == b'*')?;
            // Anything between ';' and the next '*' is ignored.
            if start > 0 {
                self.buf.drain(..start);
            }

            let end = self.buf.iter().position(|&b| b == b';');
            let next_star = self.buf[1..].iter().position(|&b| b == b'*').map(|p| p + 1);

            match (end, next_star) {
                // A '*' before the terminator restarts the frame.
                (Some(end), Some(star)) if star < end => {
                    self.buf.drain(..star);
                }
                (Some(end), _) => {
                    let body: Vec<u8> = self.buf[1..end]
                        .iter()
                        .copied()
                        .filter(|b| !b.is_ascii_whitespace())
                        .collect();
                    self.buf.drain(..=end);

                    if body.is_empty() {
                        return Some(RawEvent::Empty);
                    }
                    let is_hex = body.iter().all(|b| b.is_ascii_hexdigit());
                    return if is_hex && (body.len() == 14 || body.len() == 28) {
                        Some(RawEvent::Frame(String::from_utf8(body).unwrap_or_default()))
                    } else {
                        Some(RawEvent::Invalid)
                    };
                }
                (None, Some(star)) => {
                    self.buf.drain(..star);
                }
                (None, None) => {
                    // An oversized fragment will never become a frame.
                    if self.buf.len() > RAW_FRAME_MAX {
                        self.buf.clear();
                    }
                    return None;
                }
            }
        }
    }
}

fn handle_raw_event(ctx: &NetContext, event: RawEvent) {
    match event {
        RawEvent::Frame(hex) => {
            let framed = format!("*{};", hex);
            let now = Instant::now();
            let mm = {
                let mut cache = ctx.icao_cache.lock();
                decoder::decode_hex_message(&framed, ctx.fix_options(), &mut cache, now)
            };
            match mm {
                Some(mm) if mm.crc_ok => {
                    Stats::inc(&ctx.stats.raw_good);
                    process_decoded_message(ctx, &mm, now);
                }
                _ => Stats::inc(&ctx.stats.raw_unrecognized),
            }
        }
        RawEvent::Invalid => Stats::inc(&ctx.stats.raw_unrecognized),
        RawEvent::Empty => Stats::inc(&ctx.stats.raw_empty),
    }
}

async fn run_raw_input_server(
    ctx: Arc<NetContext>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("{} listening on port {}", Service::RawIn.descr(), port);

    loop {
        let (mut socket, addr) = listener.accept().await?;
        if !admit_client(&ctx, Service::RawIn, addr.ip()) {
            let _ = socket.shutdown().await;
            continue;
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let stats_idx = Service::RawIn.index();
            let mut framer = RawFramer::new();
            let mut chunk = [0u8; 4096];
            loop {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        Stats::add(&ctx.stats.services[stats_idx].bytes_recv, n as u64);
                        framer.push(&chunk[..n]);
                        while let Some(event) = framer.next_event() {
                            handle_raw_event(&ctx, event);
                        }
                    }
                }
            }
            Stats::inc(&ctx.stats.services[stats_idx].clients_removed);
            debug!("{} client {} disconnected", Service::RawIn.descr(), addr);
        });
    }
}

/// UDP datagrams feed the same stream framer as TCP bytes; a `*`
/// resynchronises, so datagram boundaries need no special handling.
async fn run_raw_input_udp(
    ctx: Arc<NetContext>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    info!("Raw UDP input on port {}", port);

    let mut framer = RawFramer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let (n, peer) = socket.recv_from(&mut chunk).await?;
        if ctx.deny.is_denied(peer.ip()) {
            continue;
        }
        Stats::add(&ctx.stats.services[Service::RawIn.index()].bytes_recv, n as u64);
        framer.push(&chunk[..n]);
        while let Some(event) = framer.next_event() {
            handle_raw_event(&ctx, event);
        }
    }
}

/// Parse one SBS/BaseStation CSV record into a synthetic update. Only
/// `MSG` transmissions are ingested.
pub fn parse_sbs_line(line: &str) -> Option<SbsUpdate> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    if fields.len() < 11 || fields[0] != "MSG" {
        return None;
    }

    let addr = u32::from_str_radix(fields.get(4)?.trim(), 16).ok()?;
    if addr == 0 || addr > 0xFFFFFF {
        return None;
    }

    let field = |i: usize| fields.get(i).map(|s| s.trim()).filter(|s| !s.is_empty());
    Some(SbsUpdate {
        addr,
        callsign: field(10).map(|s| s.trim_end().to_string()),
        altitude: field(11).and_then(|s| s.parse().ok()),
        ground_speed: field(12).and_then(|s| s.parse().ok()),
        track: field(13).and_then(|s| s.parse().ok()),
        lat: field(14).and_then(|s| s.parse().ok()),
        lon: field(15).and_then(|s| s.parse().ok()),
        squawk: field(17).and_then(|s| s.parse().ok()),
    })
}

fn handle_sbs_line(ctx: &NetContext, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match parse_sbs_line(line) {
        Some(update) => {
            Stats::inc(&ctx.stats.sbs_good);
            let mut store = ctx.store.write();
            store.update_from_sbs(&update, Instant::now());
        }
        None => Stats::inc(&ctx.stats.sbs_unrecognized),
    }
}

/// Outward connection for `--net-active` input services. Resolution or
/// connect failure (including the 5 s timeout) raises the exit flag.
async fn run_active_input(ctx: Arc<NetContext>, service: Service, host: String) {
    info!("{} connecting to {}", service.descr(), host);

    let stream = match tokio::time::timeout(ACTIVE_CONNECT_TIMEOUT, TcpStream::connect(&host)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!("{}: connect to {} failed: {}", service.descr(), host, e);
            ctx.exit.request_exit();
            return;
        }
        Err(_) => {
            error!("{}: connect to {} timed out", service.descr(), host);
            ctx.exit.request_exit();
            return;
        }
    };

    info!("{} connected to {}", service.descr(), host);
    let stats_idx = service.index();
    let mut stream = stream;
    let mut chunk = [0u8; 4096];
    let mut framer = RawFramer::new();
    let mut line_buf = String::new();

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                Stats::add(&ctx.stats.services[stats_idx].bytes_recv, n as u64);
                match service {
                    Service::RawIn => {
                        framer.push(&chunk[..n]);
                        while let Some(event) = framer.next_event() {
                            handle_raw_event(&ctx, event);
                        }
                    }
                    _ => {
                        line_buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
                        while let Some(pos) = line_buf.find('\n') {
                            let line: String = line_buf.drain(..=pos).collect();
                            handle_sbs_line(&ctx, line.trim_end_matches(['\r', '\n']));
                        }
                    }
                }
            }
        }
    }

    error!("{}: upstream {} closed the connection", service.descr(), host);
    ctx.exit.request_exit();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_v4_matching() {
        let rule = CidrRule::parse("10.0.0.0/8").unwrap();
        assert!(rule.matches("10.1.2.3".parse().unwrap()));
        assert!(rule.matches("10.255.255.255".parse().unwrap()));
        assert!(!rule.matches("11.0.0.1".parse().unwrap()));
        assert!(!rule.matches("9.255.255.255".parse().unwrap()));

        // A bare address is an exact-match rule.
        let host = CidrRule::parse("192.168.1.5").unwrap();
        assert!(host.matches("192.168.1.5".parse().unwrap()));
        assert!(!host.matches("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn cidr_v6_matching_and_mapped_v4() {
        let rule = CidrRule::parse("2001:db8::/32").unwrap();
        assert!(rule.matches("2001:db8::1".parse().unwrap()));
        assert!(!rule.matches("2001:db9::1".parse().unwrap()));

        // An IPv4-mapped peer address hits the v4 rules.
        let v4rule = CidrRule::parse("10.0.0.0/8").unwrap();
        assert!(v4rule.matches("::ffff:10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert_eq!(CidrRule::parse("10.0.0.0/33"), None);
        assert_eq!(CidrRule::parse("not-an-ip/8"), None);
        assert_eq!(CidrRule::parse(""), None);
    }

    #[test]
    fn deny_list_any_match() {
        let deny = DenyList::from_rules(vec![
            CidrRule::parse("10.0.0.0/8").unwrap(),
            CidrRule::parse("::1").unwrap(),
        ]);
        assert!(deny.is_denied("10.1.2.3".parse().unwrap()));
        assert!(deny.is_denied("::1".parse().unwrap()));
        assert!(!deny.is_denied("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn framer_one_event_per_call() {
        let mut framer = RawFramer::new();
        framer.push(b"*8d4840d6202cc371c32ce0576098;\n*02e19718;junk");

        assert_eq!(
            framer.next_event(),
            Some(RawEvent::Frame("8d4840d6202cc371c32ce0576098".into()))
        );
        // Second frame has an invalid length (8 hex digits).
        assert_eq!(framer.next_event(), Some(RawEvent::Invalid));
        assert_eq!(framer.next_event(), None);
    }

    #[test]
    fn framer_buffers_partial_frames() {
        let mut framer = RawFramer::new();
        framer.push(b"*8d4840d6202c");
        assert_eq!(framer.next_event(), None);
        framer.push(b"c371c32ce0576098;");
        assert_eq!(
            framer.next_event(),
            Some(RawEvent::Frame("8d4840d6202cc371c32ce0576098".into()))
        );
    }

    #[test]
    fn framer_resyncs_on_star() {
        let mut framer = RawFramer::new();
        framer.push(b"garbage *noise *8d4840d6202cc371c32ce0576098;");
        // "noise " is swallowed by the resync on the second '*'.
        assert_eq!(
            framer.next_event(),
            Some(RawEvent::Frame("8d4840d6202cc371c32ce0576098".into()))
        );
    }

    #[test]
    fn framer_flags_empty_frames() {
        let mut framer = RawFramer::new();
        framer.push(b"*;*  ;");
        assert_eq!(framer.next_event(), Some(RawEvent::Empty));
        assert_eq!(framer.next_event(), Some(RawEvent::Empty));
    }

    #[test]
    fn framer_tolerates_whitespace_inside_frame() {
        let mut framer = RawFramer::new();
        framer.push(b"*8d4840d6 202cc371c32ce0576098;");
        assert_eq!(
            framer.next_event(),
            Some(RawEvent::Frame("8d4840d6202cc371c32ce0576098".into()))
        );
    }

    #[test]
    fn framer_discards_unterminated_oversize_noise() {
        let mut framer = RawFramer::new();
        framer.push(b"*");
        framer.push(&[b'f'; 100]);
        assert_eq!(framer.next_event(), None);
        // A new clean frame still gets through.
        framer.push(b"*8d4840d6202cc371c32ce0576098;");
        assert_eq!(
            framer.next_event(),
            Some(RawEvent::Frame("8d4840d6202cc371c32ce0576098".into()))
        );
    }

    #[test]
    fn sbs_msg_record_parses() {
        let line = "MSG,3,1,1,4CA7B4,1,2026/08/02,12:00:00.000,2026/08/02,12:00:00.000,BAW123,38000,450,90,51.47,-0.4543,0,4721,0,0,0,0";
        let update = parse_sbs_line(line).unwrap();
        assert_eq!(update.addr, 0x4CA7B4);
        assert_eq!(update.callsign.as_deref(), Some("BAW123"));
        assert_eq!(update.altitude, Some(38000));
        assert_eq!(update.ground_speed, Some(450.0));
        assert_eq!(update.track, Some(90.0));
        assert_eq!(update.lat, Some(51.47));
        assert_eq!(update.lon, Some(-0.4543));
        assert_eq!(update.squawk, Some(4721));
    }

    #[test]
    fn sbs_sparse_record_parses() {
        let line = "MSG,8,,,400000,,,,,,,,,,,,,,,,,";
        let update = parse_sbs_line(line).unwrap();
        assert_eq!(update.addr, 0x400000);
        assert_eq!(update.callsign, None);
        assert_eq!(update.altitude, None);
    }

    #[test]
    fn sbs_rejects_non_msg_records() {
        assert!(parse_sbs_line("SEL,,496,2286,4CA4E5,27215,...").is_none());
        assert!(parse_sbs_line("AIR,,496,2286,4CA4E5").is_none());
        assert!(parse_sbs_line("MSG,3,1,1,ZZZZZZ,1,,,,,").is_none());
        assert!(parse_sbs_line("").is_none());
    }
}
