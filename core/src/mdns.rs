//! Multicast DNS hosted as an engine [`Protocol`].

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, PoisonError, RwLock};

use sweepr_protocols::dns::CodecError;
use sweepr_protocols::mdns::{
    self, Answer, MDNS_ADDR, MDNS_PORT, Message, RecordType, ResolutionTable,
};
use tracing::{debug, trace};

use crate::discovery::{Protocol, Transmit};
use crate::error::Result;

/// The DNS-SD meta query: every responder lists the service types it offers.
pub const DEFAULT_PROBE: &str = "_services._dns-sd._udp.local";

/// Receives every successfully parsed message together with its sender.
pub type MessageObserver = Arc<dyn Fn(SocketAddr, &Message) + Send + Sync>;

pub struct Mdns {
    table: RwLock<ResolutionTable>,
    probe: Vec<u8>,
    observer: RwLock<Option<MessageObserver>>,
}

impl Mdns {
    pub const NAME: &'static str = "mDNS";
    pub const COLOR: u32 = 0xFF000000;

    /// Probes with a PTR query for [`DEFAULT_PROBE`].
    pub fn new() -> std::result::Result<Self, CodecError> {
        Self::with_probe(DEFAULT_PROBE, RecordType::Ptr)
    }

    /// Probes broadcasts and sweeps with a `rtype` query for `name`.
    pub fn with_probe(name: &str, rtype: RecordType) -> std::result::Result<Self, CodecError> {
        Ok(Self {
            table: RwLock::new(ResolutionTable::new()),
            probe: mdns::build_outbound_packet(name, rtype)?,
            observer: RwLock::new(None),
        })
    }

    pub fn group() -> SocketAddrV4 {
        SocketAddrV4::new(MDNS_ADDR, MDNS_PORT)
    }

    /// Routes replies that carry an answer named exactly `filter` to `handler`.
    ///
    /// Replaces any handler already registered for `filter` and returns
    /// whether one was replaced.
    pub fn register_domain<F>(&self, filter: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&str, &[Answer]) + Send + Sync + 'static,
    {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(filter, handler)
    }

    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .filters()
            .map(str::to_string)
            .collect();
        filters.sort();
        filters
    }

    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(SocketAddr, &Message) + Send + Sync + 'static,
    {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Sends a single `rtype` query for `name` to the mDNS group.
    pub fn query(&self, transmit: &dyn Transmit, name: &str, rtype: RecordType) -> Result<usize> {
        let packet: Vec<u8> = mdns::build_outbound_packet(name, rtype)?;
        debug!("mDNS query for '{name}' ({rtype})");
        transmit.send_bytes(SocketAddr::V4(Self::group()), &packet)
    }

    fn dispatch(&self, answers: &[Answer]) {
        // the handler runs without the lock so it may register more filters
        let route = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .route(answers);
        if let Some(route) = route {
            trace!("mDNS answers matched '{}'", route.trigger);
            route.invoke(answers);
        }
    }
}

impl Protocol for Mdns {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn color(&self) -> u32 {
        Self::COLOR
    }

    fn multicast_group(&self) -> Option<SocketAddrV4> {
        Some(Self::group())
    }

    fn build_outbound_packet(&self, _dest: SocketAddr) -> Vec<u8> {
        self.probe.clone()
    }

    fn handle_inbound_packet(&self, from: SocketAddr, data: &[u8]) {
        let message: Message = match mdns::parse_inbound_packet(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping mDNS packet from {from}: {e}");
                return;
            }
        };

        let observer: Option<MessageObserver> = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(from, &message);
        }

        if !message.answers.is_empty() {
            self.dispatch(&message.answers);
        }
    }

    /// One PTR query per registered filter, or the default probe when none is.
    fn scan(&self, transmit: &dyn Transmit) -> Result<()> {
        let group: SocketAddr = SocketAddr::V4(Self::group());
        let filters: Vec<String> = self.filters();
        if filters.is_empty() {
            transmit.send_bytes(group, &self.probe)?;
            return Ok(());
        }
        for filter in filters {
            self.query(transmit, &filter, RecordType::Ptr)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Mdns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mdns")
            .field("filters", &self.filters())
            .field("probe_len", &self.probe.len())
            .finish()
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use sweepr_protocols::dns::{self, Header};

    /// Records what would have gone on the wire.
    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl Transmit for Capture {
        fn send_bytes(&self, dest: SocketAddr, data: &[u8]) -> Result<usize> {
            self.sent.lock().unwrap().push((dest, data.to_vec()));
            Ok(1)
        }
    }

    fn a_record_response(owner: &str, addr: [u8; 4]) -> Vec<u8> {
        let mut packet = Header {
            flags: 0x8400,
            answers: 1,
            ..Header::default()
        }
        .encode()
        .to_vec();
        packet.extend_from_slice(&dns::encode_name(owner).unwrap());
        packet.extend_from_slice(&[0x00, 0x01, 0x80, 0x01, 0, 0, 0, 120, 0, 4]);
        packet.extend_from_slice(&addr);
        packet
    }

    fn sender() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(192, 168, 1, 20), 5353))
    }

    #[test]
    fn identity_and_group() {
        let mdns = Mdns::new().unwrap();
        assert_eq!(mdns.name(), "mDNS");
        assert_eq!(mdns.color(), 0xFF000000);
        assert_eq!(
            mdns.multicast_group(),
            Some(SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 251), 5353))
        );
    }

    #[test]
    fn outbound_packet_is_the_default_probe() {
        let mdns = Mdns::new().unwrap();
        let packet = mdns.build_outbound_packet(sender());
        let questions = mdns::parse_questions(&packet).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].name, DEFAULT_PROBE);
        assert_eq!(questions[0].qtype, RecordType::Ptr);
    }

    #[test]
    fn matching_reply_invokes_handler() {
        let mdns = Mdns::new().unwrap();
        let hits: Arc<Mutex<Vec<(String, Vec<Answer>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        mdns.register_domain("printer.local", move |trigger: &str, answers: &[Answer]| {
            sink.lock().unwrap().push((trigger.to_string(), answers.to_vec()));
        });

        mdns.handle_inbound_packet(sender(), &a_record_response("printer.local", [192, 168, 1, 20]));
        mdns.handle_inbound_packet(sender(), &a_record_response("scanner.local", [192, 168, 1, 21]));

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "printer.local");
        assert_eq!(hits[0].1[0].ipv4(), Some(Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[test]
    fn handler_may_register_more_filters() {
        let mdns = Arc::new(Mdns::new().unwrap());
        let inner = Arc::downgrade(&mdns);
        mdns.register_domain("printer.local", move |_: &str, _: &[Answer]| {
            if let Some(mdns) = inner.upgrade() {
                mdns.register_domain("scanner.local", |_: &str, _: &[Answer]| {});
            }
        });

        mdns.handle_inbound_packet(sender(), &a_record_response("printer.local", [10, 0, 0, 1]));
        assert_eq!(mdns.filters(), vec!["printer.local", "scanner.local"]);
    }

    #[test]
    fn observer_sees_every_parsed_message() {
        let mdns = Mdns::new().unwrap();
        let seen: Arc<Mutex<Vec<SocketAddr>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mdns.on_message(move |from: SocketAddr, _: &Message| sink.lock().unwrap().push(from));

        mdns.handle_inbound_packet(sender(), &a_record_response("tv.local", [10, 0, 0, 2]));
        mdns.handle_inbound_packet(sender(), &[0u8; 4]);
        mdns.handle_inbound_packet(sender(), &mdns.build_outbound_packet(sender()));

        assert_eq!(*seen.lock().unwrap(), vec![sender(), sender()]);
    }

    #[test]
    fn scan_without_filters_sends_default_probe() {
        let mdns = Mdns::new().unwrap();
        let capture = Capture::default();
        mdns.scan(&capture).unwrap();

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SocketAddr::V4(Mdns::group()));
        assert_eq!(sent[0].1, mdns.build_outbound_packet(sender()));
    }

    #[test]
    fn scan_queries_every_filter() {
        let mdns = Mdns::new().unwrap();
        mdns.register_domain("_ipp._tcp.local", |_: &str, _: &[Answer]| {});
        mdns.register_domain("_http._tcp.local", |_: &str, _: &[Answer]| {});
        let capture = Capture::default();
        mdns.scan(&capture).unwrap();

        let names: Vec<String> = capture
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, packet)| mdns::parse_questions(packet).unwrap()[0].name.clone())
            .collect();
        assert_eq!(names, vec!["_http._tcp.local", "_ipp._tcp.local"]);
    }

    #[test]
    fn query_rejects_invalid_name() {
        let mdns = Mdns::new().unwrap();
        let label = "x".repeat(64);
        let err = mdns.query(&Capture::default(), &format!("{label}.local"), RecordType::A);
        assert!(matches!(err, Err(crate::EngineError::Codec(_))));
    }
}
