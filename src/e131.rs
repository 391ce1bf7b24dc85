//! sACN (ANSI E1.31) frame encoding and per-universe dispatch
//!
//! Each dispatch partitions the parameter state into one DMX frame per
//! universe referenced by the mapping and multicasts it to the universe's
//! standard group (`239.255.<hi>.<lo>:5568`). Sends are best effort: a frame
//! that cannot be delivered is dropped, never retried, and the universe's
//! sequence number still advances.

use crate::types::{Config, ParameterState, UniverseId, UNIVERSE_SIZE};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use uuid::Uuid;

/// sACN UDP port
pub const PORT: u16 = 5568;

/// Size of a full-universe data packet
pub const FRAME_SIZE: usize = 126 + UNIVERSE_SIZE;

/// Default source name announced in the framing layer
pub const DEFAULT_SOURCE_NAME: &str = "penumbra";

const ACN_PACKET_IDENTIFIER: [u8; 12] = [
    0x41, 0x53, 0x43, 0x2d, 0x45, 0x31, 0x2e, 0x31, 0x37, 0x00, 0x00, 0x00,
];

const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;

const ROOT_PDU_OFFSET: usize = 16;
const FRAMING_LAYER_OFFSET: usize = 38;
const DMP_LAYER_OFFSET: usize = 114;
const SOURCE_NAME_LEN: usize = 64;
const PRIORITY: u8 = 100;

/// DMX levels for one universe
pub type UniverseFrame = [u8; UNIVERSE_SIZE];

/// Quantize a normalized value to a DMX level
///
/// Values are clamped to `[0, 1]` and rounded half away from zero, so 0.5
/// maps to 128. NaN maps to 0.
pub fn to_dmx(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Standard multicast group for a universe
pub fn multicast_addr(universe: UniverseId) -> SocketAddrV4 {
    let [hi, lo] = universe.to_be_bytes();
    SocketAddrV4::new(Ipv4Addr::new(239, 255, hi, lo), PORT)
}

/// Partition state into one frame per universe referenced by the mapping
///
/// Parameters without a mapping are skipped. A mapped channel outside
/// `1..=512` still marks its universe as touched but writes no slot.
pub fn build_universes(state: &ParameterState, config: &Config) -> BTreeMap<UniverseId, UniverseFrame> {
    let mut universes = BTreeMap::new();
    for (name, value) in state {
        let Some(mapping) = config.mapping(name) else {
            continue;
        };
        let frame = universes
            .entry(mapping.universe)
            .or_insert([0u8; UNIVERSE_SIZE]);
        if let Some(slot) = mapping.slot() {
            frame[slot] = to_dmx(*value);
        }
    }
    universes
}

/// Component identifier for one sender instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cid(Uuid);

impl Cid {
    /// Random v4 CID, or a fixed sequence if the OS has no randomness to give
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        match getrandom::getrandom(&mut bytes) {
            Ok(()) => Self(uuid::Builder::from_random_bytes(bytes).into_uuid()),
            Err(e) => {
                tracing::warn!("No randomness for CID ({}), using fixed CID", e);
                Self::fallback()
            }
        }
    }

    fn fallback() -> Self {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        Self(Uuid::from_bytes(bytes))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Build a full-universe E1.31 data packet
pub fn build_frame(
    universe: UniverseId,
    dmx: &UniverseFrame,
    sequence: u8,
    cid: &Cid,
    source_name: &str,
) -> Vec<u8> {
    let mut buf = vec![0u8; FRAME_SIZE];

    // Root layer
    put_u16(&mut buf, 0, 0x0010); // preamble size
    put_u16(&mut buf, 2, 0x0000); // postamble size
    buf[4..16].copy_from_slice(&ACN_PACKET_IDENTIFIER);
    put_u16(&mut buf, ROOT_PDU_OFFSET, flags_and_length(ROOT_PDU_OFFSET));
    put_u32(&mut buf, 18, VECTOR_ROOT_E131_DATA);
    buf[22..38].copy_from_slice(cid.as_bytes());

    // Framing layer
    put_u16(&mut buf, FRAMING_LAYER_OFFSET, flags_and_length(FRAMING_LAYER_OFFSET));
    put_u32(&mut buf, 40, VECTOR_E131_DATA_PACKET);
    buf[44..44 + SOURCE_NAME_LEN].copy_from_slice(&encode_source_name(source_name));
    buf[108] = PRIORITY;
    put_u16(&mut buf, 109, 0); // synchronization address
    buf[111] = sequence;
    buf[112] = 0; // options
    put_u16(&mut buf, 113, universe); // low byte is overlapped by the DMP flags/length

    // DMP layer
    put_u16(&mut buf, DMP_LAYER_OFFSET, flags_and_length(DMP_LAYER_OFFSET));
    buf[116] = VECTOR_DMP_SET_PROPERTY;
    buf[117] = 0xa1; // address type and data type
    put_u16(&mut buf, 118, 0x0000); // first property address
    put_u16(&mut buf, 120, 0x0001); // address increment
    put_u16(&mut buf, 122, UNIVERSE_SIZE as u16 + 1); // property count
    buf[124] = 0x00; // DMX start code
    buf[125..125 + UNIVERSE_SIZE].copy_from_slice(dmx);

    buf
}

/// PDU flags (0x7) and the length from `pdu_start` to the end of the frame
fn flags_and_length(pdu_start: usize) -> u16 {
    0x7000 | (FRAME_SIZE - pdu_start) as u16
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Zero-padded, at most 63 bytes so the field stays NUL-terminated
fn encode_source_name(name: &str) -> [u8; SOURCE_NAME_LEN] {
    let mut field = [0u8; SOURCE_NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(SOURCE_NAME_LEN - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Where finished frames go
pub trait Transport {
    /// Send one frame; the dispatcher ignores the outcome beyond logging it
    fn send(&mut self, target: SocketAddr, frame: &[u8]) -> io::Result<()>;
}

/// UDP multicast transport
///
/// One unbound non-blocking socket is shared by every universe. A socket that
/// fails to open or to send is discarded and reopened on the next send.
#[derive(Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open_socket() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Transport for UdpTransport {
    fn send(&mut self, target: SocketAddr, frame: &[u8]) -> io::Result<()> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => open_socket()?,
        };
        socket.send_to(frame, target)?;
        self.socket = Some(socket);
        Ok(())
    }
}

/// Encodes parameter state into universe frames and sends them
///
/// Sequence counters are owned by the dispatcher: one wrapping 8-bit counter
/// per universe, advanced on every send attempt.
pub struct Dispatcher<T = UdpTransport> {
    transport: T,
    sequences: HashMap<UniverseId, u8>,
    cid: Cid,
    source_name: String,
}

impl Dispatcher<UdpTransport> {
    /// Dispatcher sending over UDP multicast with a fresh CID
    pub fn new() -> Self {
        Self::with_transport(UdpTransport::new())
    }
}

impl Default for Dispatcher<UdpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Dispatcher<T> {
    /// Dispatcher using a custom transport
    pub fn with_transport(transport: T) -> Self {
        let cid = Cid::generate();
        tracing::info!("sACN sender CID {}", cid);
        Self {
            transport,
            sequences: HashMap::new(),
            cid,
            source_name: DEFAULT_SOURCE_NAME.to_string(),
        }
    }

    /// Override the source name announced in every frame
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send one frame per universe touched by `state`
    pub fn dispatch(&mut self, state: &ParameterState, config: &Config) {
        for (universe, dmx) in build_universes(state, config) {
            let sequence = self.next_sequence(universe);
            let frame = build_frame(universe, &dmx, sequence, &self.cid, &self.source_name);
            let target = SocketAddr::V4(multicast_addr(universe));
            if let Err(e) = self.transport.send(target, &frame) {
                tracing::debug!("Dropped frame for universe {} (seq {}): {}", universe, sequence, e);
            }
        }
    }

    fn next_sequence(&mut self, universe: UniverseId) -> u8 {
        let sequence = self.sequences.entry(universe).or_insert(0);
        *sequence = sequence.wrapping_add(1);
        *sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterMapping;

    #[derive(Default)]
    struct Recording {
        sent: Vec<(SocketAddr, Vec<u8>)>,
    }

    impl Transport for Recording {
        fn send(&mut self, target: SocketAddr, frame: &[u8]) -> io::Result<()> {
            self.sent.push((target, frame.to_vec()));
            Ok(())
        }
    }

    struct Failing {
        attempts: usize,
    }

    impl Transport for Failing {
        fn send(&mut self, _target: SocketAddr, _frame: &[u8]) -> io::Result<()> {
            self.attempts += 1;
            Err(io::Error::new(io::ErrorKind::Other, "network unreachable"))
        }
    }

    fn config(mappings: &[(&str, u16, u16)]) -> Config {
        let mut config = Config::default();
        for (name, universe, channel) in mappings {
            config.parameters.insert(
                name.to_string(),
                ParameterMapping {
                    universe: *universe,
                    channel: *channel,
                },
            );
        }
        config
    }

    fn state(values: &[(&str, f64)]) -> ParameterState {
        values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn quantization_boundaries() {
        assert_eq!(to_dmx(-1.0), 0);
        assert_eq!(to_dmx(0.0), 0);
        assert_eq!(to_dmx(0.5), 128);
        assert_eq!(to_dmx(1.0), 255);
        assert_eq!(to_dmx(2.0), 255);
        assert_eq!(to_dmx(f64::NAN), 0);
        assert_eq!(to_dmx(1.0 / 255.0), 1);
    }

    #[test]
    fn multicast_group_from_universe() {
        assert_eq!(multicast_addr(1).to_string(), "239.255.0.1:5568");
        assert_eq!(multicast_addr(256).to_string(), "239.255.1.0:5568");
        assert_eq!(multicast_addr(0x1234).to_string(), "239.255.18.52:5568");
    }

    #[test]
    fn frame_header_layout() {
        let cid = Cid::from_bytes([0xab; 16]);
        let frame = build_frame(1, &[0u8; UNIVERSE_SIZE], 7, &cid, "desk");

        assert_eq!(frame.len(), 638);
        assert_eq!(&frame[0..4], &[0x00, 0x10, 0x00, 0x00]);
        assert_eq!(&frame[4..16], b"ASC-E1.17\0\0\0");
        assert_eq!(&frame[16..18], &(0x7000u16 | 622).to_be_bytes());
        assert_eq!(&frame[18..22], &[0x00, 0x00, 0x00, 0x04]);
        assert_eq!(&frame[22..38], &[0xab; 16]);

        assert_eq!(&frame[38..40], &(0x7000u16 | 600).to_be_bytes());
        assert_eq!(&frame[40..44], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&frame[44..48], b"desk");
        assert!(frame[48..108].iter().all(|&b| b == 0));
        assert_eq!(frame[108], 100);
        assert_eq!(&frame[109..111], &[0, 0]);
        assert_eq!(frame[111], 7);
        assert_eq!(frame[112], 0);
        assert_eq!(frame[113], 0x00);

        assert_eq!(&frame[114..116], &(0x7000u16 | 524).to_be_bytes());
        assert_eq!(frame[116], 0x02);
        assert_eq!(frame[117], 0xa1);
        assert_eq!(&frame[118..124], &[0x00, 0x00, 0x00, 0x01, 0x02, 0x01]);
        assert_eq!(frame[124], 0x00);
    }

    #[test]
    fn frame_header_universe_overlaps_dmp_length() {
        // Universe field (113..115) and DMP flags/length (114..116) share byte 114
        // in this layout; the DMP layer is written last.
        let cid = Cid::from_bytes([0; 16]);
        let frame = build_frame(0x0203, &[0u8; UNIVERSE_SIZE], 1, &cid, "x");
        assert_eq!(frame[113], 0x02);
        assert_eq!(frame[114], 0x72);
    }

    #[test]
    fn source_name_is_truncated_to_63_bytes() {
        let name = "n".repeat(100);
        let frame = build_frame(1, &[0u8; UNIVERSE_SIZE], 1, &Cid::from_bytes([0; 16]), &name);
        assert!(frame[44..107].iter().all(|&b| b == b'n'));
        assert_eq!(frame[107], 0);
    }

    #[test]
    fn channel_data_follows_start_code() {
        let mut dmx = [0u8; UNIVERSE_SIZE];
        dmx[0] = 255;
        dmx[511] = 9;
        let frame = build_frame(1, &dmx, 1, &Cid::from_bytes([0; 16]), "x");
        assert_eq!(frame[125], 255);
        assert_eq!(frame[636], 9);
    }

    #[test]
    fn partitions_by_universe_and_drops_unmapped() {
        let config = config(&[("a", 1, 1), ("b", 2, 10), ("c", 1, 512)]);
        let universes = build_universes(
            &state(&[("a", 1.0), ("b", 0.5), ("c", 0.2), ("unmapped", 1.0)]),
            &config,
        );

        assert_eq!(universes.len(), 2);
        assert_eq!(universes[&1][0], 255);
        assert_eq!(universes[&1][511], 51);
        assert_eq!(universes[&2][9], 128);
    }

    #[test]
    fn out_of_range_channel_is_ignored() {
        let config = config(&[("zero", 3, 0), ("high", 3, 513)]);
        let universes = build_universes(&state(&[("zero", 1.0), ("high", 1.0)]), &config);
        assert!(universes[&3].iter().all(|&b| b == 0));
    }

    #[test]
    fn dispatch_sends_one_frame_per_universe() {
        let config = config(&[("a", 1, 1), ("b", 2, 1), ("c", 2, 2)]);
        let mut dispatcher = Dispatcher::with_transport(Recording::default());

        dispatcher.dispatch(&state(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]), &config);

        let sent = &dispatcher.transport().sent;
        assert_eq!(sent.len(), 2);
        let targets: Vec<String> = sent.iter().map(|(t, _)| t.to_string()).collect();
        assert!(targets.contains(&"239.255.0.1:5568".to_string()));
        assert!(targets.contains(&"239.255.0.2:5568".to_string()));
        assert!(sent.iter().all(|(_, f)| f.len() == FRAME_SIZE));
    }

    #[test]
    fn dispatch_without_mapped_parameters_sends_nothing() {
        let mut dispatcher = Dispatcher::with_transport(Recording::default());
        dispatcher.dispatch(&state(&[("a", 1.0)]), &Config::default());
        assert!(dispatcher.transport().sent.is_empty());
    }

    #[test]
    fn sequence_wraps_per_universe() {
        let config = config(&[("a", 1, 1)]);
        let mut dispatcher = Dispatcher::with_transport(Recording::default());

        for _ in 0..257 {
            dispatcher.dispatch(&state(&[("a", 0.5)]), &config);
        }

        let sequences: Vec<u8> = dispatcher
            .transport()
            .sent
            .iter()
            .map(|(_, f)| f[111])
            .collect();
        assert_eq!(sequences[0], 1);
        assert_eq!(sequences[253], 254);
        assert_eq!(sequences[254], 255);
        assert_eq!(sequences[255], 0);
        assert_eq!(sequences[256], 1);
    }

    #[test]
    fn sequences_are_independent_across_universes() {
        let config = config(&[("a", 1, 1), ("b", 2, 1)]);
        let mut dispatcher = Dispatcher::with_transport(Recording::default());

        dispatcher.dispatch(&state(&[("a", 1.0)]), &config);
        dispatcher.dispatch(&state(&[("a", 1.0)]), &config);
        dispatcher.dispatch(&state(&[("b", 1.0)]), &config);

        let sent = &dispatcher.transport().sent;
        assert_eq!(sent[1].1[111], 2);
        assert_eq!(sent[2].1[111], 1);
    }

    #[test]
    fn failed_sends_still_advance_sequence() {
        let config = config(&[("a", 1, 1)]);
        let mut dispatcher = Dispatcher::with_transport(Failing { attempts: 0 });

        for _ in 0..3 {
            dispatcher.dispatch(&state(&[("a", 1.0)]), &config);
        }

        assert_eq!(dispatcher.transport().attempts, 3);
        assert_eq!(dispatcher.next_sequence(1), 4);
    }

    #[test]
    fn cid_is_stable_per_dispatcher() {
        let config = config(&[("a", 1, 1)]);
        let mut dispatcher = Dispatcher::with_transport(Recording::default());
        dispatcher.dispatch(&state(&[("a", 1.0)]), &config);
        dispatcher.dispatch(&state(&[("a", 1.0)]), &config);

        let sent = &dispatcher.transport().sent;
        assert_eq!(&sent[0].1[22..38], dispatcher.cid().as_bytes());
        assert_eq!(&sent[0].1[22..38], &sent[1].1[22..38]);
    }

    #[test]
    fn fallback_cid_is_deterministic() {
        let cid = Cid::fallback();
        assert_eq!(cid.as_bytes()[0], 1);
        assert_eq!(cid.as_bytes()[15], 16);
    }
}
