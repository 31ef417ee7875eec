//! The DMA fast-path link.
//!
//! Models the DPDK-style transport: frames move through per-port
//! descriptor rings, and the link assembles Ethernet II + IPv4 + UDP
//! headers in place on transmit and strips them on receive. ARP is
//! answered in-process and resolved peers are kept in a small cache
//! keyed by IPv4 address. The MTU is fixed at construction time.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use bytes::{Buf, BufMut};
use crossbeam::channel::{bounded, Receiver, Sender};

use super::{wait_slice, AdapterId, RecvLink, SendLink, Timeout};
use crate::buffer::{FrameBuff, FramePool};
use crate::error::{Result, RfnocError};

const ETH_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;
/// Total framing prefix reserved in every send buffer.
pub(crate) const FRAME_HDR_LEN: usize = ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const IPPROTO_UDP: u8 = 17;
const ARP_OPER_REQUEST: u16 = 1;
const ARP_OPER_REPLY: u16 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// One side of a pair of descriptor rings standing in for a NIC port
/// queue pair.
pub struct DmaPort {
    rx: Receiver<FrameBuff>,
    tx: Sender<FrameBuff>,
    pool: Arc<FramePool>,
}

/// Build a cross-connected port pair sharing one mbuf pool.
pub fn dma_port_pair(num_frames: usize, frame_size: usize) -> (DmaPort, DmaPort) {
    let pool = Arc::new(FramePool::new(num_frames * 2, frame_size));
    let (a_tx, b_rx) = bounded(num_frames);
    let (b_tx, a_rx) = bounded(num_frames);
    (
        DmaPort {
            rx: a_rx,
            tx: a_tx,
            pool: Arc::clone(&pool),
        },
        DmaPort {
            rx: b_rx,
            tx: b_tx,
            pool,
        },
    )
}

#[derive(Clone, Copy, Debug)]
pub struct DmaLinkParams {
    pub mac: MacAddr,
    pub ipv4: Ipv4Addr,
    pub udp_port: u16,
    pub peer_ipv4: Ipv4Addr,
    pub peer_udp_port: u16,
    /// Fixed link MTU: the largest Ethernet frame the port accepts.
    pub mtu: usize,
}

pub struct DmaLink {
    port: DmaPort,
    params: DmaLinkParams,
    adapter_id: AdapterId,
    arp_cache: Mutex<AHashMap<Ipv4Addr, MacAddr>>,
    num_frames: usize,
}

impl DmaLink {
    pub fn new(port: DmaPort, params: DmaLinkParams, adapter_id: AdapterId) -> Result<Self> {
        if params.mtu <= FRAME_HDR_LEN || params.mtu > port.pool.frame_size() {
            return Err(RfnocError::Config(format!(
                "DMA link MTU {} does not fit the {}-byte port frames",
                params.mtu,
                port.pool.frame_size()
            )));
        }
        let num_frames = port.pool.num_frames() / 2;
        Ok(DmaLink {
            port,
            params,
            adapter_id,
            arp_cache: Mutex::new(AHashMap::new()),
            num_frames,
        })
    }

    pub fn params(&self) -> &DmaLinkParams {
        &self.params
    }

    /// Resolve the peer's MAC address, answering inbound ARP requests
    /// while waiting. Idempotent once resolved.
    pub fn connect(&self, timeout: Timeout) -> Result<()> {
        if self.lookup_arp(self.params.peer_ipv4).is_some() {
            return Ok(());
        }
        self.send_arp(ARP_OPER_REQUEST, MacAddr::BROADCAST, self.params.peer_ipv4)?;

        let deadline = timeout.deadline();
        loop {
            if self.lookup_arp(self.params.peer_ipv4).is_some() {
                return Ok(());
            }
            let Some(slice) = wait_slice(deadline) else {
                return Err(RfnocError::Timeout(format!(
                    "ARP resolution of {} timed out",
                    self.params.peer_ipv4
                )));
            };
            match self.port.rx.recv_timeout(slice) {
                Ok(frame) => {
                    // Only ARP matters before the peer is resolved; data
                    // frames this early are dropped.
                    if !self.consume_arp(&frame) {
                        tracing::trace!("dropping pre-connect non-ARP frame");
                    }
                    self.port.pool.release(frame);
                }
                Err(_) => continue,
            }
        }
    }

    fn lookup_arp(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp_cache
            .lock()
            .expect("arp cache poisoned")
            .get(&ip)
            .copied()
    }

    fn cache_arp(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.arp_cache
            .lock()
            .expect("arp cache poisoned")
            .insert(ip, mac);
    }

    /// Handle an ARP frame: reply to requests for our address, learn
    /// from replies. Returns false if the frame was not ARP.
    fn consume_arp(&self, frame: &FrameBuff) -> bool {
        let data = frame.data();
        if data.len() < ETH_HDR_LEN + 28 {
            return false;
        }
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        if ethertype != ETHERTYPE_ARP {
            return false;
        }

        let arp = &data[ETH_HDR_LEN..];
        let oper = u16::from_be_bytes([arp[6], arp[7]]);
        let sha = MacAddr(arp[8..14].try_into().expect("sha"));
        let spa = Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]);
        let tpa = Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]);

        match oper {
            ARP_OPER_REQUEST if tpa == self.params.ipv4 => {
                self.cache_arp(spa, sha);
                if let Err(e) = self.send_arp(ARP_OPER_REPLY, sha, spa) {
                    tracing::warn!("failed to answer ARP request: {e}");
                }
                true
            }
            ARP_OPER_REPLY if tpa == self.params.ipv4 => {
                tracing::debug!(peer = %spa, mac = %sha, "ARP resolved");
                self.cache_arp(spa, sha);
                true
            }
            _ => true,
        }
    }

    fn send_arp(&self, oper: u16, target_mac: MacAddr, target_ip: Ipv4Addr) -> Result<()> {
        let mut frame = self
            .port
            .pool
            .acquire(Timeout::Poll)
            .ok_or_else(|| RfnocError::Resource("no free frame for ARP".to_string()))?;

        {
            let mut buf: &mut [u8] = frame.frame_mut();
            buf.put_slice(&target_mac.0);
            buf.put_slice(&self.params.mac.0);
            buf.put_u16(ETHERTYPE_ARP);
            buf.put_u16(1); // htype: Ethernet
            buf.put_u16(ETHERTYPE_IPV4);
            buf.put_u8(6);
            buf.put_u8(4);
            buf.put_u16(oper);
            buf.put_slice(&self.params.mac.0);
            buf.put_slice(&self.params.ipv4.octets());
            let tha = if oper == ARP_OPER_REQUEST {
                [0u8; 6]
            } else {
                target_mac.0
            };
            buf.put_slice(&tha);
            buf.put_slice(&target_ip.octets());
        }
        frame.set_packet_size(ETH_HDR_LEN + 28);

        self.port
            .tx
            .try_send(frame)
            .map_err(|_| RfnocError::Transport("DMA tx ring full for ARP".to_string()))
    }

    /// Write the Ethernet/IPv4/UDP prefix in front of a payload of
    /// `payload_len` bytes.
    fn write_headers(&self, frame: &mut FrameBuff, payload_len: usize, peer_mac: MacAddr) {
        let ip_len = (IPV4_HDR_LEN + UDP_HDR_LEN + payload_len) as u16;
        let udp_len = (UDP_HDR_LEN + payload_len) as u16;

        let hdr = &mut frame.frame_mut()[..FRAME_HDR_LEN];
        {
            let mut buf: &mut [u8] = hdr;
            buf.put_slice(&peer_mac.0);
            buf.put_slice(&self.params.mac.0);
            buf.put_u16(ETHERTYPE_IPV4);

            buf.put_u8(0x45); // version 4, IHL 5
            buf.put_u8(0);
            buf.put_u16(ip_len);
            buf.put_u16(0); // identification
            buf.put_u16(0x4000); // don't fragment
            buf.put_u8(64); // ttl
            buf.put_u8(IPPROTO_UDP);
            buf.put_u16(0); // checksum, filled below
            buf.put_slice(&self.params.ipv4.octets());
            buf.put_slice(&self.params.peer_ipv4.octets());

            buf.put_u16(self.params.udp_port);
            buf.put_u16(self.params.peer_udp_port);
            buf.put_u16(udp_len);
            buf.put_u16(0); // UDP checksum optional over IPv4
        }

        let csum = ipv4_checksum(&hdr[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN]);
        hdr[ETH_HDR_LEN + 10..ETH_HDR_LEN + 12].copy_from_slice(&csum.to_be_bytes());
    }

    /// Validate a received frame's prefix; returns the UDP payload
    /// length if it is addressed to this link.
    fn parse_headers(&self, data: &[u8]) -> Option<usize> {
        if data.len() < FRAME_HDR_LEN {
            return None;
        }
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        if ethertype != ETHERTYPE_IPV4 {
            return None;
        }
        let ip = &data[ETH_HDR_LEN..];
        if ip[0] != 0x45 || ip[9] != IPPROTO_UDP {
            return None;
        }
        let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
        if dst_ip != self.params.ipv4 {
            return None;
        }
        let udp = &ip[IPV4_HDR_LEN..];
        let mut ports = &udp[..4];
        let src_port = ports.get_u16();
        let dst_port = ports.get_u16();
        if dst_port != self.params.udp_port || src_port != self.params.peer_udp_port {
            return None;
        }
        let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
        if udp_len < UDP_HDR_LEN || ETH_HDR_LEN + IPV4_HDR_LEN + udp_len > data.len() {
            return None;
        }
        Some(udp_len - UDP_HDR_LEN)
    }
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]);
        sum += u32::from(word);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

impl SendLink for DmaLink {
    fn num_send_frames(&self) -> usize {
        self.num_frames
    }

    fn send_frame_size(&self) -> usize {
        self.params.mtu - FRAME_HDR_LEN
    }

    fn adapter_id(&self) -> AdapterId {
        self.adapter_id
    }

    fn get_send_buff(&self, timeout: Timeout) -> Option<FrameBuff> {
        let mut buff = self.port.pool.acquire(timeout)?;
        buff.set_header_offset(FRAME_HDR_LEN);
        Some(buff)
    }

    fn release_send_buff(&self, mut buff: FrameBuff) -> Result<()> {
        let payload_len = buff.packet_size();
        if FRAME_HDR_LEN + payload_len > self.params.mtu {
            self.port.pool.release(buff);
            return Err(RfnocError::Transport(format!(
                "packet of {payload_len} bytes exceeds the link MTU"
            )));
        }
        let Some(peer_mac) = self.lookup_arp(self.params.peer_ipv4) else {
            self.port.pool.release(buff);
            return Err(RfnocError::Transport(
                "peer MAC unresolved; connect() the DMA link first".to_string(),
            ));
        };

        self.write_headers(&mut buff, payload_len, peer_mac);
        buff.set_header_offset(0);
        buff.set_packet_size(FRAME_HDR_LEN + payload_len);

        self.port
            .tx
            .try_send(buff)
            .map_err(|_| RfnocError::Transport("link tx failed: DMA tx ring full".to_string()))
    }
}

impl RecvLink for DmaLink {
    fn num_recv_frames(&self) -> usize {
        self.num_frames
    }

    fn recv_frame_size(&self) -> usize {
        self.params.mtu - FRAME_HDR_LEN
    }

    fn adapter_id(&self) -> AdapterId {
        self.adapter_id
    }

    fn get_recv_buff(&self, timeout: Timeout) -> Option<FrameBuff> {
        let deadline = timeout.deadline();
        loop {
            let frame = match timeout {
                Timeout::Poll => self.port.rx.try_recv().ok()?,
                _ => {
                    let slice = wait_slice(deadline)?;
                    match self.port.rx.recv_timeout(slice) {
                        Ok(f) => f,
                        Err(_) => {
                            if matches!(timeout, Timeout::Infinite) {
                                continue;
                            }
                            continue; // bounded: wait_slice ends the loop
                        }
                    }
                }
            };

            if self.consume_arp(&frame) {
                self.port.pool.release(frame);
                continue;
            }

            match self.parse_headers(frame.data()) {
                Some(payload_len) => {
                    let mut frame = frame;
                    frame.set_header_offset(FRAME_HDR_LEN);
                    frame.set_packet_size(payload_len);
                    return Some(frame);
                }
                None => {
                    tracing::trace!("dropping frame not addressed to this DMA link");
                    self.port.pool.release(frame);
                }
            }
        }
    }

    fn release_recv_buff(&self, buff: FrameBuff) {
        self.port.pool.release(buff);
    }
}
