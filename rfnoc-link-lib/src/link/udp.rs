use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use super::{AdapterId, RecvLink, SendLink, Timeout};
use crate::buffer::{FrameBuff, FramePool};
use crate::config::LinkConfig;
use crate::error::{Result, RfnocError};

/// Bound retry count for transient send refusals (EAGAIN and friends).
const SEND_RETRIES: usize = 32;

/// A CHDR link over one UDP socket, connected to a single peer.
///
/// One frame equals one datagram. The configured frame sizes must
/// accommodate the largest CHDR packet plus UDP/IP overhead within the
/// path MTU; the kernel socket buffers can be grown via
/// [`LinkConfig::socket_recv_buff_size`] to ride out scheduling gaps.
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
    adapter_id: AdapterId,
    send_pool: FramePool,
    recv_pool: FramePool,
    send_frame_size: usize,
    recv_frame_size: usize,
}

impl UdpLink {
    pub fn new(peer: SocketAddr, cfg: &LinkConfig, adapter_id: AdapterId) -> Result<Self> {
        let domain = if peer.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if cfg.socket_recv_buff_size > 0 {
            socket.set_recv_buffer_size(cfg.socket_recv_buff_size)?;
            let granted = socket.recv_buffer_size()?;
            if granted < cfg.socket_recv_buff_size {
                tracing::warn!(
                    requested = cfg.socket_recv_buff_size,
                    granted,
                    "kernel clipped the UDP receive buffer"
                );
            }
        }
        if cfg.socket_send_buff_size > 0 {
            socket.set_send_buffer_size(cfg.socket_send_buff_size)?;
        }

        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("bind addr")
        } else {
            "[::]:0".parse().expect("bind addr")
        };
        socket.bind(&bind_addr.into())?;
        socket.connect(&peer.into())?;

        let socket: UdpSocket = socket.into();
        tracing::debug!(%peer, local = ?socket.local_addr().ok(), "UDP link up");

        Ok(UdpLink {
            socket,
            peer,
            adapter_id,
            send_pool: FramePool::new(cfg.num_send_frames, cfg.send_frame_size),
            recv_pool: FramePool::new(cfg.num_recv_frames, cfg.recv_frame_size),
            send_frame_size: cfg.send_frame_size,
            recv_frame_size: cfg.recv_frame_size,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn recv_into(&self, buff: &mut FrameBuff, timeout: Timeout) -> std::io::Result<usize> {
        match timeout {
            Timeout::Poll => {
                self.socket.set_nonblocking(true)?;
                let res = self.socket.recv(buff.frame_mut());
                self.socket.set_nonblocking(false)?;
                res
            }
            Timeout::Bounded(d) => {
                // Zero duration would mean "no timeout" to the kernel.
                self.socket
                    .set_read_timeout(Some(d.max(Duration::from_millis(1))))?;
                self.socket.recv(buff.frame_mut())
            }
            Timeout::Infinite => {
                self.socket.set_read_timeout(None)?;
                self.socket.recv(buff.frame_mut())
            }
        }
    }
}

impl SendLink for UdpLink {
    fn num_send_frames(&self) -> usize {
        self.send_pool.num_frames()
    }

    fn send_frame_size(&self) -> usize {
        self.send_frame_size
    }

    fn adapter_id(&self) -> AdapterId {
        self.adapter_id
    }

    fn get_send_buff(&self, timeout: Timeout) -> Option<FrameBuff> {
        self.send_pool.acquire(timeout)
    }

    fn release_send_buff(&self, buff: FrameBuff) -> Result<()> {
        let mut attempts = 0;
        let res = loop {
            match self.socket.send(buff.data()) {
                Ok(n) if n == buff.data().len() => break Ok(()),
                Ok(n) => {
                    break Err(RfnocError::Transport(format!(
                        "short UDP send: {n} of {} bytes",
                        buff.data().len()
                    )))
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    attempts += 1;
                    if attempts > SEND_RETRIES {
                        break Err(RfnocError::Transport(
                            "link tx failed: kernel kept refusing the datagram".to_string(),
                        ));
                    }
                    std::thread::yield_now();
                }
                Err(e) => break Err(RfnocError::Transport(format!("UDP send failed: {e}"))),
            }
        };
        self.send_pool.release(buff);
        res
    }
}

impl RecvLink for UdpLink {
    fn num_recv_frames(&self) -> usize {
        self.recv_pool.num_frames()
    }

    fn recv_frame_size(&self) -> usize {
        self.recv_frame_size
    }

    fn adapter_id(&self) -> AdapterId {
        self.adapter_id
    }

    fn get_recv_buff(&self, timeout: Timeout) -> Option<FrameBuff> {
        let mut buff = self.recv_pool.try_acquire()?;
        match self.recv_into(&mut buff, timeout) {
            Ok(n) => {
                buff.set_packet_size(n);
                Some(buff)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                self.recv_pool.release(buff);
                None
            }
            Err(e) => {
                tracing::error!("UDP recv failed: {e}");
                self.recv_pool.release(buff);
                None
            }
        }
    }

    fn release_recv_buff(&self, buff: FrameBuff) {
        self.recv_pool.release(buff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> LinkConfig {
        LinkConfig {
            num_recv_frames: 4,
            num_send_frames: 4,
            recv_frame_size: 2048,
            send_frame_size: 2048,
            socket_recv_buff_size: 0,
            socket_send_buff_size: 0,
        }
    }

    #[test]
    fn test_udp_link_roundtrip() {
        // A plain socket stands in for the device end and echoes.
        let echo = UdpSocket::bind("127.0.0.1:0").expect("echo socket");
        let peer = echo.local_addr().expect("echo addr");
        let link = UdpLink::new(peer, &small_cfg(), AdapterId(0)).expect("link");

        let mut buff = link.get_send_buff(Timeout::Poll).expect("send buff");
        buff.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buff.set_packet_size(4);
        link.release_send_buff(buff).expect("send");

        let mut scratch = [0u8; 16];
        echo.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let (n, from) = echo.recv_from(&mut scratch).expect("recv");
        assert_eq!(&scratch[..n], &[1, 2, 3, 4]);

        echo.send_to(&scratch[..n], from).expect("echo send");
        let got = link
            .get_recv_buff(Timeout::Bounded(Duration::from_secs(2)))
            .expect("recv buff");
        assert_eq!(got.data(), &[1, 2, 3, 4]);
        link.release_recv_buff(got);
    }

    #[test]
    fn test_recv_timeout_returns_none() {
        let peer: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        let link = UdpLink::new(peer, &small_cfg(), AdapterId(0)).expect("link");
        assert!(link.get_recv_buff(Timeout::Poll).is_none());
        assert!(link
            .get_recv_buff(Timeout::Bounded(Duration::from_millis(10)))
            .is_none());
    }
}
