use serde::Deserialize;

/// Top-level configuration for a CHDR transport session.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CoreConfig {
    /// Link sizing and socket tuning.
    #[serde(default)]
    pub link: LinkConfig,
    /// Flow-control and streaming parameters.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Control-endpoint parameters.
    #[serde(default)]
    pub ctrl: CtrlConfig,
    /// Offload I/O worker parameters.
    #[serde(default)]
    pub offload: OffloadConfig,
}

/// Link sizing and socket tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    /// Number of receive frames held by the link's pool.
    #[serde(default = "default_num_recv_frames")]
    pub num_recv_frames: usize,
    /// Number of send frames held by the link's pool.
    #[serde(default = "default_num_send_frames")]
    pub num_send_frames: usize,
    /// Size of one receive frame in bytes. Must hold the largest CHDR
    /// packet the peer may emit.
    #[serde(default = "default_frame_size")]
    pub recv_frame_size: usize,
    /// Size of one send frame in bytes.
    #[serde(default = "default_frame_size")]
    pub send_frame_size: usize,
    /// Kernel receive buffer size for UDP links (SO_RCVBUF), bytes.
    /// Zero leaves the kernel default in place.
    #[serde(default)]
    pub socket_recv_buff_size: usize,
    /// Kernel send buffer size for UDP links (SO_SNDBUF), bytes.
    /// Zero leaves the kernel default in place.
    #[serde(default)]
    pub socket_send_buff_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            num_recv_frames: default_num_recv_frames(),
            num_send_frames: default_num_send_frames(),
            recv_frame_size: default_frame_size(),
            send_frame_size: default_frame_size(),
            socket_recv_buff_size: 0,
            socket_send_buff_size: 0,
        }
    }
}

/// Flow-control and streaming parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// Fraction of the receiver's buffer capacity consumed between
    /// successive flow-control status reports. Must lie in (0, 1).
    #[serde(default = "default_fc_freq_ratio")]
    pub fc_freq_ratio: f64,
    /// Fraction of the receiver's buffer capacity held back as headroom
    /// when computing the report frequency. Must lie in [0, 1) and
    /// `fc_freq_ratio + fc_headroom_ratio` must stay below 1.
    #[serde(default = "default_fc_headroom_ratio")]
    pub fc_headroom_ratio: f64,
    /// Timeout for the flow-control setup handshake, milliseconds.
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            fc_freq_ratio: default_fc_freq_ratio(),
            fc_headroom_ratio: default_fc_headroom_ratio(),
            setup_timeout_ms: default_setup_timeout_ms(),
        }
    }
}

/// Control-endpoint parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct CtrlConfig {
    /// Per-transaction response timeout, milliseconds.
    #[serde(default = "default_ctrl_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on unacknowledged fire-and-forget writes.
    #[serde(default = "default_max_outstanding_acks")]
    pub max_outstanding_acks: usize,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        CtrlConfig {
            timeout_ms: default_ctrl_timeout_ms(),
            max_outstanding_acks: default_max_outstanding_acks(),
        }
    }
}

/// Offload I/O worker parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct OffloadConfig {
    /// CPU core to pin the worker thread to. None leaves placement to
    /// the scheduler.
    #[serde(default)]
    pub cpu_core: Option<usize>,
    /// Maximum packets pulled from one link per RX burst.
    #[serde(default = "default_rx_burst_size")]
    pub rx_burst_size: usize,
    /// Maximum packets drained from one client's send ring per loop
    /// iteration.
    #[serde(default = "default_tx_drain_size")]
    pub tx_drain_size: usize,
    /// Service queue depth. Must be a power of two.
    #[serde(default = "default_service_queue_depth")]
    pub service_queue_depth: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        OffloadConfig {
            cpu_core: None,
            rx_burst_size: default_rx_burst_size(),
            tx_drain_size: default_tx_drain_size(),
            service_queue_depth: default_service_queue_depth(),
        }
    }
}

fn default_num_recv_frames() -> usize {
    32
}

fn default_num_send_frames() -> usize {
    32
}

fn default_frame_size() -> usize {
    8000
}

fn default_fc_freq_ratio() -> f64 {
    0.125
}

fn default_fc_headroom_ratio() -> f64 {
    0.0625
}

fn default_setup_timeout_ms() -> u64 {
    200
}

fn default_ctrl_timeout_ms() -> u64 {
    100
}

fn default_max_outstanding_acks() -> usize {
    32
}

fn default_rx_burst_size() -> usize {
    16
}

fn default_tx_drain_size() -> usize {
    16
}

fn default_service_queue_depth() -> usize {
    64
}
