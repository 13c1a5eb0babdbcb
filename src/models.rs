use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One side of a TCP connection as decoded from the connection table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Kernel TCP socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    MaxStates,
}

impl TcpState {
    /// Map the numeric state column (`st`) to a state
    pub fn from_code(code: u8) -> Option<Self> {
        let state = match code {
            0x01 => TcpState::Established,
            0x02 => TcpState::SynSent,
            0x03 => TcpState::SynRecv,
            0x04 => TcpState::FinWait1,
            0x05 => TcpState::FinWait2,
            0x06 => TcpState::TimeWait,
            0x07 => TcpState::Close,
            0x08 => TcpState::CloseWait,
            0x09 => TcpState::LastAck,
            0x0A => TcpState::Listen,
            0x0B => TcpState::Closing,
            0x0C => TcpState::MaxStates,
            _ => return None,
        };
        Some(state)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::Closing => "CLOSING",
            TcpState::MaxStates => "MAX_STATES",
        }
    }
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kernel timer is pending on the socket (`tr` column)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimerActive {
    /// No timer pending
    #[default]
    None,
    /// Retransmit timer
    Retransmit,
    /// Keepalive, delayed ACK or FIN_WAIT2 timer
    Other,
    /// Socket in TIME_WAIT
    TimeWait,
    /// Zero window probe timer
    ZeroWindowProbe,
    Unknown(u8),
}

impl From<u8> for TimerActive {
    fn from(code: u8) -> Self {
        match code {
            0 => TimerActive::None,
            1 => TimerActive::Retransmit,
            2 => TimerActive::Other,
            3 => TimerActive::TimeWait,
            4 => TimerActive::ZeroWindowProbe,
            other => TimerActive::Unknown(other),
        }
    }
}

/// One row of the TCP connection table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub state: TcpState,
    /// Bytes queued for sending
    pub tx_queue: i64,
    /// Bytes received but not yet read
    pub rx_queue: i64,
    pub timer_active: TimerActive,
    /// Jiffies until the pending timer expires
    pub timer_jiffies: i64,
    /// Unrecovered retransmit timeouts
    pub retransmit_timeouts: i64,
    pub uid: u32,
    /// Retransmission timeout in clock ticks
    pub rto: i32,
    pub congestion_window: i32,
    /// -1 when the threshold is >= 0xFFFF
    pub slow_start_threshold: i32,
}

impl ConnectionRecord {
    /// Peer identity used for aggregation and blocking: the remote IP, port ignored
    pub fn peer(&self) -> String {
        self.remote.address.to_string()
    }

    pub fn is_listening(&self) -> bool {
        self.state == TcpState::Listen
    }
}

/// Number of connections observed for a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountItem {
    pub key: String,
    pub n: usize,
}

impl CountItem {
    pub fn new(key: impl Into<String>, n: usize) -> Self {
        Self { key: key.into(), n }
    }
}
