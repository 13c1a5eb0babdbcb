//! Synthetic connection table rows for unit tests

use std::net::Ipv4Addr;

use crate::models::ConnectionRecord;
use crate::snapshot::{parse_row, SnapshotLayout};

pub fn proc_header() -> String {
    "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n"
        .to_string()
}

/// Builds one full-layout `/proc/net/tcp` row
#[derive(Debug, Clone)]
pub struct RowBuilder {
    local: (Ipv4Addr, u16),
    remote: (Ipv4Addr, u16),
    state: String,
    tx_queue: u32,
    rx_queue: u32,
    timer: u8,
    retransmits: u32,
    uid: String,
    cwnd: i32,
}

impl Default for RowBuilder {
    fn default() -> Self {
        Self {
            local: (Ipv4Addr::new(192, 168, 1, 10), 80),
            remote: (Ipv4Addr::new(10, 0, 0, 1), 1000),
            state: "01".to_string(),
            tx_queue: 0,
            rx_queue: 0,
            timer: 0,
            retransmits: 0,
            uid: "1000".to_string(),
            cwnd: 10,
        }
    }
}

impl RowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(mut self, ip: &str, port: u16) -> Self {
        self.local = (ip.parse().expect("test ip"), port);
        self
    }

    pub fn remote(mut self, ip: &str, port: u16) -> Self {
        self.remote = (ip.parse().expect("test ip"), port);
        self
    }

    pub fn state(mut self, code: &str) -> Self {
        self.state = code.to_string();
        self
    }

    pub fn queues(mut self, tx: u32, rx: u32) -> Self {
        self.tx_queue = tx;
        self.rx_queue = rx;
        self
    }

    pub fn retransmits(mut self, timer: u8, count: u32) -> Self {
        self.timer = timer;
        self.retransmits = count;
        self
    }

    pub fn uid(mut self, uid: &str) -> Self {
        self.uid = uid.to_string();
        self
    }

    pub fn cwnd(mut self, cwnd: i32) -> Self {
        self.cwnd = cwnd;
        self
    }

    pub fn line(&self, slot: usize) -> String {
        format!(
            "{:4}: {}:{:04X} {}:{:04X} {} {:08X}:{:08X} {:02X}:00000000 {:08X} {:>5} 0 {} 1 0000000000000000 20 4 30 {} -1\n",
            slot,
            hex_addr(self.local.0),
            self.local.1,
            hex_addr(self.remote.0),
            self.remote.1,
            self.state,
            self.tx_queue,
            self.rx_queue,
            self.timer,
            self.retransmits,
            self.uid,
            40000 + slot,
            self.cwnd,
        )
    }

    pub fn record(&self) -> ConnectionRecord {
        parse_row(&self.line(0), SnapshotLayout::Full).expect("builder row must parse")
    }
}

fn hex_addr(ip: Ipv4Addr) -> String {
    let mut octets = ip.octets();
    octets.reverse();
    hex::encode_upper(octets)
}

/// Header plus `count` identical rows
pub fn repeated_rows(row: &RowBuilder, count: usize) -> String {
    let mut blob = proc_header();
    for slot in 0..count {
        blob.push_str(&row.line(slot));
    }
    blob
}
