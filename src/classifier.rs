//! Abnormal connection classification
//!
//! Flags connections whose kernel-reported internals point at a stalled or
//! misbehaving peer: stuck in teardown, congestion-collapsed with data queued
//! both ways, or repeatedly timing out on retransmission.

use serde::Serialize;

use crate::models::{ConnectionRecord, TcpState, TimerActive};

/// Retransmit timeouts tolerated before a connection counts as abnormal
pub const MAX_RETRANSMIT_TIMEOUTS: i64 = 3;

/// Rule that marked a connection abnormal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbnormalReason {
    /// CLOSING or FIN_WAIT1
    StuckTeardown,
    /// Congestion window of 1 with both queues non-empty
    CongestionCollapse,
    /// Retransmit timer pending after too many timeouts
    ExcessiveRetransmits,
}

impl std::fmt::Display for AbnormalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbnormalReason::StuckTeardown => write!(f, "stuck in teardown"),
            AbnormalReason::CongestionCollapse => write!(f, "congestion collapse"),
            AbnormalReason::ExcessiveRetransmits => write!(f, "excessive retransmits"),
        }
    }
}

/// First rule the record violates, if any
pub fn classify(record: &ConnectionRecord) -> Option<AbnormalReason> {
    if matches!(record.state, TcpState::Closing | TcpState::FinWait1) {
        return Some(AbnormalReason::StuckTeardown);
    }

    if record.congestion_window == 1 && record.tx_queue != 0 && record.rx_queue != 0 {
        return Some(AbnormalReason::CongestionCollapse);
    }

    if record.timer_active == TimerActive::Retransmit
        && record.retransmit_timeouts > MAX_RETRANSMIT_TIMEOUTS
    {
        return Some(AbnormalReason::ExcessiveRetransmits);
    }

    None
}

pub fn is_abnormal(record: &ConnectionRecord) -> bool {
    classify(record).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RowBuilder;

    #[test]
    fn test_closing_always_abnormal() {
        let rec = RowBuilder::new().state("0B").record();
        assert!(is_abnormal(&rec));

        let rec = RowBuilder::new()
            .state("0B")
            .cwnd(1)
            .queues(5, 3)
            .retransmits(1, 9)
            .record();
        assert_eq!(classify(&rec), Some(AbnormalReason::StuckTeardown));

        let rec = RowBuilder::new().state("04").record();
        assert_eq!(classify(&rec), Some(AbnormalReason::StuckTeardown));
    }

    #[test]
    fn test_established_healthy() {
        let rec = RowBuilder::new().cwnd(10).queues(5, 3).record();
        assert!(!is_abnormal(&rec));

        // FIN_WAIT2 and TIME_WAIT are normal teardown states
        assert!(!is_abnormal(&RowBuilder::new().state("05").record()));
        assert!(!is_abnormal(&RowBuilder::new().state("06").record()));
    }

    #[test]
    fn test_congestion_collapse() {
        let rec = RowBuilder::new().cwnd(1).queues(5, 3).record();
        assert_eq!(classify(&rec), Some(AbnormalReason::CongestionCollapse));

        let rec = RowBuilder::new().cwnd(1).queues(5, 0).record();
        assert!(!is_abnormal(&rec));

        let rec = RowBuilder::new().cwnd(1).queues(0, 3).record();
        assert!(!is_abnormal(&rec));
    }

    #[test]
    fn test_excessive_retransmits() {
        let rec = RowBuilder::new().retransmits(1, 4).record();
        assert_eq!(classify(&rec), Some(AbnormalReason::ExcessiveRetransmits));

        // Exactly at the limit is tolerated
        assert!(!is_abnormal(&RowBuilder::new().retransmits(1, 3).record()));

        // Needs the retransmit timer, not just the counter
        assert!(!is_abnormal(&RowBuilder::new().retransmits(2, 10).record()));
    }

    #[test]
    fn test_listen_never_abnormal() {
        let rec = RowBuilder::new().state("0A").retransmits(0, 0).record();
        assert!(!is_abnormal(&rec));
    }
}
