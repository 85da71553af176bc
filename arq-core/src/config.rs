//! Tuning knobs for the ARQ engine

use crate::error::{ArqError, ArqResult};
use crate::protocol::consts;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Maximum transmission unit for outbound datagrams
    pub mtu: u32,
    /// Send window in segments
    pub snd_wnd: u32,
    /// Receive window in segments
    pub rcv_wnd: u32,
    /// Latency/throughput trade-off knobs
    pub nodelay: NoDelayConfig,
    /// Retransmit count at which the link is declared dead
    pub dead_link: u32,
    /// Stream mode: coalesce writes, erasing message boundaries
    pub stream: bool,
}

/// The classic nodelay tuple: latency mode, flush interval, fast-resend
/// threshold, and congestion-control bypass.
#[derive(Debug, Clone)]
pub struct NoDelayConfig {
    /// Aggressive RTO backoff and a lower minimum RTO
    pub nodelay: bool,
    /// Internal flush interval in milliseconds, clamped to 10..=5000
    pub interval: u32,
    /// Fast retransmit after this many duplicate-ack skips (0 = off)
    pub resend: u32,
    /// Disable the congestion window entirely
    pub no_congestion: bool,
}

impl NoDelayConfig {
    /// Balanced defaults
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: consts::INTERVAL,
            resend: 0,
            no_congestion: false,
        }
    }

    /// The fastest preset: nodelay on, short interval, resend after 2
    /// skips, congestion control off.
    pub fn fastest() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            no_congestion: true,
        }
    }
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mtu: consts::MTU_DEF,
            snd_wnd: consts::WND_SND,
            rcv_wnd: consts::WND_RCV,
            nodelay: NoDelayConfig::normal(),
            dead_link: consts::DEADLINK,
            stream: false,
        }
    }
}

impl ArqConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn nodelay(mut self, config: NoDelayConfig) -> Self {
        self.nodelay = config;
        self
    }

    pub fn fastest(mut self) -> Self {
        self.nodelay = NoDelayConfig::fastest();
        self
    }

    pub fn dead_link(mut self, threshold: u32) -> Self {
        self.dead_link = threshold;
        self
    }

    pub fn stream(mut self, enabled: bool) -> Self {
        self.stream = enabled;
        self
    }

    pub fn validate(&self) -> ArqResult<()> {
        if self.mtu < consts::MTU_MIN {
            return Err(ArqError::config(format!(
                "mtu must be at least {}",
                consts::MTU_MIN
            )));
        }

        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(ArqError::config("window sizes must be greater than 0"));
        }

        if self.dead_link == 0 {
            return Err(ArqError::config("dead link threshold must be greater than 0"));
        }

        Ok(())
    }

    /// Interval clamped to the supported range
    pub(crate) fn effective_interval(&self) -> u32 {
        self.nodelay.interval.clamp(10, 5000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(ArqConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_mtu() {
        assert!(ArqConfig::default().mtu(49).validate().is_err());
        assert!(ArqConfig::default().mtu(50).validate().is_ok());
    }

    #[test]
    fn rejects_zero_window() {
        assert!(ArqConfig::default().window_size(0, 32).validate().is_err());
    }

    #[test]
    fn interval_is_clamped() {
        let mut cfg = ArqConfig::default();
        cfg.nodelay.interval = 1;
        assert_eq!(cfg.effective_interval(), 10);
        cfg.nodelay.interval = 9999;
        assert_eq!(cfg.effective_interval(), 5000);
    }
}
