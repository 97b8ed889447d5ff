use std::time::{Duration, Instant};

use tracing::*;

use crate::utp::{UtpConfig, CCONTROL_TARGET, MAX_CWND_INCREASE_BYTES_PER_RTT};

const MIN_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);
const BASE_DELAY_WINDOW: Duration = Duration::from_secs(120);

/// Delay-based congestion control (LEDBAT) and retransmission timeout estimation.
///
/// Windows are counted in bytes of DATA payload.
#[derive(Debug, Clone)]
pub struct CongestionControl {
    packet_size: u32,
    max_window: u32,
    cur_window: u32,
    rtt: Duration,
    rtt_var: Duration,
    timeout: Duration,
    // Lowest one-way delay seen in the current window and when it was recorded.
    base_delay: Option<(u32, Instant)>,
    our_delay: u32,
}

impl CongestionControl {
    pub fn new(config: &UtpConfig) -> Self {
        let packet_size = config.packet_size as u32;

        Self {
            packet_size,
            max_window: 3 * packet_size,
            cur_window: 0,
            rtt: config.initial_timeout,
            rtt_var: Duration::ZERO,
            timeout: config.initial_timeout,
            base_delay: None,
            our_delay: 0,
        }
    }

    /// Returns the byte budget for unacknowledged data.
    pub fn max_window(&self) -> u32 {
        self.max_window
    }

    /// Returns the bytes currently in flight.
    pub fn cur_window(&self) -> u32 {
        self.cur_window
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn rtt_var(&self) -> Duration {
        self.rtt_var
    }

    /// Returns the current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the queuing delay measured by the last packet, in microseconds.
    pub fn our_delay(&self) -> u32 {
        self.our_delay
    }

    /// Returns `true` if `len` more bytes fit in the window. A single packet may always be in
    /// flight, otherwise a zero window would never recover.
    pub fn can_send(&self, len: usize) -> bool {
        self.cur_window == 0 || self.cur_window as u64 + len as u64 <= self.max_window as u64
    }

    pub fn on_sent(&mut self, len: usize) {
        self.cur_window = self.cur_window.saturating_add(len as u32);
    }

    pub fn on_acked(&mut self, len: usize) {
        self.cur_window = self.cur_window.saturating_sub(len as u32);
    }

    /// Folds a round trip sample into the estimate and recomputes the timeout.
    pub fn update_rtt(&mut self, sample: Duration) {
        let rtt = self.rtt.as_millis() as i64;
        let rtt_var = self.rtt_var.as_millis() as i64;
        let sample = sample.as_millis() as i64;

        let rtt_var = (rtt_var + ((rtt - sample).abs() - rtt_var) / 4).max(0);
        let rtt = (rtt + (sample - rtt) / 8).max(0);

        self.rtt = Duration::from_millis(rtt as u64);
        self.rtt_var = Duration::from_millis(rtt_var as u64);
        self.timeout = (self.rtt + 4 * self.rtt_var).clamp(MIN_TIMEOUT, MAX_TIMEOUT);

        trace!(rtt = ?self.rtt, rtt_var = ?self.rtt_var, timeout = ?self.timeout, "rtt updated");
    }

    /// Adjusts the window from the one-way delay of a received packet (in microseconds).
    pub fn update_delay(&mut self, delay: u32, now: Instant) {
        match self.base_delay {
            Some((base, at)) if delay >= base && now.duration_since(at) <= BASE_DELAY_WINDOW => {}
            _ => self.base_delay = Some((delay, now)),
        }

        let base = self.base_delay.map_or(delay, |(base, _)| base);
        self.our_delay = delay - base;

        let target = CCONTROL_TARGET.as_micros() as f64;
        let delay_factor = (target - self.our_delay as f64) / target;
        let window_factor = self.cur_window as f64 / self.max_window.max(1) as f64;
        let gain = MAX_CWND_INCREASE_BYTES_PER_RTT as f64 * delay_factor * window_factor;

        let max_window = (self.max_window as f64 + gain).max(0.0) as u32;
        // A zero window forces a single packet through on the next send.
        self.max_window = if max_window == 0 {
            self.packet_size
        } else {
            max_window
        };
    }

    /// Timeout fired: collapse the window to a single packet and back off.
    pub fn throttle(&mut self) {
        self.max_window = self.packet_size;
        self.timeout = (self.timeout * 2).min(MAX_TIMEOUT);

        debug!(timeout = ?self.timeout, "throttled");
    }
}
