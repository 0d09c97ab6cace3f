//! Per-request accounting: timings, byte counts and response flags.

use std::time::{Duration, Instant};

/// Why a request terminated the way it did. Consulted by metrics and
/// access logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseFlag {
    NoHealthyUpstream = 1 << 0,
    UpstreamRequestTimeout = 1 << 1,
    UpstreamRemoteReset = 1 << 2,
    UpstreamConnectionFailure = 1 << 3,
    UpstreamConnectionTermination = 1 << 4,
    NoRouteFound = 1 << 5,
    DelayInjected = 1 << 6,
    FaultInjected = 1 << 7,
    RateLimited = 1 << 8,
    DownstreamConnectionTermination = 1 << 9,
}

#[derive(Debug)]
pub struct RequestInfo {
    start: Instant,
    process_start: Option<Instant>,
    pub request_received: Option<Instant>,
    pub response_received: Option<Instant>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub health_check: bool,
    pub retry_count: u32,
    pub response_status: Option<u16>,
    pub upstream_host: Option<std::net::SocketAddr>,
    flags: u32,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            process_start: None,
            request_received: Some(Instant::now()),
            response_received: None,
            bytes_sent: 0,
            bytes_received: 0,
            health_check: false,
            retry_count: 0,
            response_status: None,
            upstream_host: None,
            flags: 0,
        }
    }

    pub fn set_flag(&mut self, flag: ResponseFlag) {
        self.flags |= flag as u32;
    }

    pub fn has_flag(&self, flag: ResponseFlag) -> bool {
        self.flags & (flag as u32) != 0
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Mark the start of upstream processing, for `process_time`.
    pub fn process_started(&mut self) {
        self.process_start.get_or_insert_with(Instant::now);
    }

    pub fn process_time(&self) -> Duration {
        match self.process_start {
            Some(start) => start.elapsed(),
            None => Duration::ZERO,
        }
    }

    pub fn request_time(&self) -> Duration {
        self.start.elapsed()
    }

    /// A request is failed for every flag except timeouts, resets,
    /// terminations and injected delays, which are accounted separately.
    pub fn is_request_failed(&self) -> bool {
        const NOT_FAILED: u32 = ResponseFlag::UpstreamRequestTimeout as u32
            | ResponseFlag::UpstreamRemoteReset as u32
            | ResponseFlag::UpstreamConnectionTermination as u32
            | ResponseFlag::DelayInjected as u32;
        self.flags & !NOT_FAILED != 0
    }
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_accumulate() {
        let mut info = RequestInfo::new();
        assert_eq!(info.flags(), 0);
        info.set_flag(ResponseFlag::NoRouteFound);
        info.set_flag(ResponseFlag::DelayInjected);
        assert!(info.has_flag(ResponseFlag::NoRouteFound));
        assert!(info.has_flag(ResponseFlag::DelayInjected));
        assert!(!info.has_flag(ResponseFlag::FaultInjected));
    }

    #[test]
    fn test_is_request_failed_truth_table() {
        // excluded flags alone do not fail the request
        for flag in [
            ResponseFlag::UpstreamRequestTimeout,
            ResponseFlag::UpstreamRemoteReset,
            ResponseFlag::UpstreamConnectionTermination,
            ResponseFlag::DelayInjected,
        ] {
            let mut info = RequestInfo::new();
            info.set_flag(flag);
            assert!(!info.is_request_failed(), "{:?} should not fail", flag);
        }

        for flag in [
            ResponseFlag::NoHealthyUpstream,
            ResponseFlag::UpstreamConnectionFailure,
            ResponseFlag::NoRouteFound,
            ResponseFlag::FaultInjected,
            ResponseFlag::RateLimited,
        ] {
            let mut info = RequestInfo::new();
            info.set_flag(flag);
            assert!(info.is_request_failed(), "{:?} should fail", flag);
        }

        // one failing flag among excluded ones still fails
        let mut info = RequestInfo::new();
        info.set_flag(ResponseFlag::DelayInjected);
        info.set_flag(ResponseFlag::FaultInjected);
        assert!(info.is_request_failed());
    }
}
