//! Access logging for completed downstream requests.
//!
//! One structured event per request under the `access` target, so operators
//! can split access entries from diagnostics with an `EnvFilter` directive.
//! Every terminal path flows through here, including synthesized responses.

use tracing::info;

use super::request_info::{RequestInfo, ResponseFlag};
use crate::protocol::{Frame, names};

const FLAG_NAMES: &[(ResponseFlag, &str)] = &[
    (ResponseFlag::NoHealthyUpstream, "UH"),
    (ResponseFlag::UpstreamRequestTimeout, "UT"),
    (ResponseFlag::UpstreamRemoteReset, "UR"),
    (ResponseFlag::UpstreamConnectionFailure, "UF"),
    (ResponseFlag::UpstreamConnectionTermination, "UC"),
    (ResponseFlag::NoRouteFound, "NR"),
    (ResponseFlag::DelayInjected, "DI"),
    (ResponseFlag::FaultInjected, "FI"),
    (ResponseFlag::RateLimited, "RL"),
    (ResponseFlag::DownstreamConnectionTermination, "DC"),
];

/// Short flag string, e.g. `UF,UR`, or `-` when the request was clean.
pub fn flag_string(info: &RequestInfo) -> String {
    let mut out = String::new();
    for (flag, name) in FLAG_NAMES {
        if info.has_flag(*flag) {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(name);
        }
    }
    if out.is_empty() {
        out.push('-');
    }
    out
}

pub fn log(proxy: &str, request: &Frame, info: &RequestInfo) {
    let path = request
        .headers
        .get(names::PATH)
        .map(String::as_str)
        .unwrap_or("-");
    let service = request
        .headers
        .get(names::SERVICE)
        .map(String::as_str)
        .unwrap_or("-");
    info!(
        target: "access",
        proxy,
        protocol = %request.protocol,
        stream_id = request.stream_id,
        path,
        service,
        status = info.response_status.unwrap_or(0),
        flags = %flag_string(info),
        retries = info.retry_count,
        upstream = %info
            .upstream_host
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".into()),
        bytes_sent = info.bytes_sent,
        bytes_received = info.bytes_received,
        duration_ms = info.request_time().as_millis() as u64,
        "request complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_string() {
        let mut info = RequestInfo::new();
        assert_eq!(flag_string(&info), "-");

        info.set_flag(ResponseFlag::UpstreamConnectionFailure);
        info.set_flag(ResponseFlag::NoRouteFound);
        assert_eq!(flag_string(&info), "UF,NR");
    }
}
