//! Health-check hijack: intercepts protocol heartbeats before routing.
//!
//! When a request carries the heartbeat marker, the filter flags the
//! request-info. Unless configured as pass-through it fabricates a healthy
//! response carrying the hijack marker and stops the chain, so no upstream
//! connection is touched.

use async_trait::async_trait;
use tracing::trace;

use super::{ReceiveContext, StreamFilterStatus, StreamReceiverFilter};
use crate::config::HealthCheckFilterConfig;
use crate::protocol::{Frame, names};

pub struct HealthCheckFilter {
    pass_through: bool,
}

impl HealthCheckFilter {
    pub fn new(config: HealthCheckFilterConfig) -> Self {
        Self {
            pass_through: config.pass_through,
        }
    }

    fn handle_intercept(&self, ctx: &mut ReceiveContext<'_>) {
        ctx.request
            .headers
            .insert(names::HEARTBEAT_HIJACK.into(), "true".into());

        let mut response = Frame::response(ctx.request.protocol, ctx.request.stream_id, 200);
        response.heartbeat = true;
        response.headers = ctx.request.headers.clone();
        ctx.hijack(response);
    }
}

#[async_trait]
impl StreamReceiverFilter for HealthCheckFilter {
    async fn on_receive(&self, ctx: &mut ReceiveContext<'_>) -> StreamFilterStatus {
        let protocol = match ctx.request.headers.get(names::HEARTBEAT) {
            Some(protocol) => protocol.clone(),
            None => return StreamFilterStatus::Continue,
        };
        trace!(
            stream_id = ctx.request.stream_id,
            protocol = %protocol,
            "heartbeat request"
        );
        ctx.info.health_check = true;
        if !self.pass_through {
            self.handle_intercept(ctx);
            return StreamFilterStatus::Stop;
        }
        StreamFilterStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ChainResult, FilterPhase, StreamFilterChain};
    use crate::protocol::Protocol;
    use crate::proxy::request_info::RequestInfo;
    use std::sync::Arc;

    fn chain(pass_through: bool) -> StreamFilterChain {
        let mut chain = StreamFilterChain::new();
        chain.add_receiver(
            FilterPhase::BeforeRoute,
            Arc::new(HealthCheckFilter::new(HealthCheckFilterConfig {
                pass_through,
                cache_time: None,
            })),
        );
        chain
    }

    fn heartbeat_request() -> Frame {
        let mut frame = Frame::request(Protocol::Xprotocol, 3);
        frame.heartbeat = true;
        frame.headers.insert(names::HEARTBEAT.into(), "dubbo".into());
        frame
    }

    #[tokio::test]
    async fn test_hijacks_heartbeat() {
        let chain = chain(false);
        let mut frame = heartbeat_request();
        let mut info = RequestInfo::new();
        match chain
            .run_receive(FilterPhase::BeforeRoute, &mut frame, &mut info)
            .await
        {
            ChainResult::Hijacked(resp) => {
                assert_eq!(resp.status, Some(200));
                assert_eq!(resp.stream_id, 3);
                assert_eq!(
                    resp.headers.get(names::HEARTBEAT_HIJACK).map(String::as_str),
                    Some("true")
                );
            }
            ChainResult::Continue => panic!("expected hijack"),
        }
        assert!(info.health_check);
    }

    #[tokio::test]
    async fn test_pass_through_continues() {
        let chain = chain(true);
        let mut frame = heartbeat_request();
        let mut info = RequestInfo::new();
        let result = chain
            .run_receive(FilterPhase::BeforeRoute, &mut frame, &mut info)
            .await;
        assert!(matches!(result, ChainResult::Continue));
        assert!(info.health_check);
    }

    #[tokio::test]
    async fn test_plain_request_untouched() {
        let chain = chain(false);
        let mut frame = Frame::request(Protocol::Rpc, 1);
        let mut info = RequestInfo::new();
        let result = chain
            .run_receive(FilterPhase::BeforeRoute, &mut frame, &mut info)
            .await;
        assert!(matches!(result, ChainResult::Continue));
        assert!(!info.health_check);
    }
}
