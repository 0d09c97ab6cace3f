//! Fault injection: percentage-gated delays and aborts.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

use super::{ReceiveContext, StreamFilterStatus, StreamReceiverFilter};
use crate::config::FaultInjectConfig;
use crate::protocol::Frame;
use crate::proxy::request_info::ResponseFlag;

pub struct FaultInjectFilter {
    delay_percent: u32,
    delay_duration: Duration,
    abort_percent: u32,
    abort_status: u16,
}

impl FaultInjectFilter {
    pub fn new(config: FaultInjectConfig) -> Self {
        Self {
            delay_percent: config.delay_percent.min(100),
            delay_duration: config.delay_duration.unwrap_or(Duration::ZERO),
            abort_percent: config.abort_percent.min(100),
            abort_status: config.abort_status,
        }
    }

    fn roll(percent: u32) -> bool {
        percent > 0 && rand::thread_rng().gen_range(0..100) < percent
    }
}

#[async_trait]
impl StreamReceiverFilter for FaultInjectFilter {
    async fn on_receive(&self, ctx: &mut ReceiveContext<'_>) -> StreamFilterStatus {
        if Self::roll(self.delay_percent) && !self.delay_duration.is_zero() {
            debug!(
                stream_id = ctx.request.stream_id,
                delay = ?self.delay_duration,
                "injecting delay"
            );
            ctx.info.set_flag(ResponseFlag::DelayInjected);
            tokio::time::sleep(self.delay_duration).await;
        }

        if Self::roll(self.abort_percent) {
            debug!(
                stream_id = ctx.request.stream_id,
                status = self.abort_status,
                "injecting abort"
            );
            ctx.info.set_flag(ResponseFlag::FaultInjected);
            let response = Frame::response(
                ctx.request.protocol,
                ctx.request.stream_id,
                self.abort_status,
            );
            ctx.hijack(response);
            return StreamFilterStatus::Stop;
        }

        StreamFilterStatus::Continue
    }
}
