//! Stream-level filter chains.
//!
//! Each downstream stream gets a receive chain and a send chain built from
//! the listener's stream-filter config. Receive filters run in phase order
//! (`BeforeRoute`, `AfterRoute`, `AfterChooseHost`); a filter either lets
//! the chain continue, parks it until `resume()`, or hijacks the stream
//! with a synthesized response. Header mutations made before a stop are
//! visible to later stages.

pub mod fault;
pub mod healthcheck;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::StreamFilterConfig;
use crate::protocol::Frame;
use crate::proxy::request_info::RequestInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterPhase {
    BeforeRoute,
    AfterRoute,
    AfterChooseHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFilterStatus {
    Continue,
    Stop,
}

/// Mutable per-stream state handed to receive filters.
pub struct ReceiveContext<'a> {
    pub request: &'a mut Frame,
    pub info: &'a mut RequestInfo,
    hijack: Option<Frame>,
    resume: Arc<Notify>,
}

impl<'a> ReceiveContext<'a> {
    pub fn new(request: &'a mut Frame, info: &'a mut RequestInfo, resume: Arc<Notify>) -> Self {
        Self {
            request,
            info,
            hijack: None,
            resume,
        }
    }

    /// Terminate the stream with a synthesized response. The proxy encodes
    /// it downstream; no upstream connection is involved.
    pub fn hijack(&mut self, response: Frame) {
        self.hijack = Some(response);
    }

    pub fn take_hijack(&mut self) -> Option<Frame> {
        self.hijack.take()
    }

    /// Capability for resuming a parked chain from another task.
    pub fn resume_handle(&self) -> Arc<Notify> {
        self.resume.clone()
    }
}

#[async_trait]
pub trait StreamReceiverFilter: Send + Sync {
    async fn on_receive(&self, ctx: &mut ReceiveContext<'_>) -> StreamFilterStatus;
}

/// Send filters see the response frame before it is encoded downstream.
pub trait StreamSenderFilter: Send + Sync {
    fn on_send(&self, response: &mut Frame, info: &mut RequestInfo);
}

/// Outcome of running a receive phase.
pub enum ChainResult {
    Continue,
    Hijacked(Frame),
}

/// Ordered, phase-tagged filters for one stream.
pub struct StreamFilterChain {
    receive: Vec<(FilterPhase, Arc<dyn StreamReceiverFilter>)>,
    send: Vec<Arc<dyn StreamSenderFilter>>,
    resume: Arc<Notify>,
}

impl StreamFilterChain {
    pub fn new() -> Self {
        Self {
            receive: Vec::new(),
            send: Vec::new(),
            resume: Arc::new(Notify::new()),
        }
    }

    pub fn add_receiver(&mut self, phase: FilterPhase, filter: Arc<dyn StreamReceiverFilter>) {
        self.receive.push((phase, filter));
        // stable within a phase: insertion order is preserved
        self.receive.sort_by_key(|(p, _)| *p);
    }

    pub fn add_sender(&mut self, filter: Arc<dyn StreamSenderFilter>) {
        self.send.push(filter);
    }

    /// Run every receive filter registered for `phase`, in order. A `Stop`
    /// without a hijack parks the chain until some task resumes it.
    pub async fn run_receive(
        &self,
        phase: FilterPhase,
        request: &mut Frame,
        info: &mut RequestInfo,
    ) -> ChainResult {
        for (filter_phase, filter) in &self.receive {
            if *filter_phase != phase {
                continue;
            }
            let mut ctx = ReceiveContext::new(request, info, self.resume.clone());
            let status = filter.on_receive(&mut ctx).await;
            let hijack = ctx.take_hijack();
            match (status, hijack) {
                (_, Some(response)) => return ChainResult::Hijacked(response),
                (StreamFilterStatus::Continue, None) => {}
                (StreamFilterStatus::Stop, None) => {
                    self.resume.notified().await;
                }
            }
        }
        ChainResult::Continue
    }

    pub fn run_send(&self, response: &mut Frame, info: &mut RequestInfo) {
        for filter in &self.send {
            filter.on_send(response, info);
        }
    }
}

impl Default for StreamFilterChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a stream filter chain from listener config. Called once per stream.
pub fn build_chain(configs: &[StreamFilterConfig]) -> StreamFilterChain {
    let mut chain = StreamFilterChain::new();
    for config in configs {
        match config {
            StreamFilterConfig::HealthCheck(hc) => {
                chain.add_receiver(
                    FilterPhase::BeforeRoute,
                    Arc::new(healthcheck::HealthCheckFilter::new(hc.clone())),
                );
            }
            StreamFilterConfig::FaultInject(fi) => {
                chain.add_receiver(
                    FilterPhase::BeforeRoute,
                    Arc::new(fault::FaultInjectFilter::new(fi.clone())),
                );
            }
        }
    }
    chain
}
