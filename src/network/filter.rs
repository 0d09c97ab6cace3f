//! Connection-level filter chains.
//!
//! Read filters see every chunk of bytes the read loop pulls off the socket
//! and either let the chain continue or stop it. A stopped chain is parked
//! until some task calls [`ReadContext::continue_reading`], after which the
//! chain re-runs against the current buffer.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;

use super::connection::Connection;
use crate::buffer::IoBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    Stop,
}

/// Handle a read filter uses to talk back to its connection.
pub struct ReadContext {
    connection: Arc<Connection>,
    resume: Arc<Notify>,
}

impl ReadContext {
    pub(crate) fn new(connection: Arc<Connection>, resume: Arc<Notify>) -> Self {
        Self { connection, resume }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Resume a stopped filter chain. Callable from any task.
    pub fn continue_reading(&self) {
        self.resume.notify_one();
    }

    /// A clonable resume capability, handed to filters that resume later.
    pub fn resume_handle(&self) -> Arc<Notify> {
        self.resume.clone()
    }
}

#[async_trait]
pub trait ReadFilter: Send + Sync {
    /// Called every time bytes are read from the connection.
    async fn on_data(&self, buf: &mut IoBuffer, ctx: &ReadContext) -> FilterStatus;

    /// Called once when the connection becomes active.
    fn on_new_connection(&self) -> FilterStatus {
        FilterStatus::Continue
    }
}

/// Write filters run in the write task before bytes reach the socket.
pub trait WriteFilter: Send + Sync {
    fn on_write(&self, data: &mut bytes::BytesMut) -> FilterStatus;
}
