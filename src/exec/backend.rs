// src/exec/backend.rs

//! Pluggable dispatch backend abstraction.
//!
//! The runtime talks to a `DispatchBackend` instead of a transport. This
//! makes it easy to swap in a fake ant in tests while production code seals
//! requests and publishes them with [`QueueDispatchBackend`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::errors::Result;
use crate::exec::transport::{Message, Transport};
use crate::protocol::TaskRequest;
use crate::resource::AntReservation;

/// Trait abstracting how task requests reach the reserved ant.
pub trait DispatchBackend: Send {
    /// Hand `request` to the ant holding `reservation`.
    ///
    /// `Ok` means the request was handed over; the ant's outcome arrives
    /// later as a response event.
    fn dispatch(
        &mut self,
        request: TaskRequest,
        reservation: AntReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Deliver a `CANCEL` request for work the ant may still be running.
    fn cancel(
        &mut self,
        request: TaskRequest,
        reservation: AntReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Backend used in production: seals each request with the ant's key (or
/// the shared secret) and publishes it on the ant's topic.
pub struct QueueDispatchBackend {
    transport: Arc<dyn Transport>,
    shared_secret: String,
}

impl QueueDispatchBackend {
    pub fn new(transport: Arc<dyn Transport>, shared_secret: impl Into<String>) -> Self {
        Self {
            transport,
            shared_secret: shared_secret.into(),
        }
    }

    fn send(
        &self,
        request: TaskRequest,
        reservation: AntReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let secret = reservation
                .encryption_key
                .as_deref()
                .unwrap_or(&self.shared_secret);
            let payload = request.marshal(secret)?;
            debug!(
                request_id = %request.job_request_id,
                task_type = %request.task_type,
                action = ?request.action,
                topic = %reservation.ant_topic,
                "publishing task request"
            );
            self.transport
                .publish(
                    &reservation.ant_topic,
                    Message {
                        key: request.key(),
                        payload,
                    },
                )
                .await
        })
    }
}

impl DispatchBackend for QueueDispatchBackend {
    fn dispatch(
        &mut self,
        request: TaskRequest,
        reservation: AntReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.send(request, reservation)
    }

    fn cancel(
        &mut self,
        request: TaskRequest,
        reservation: AntReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.send(request, reservation)
    }
}
