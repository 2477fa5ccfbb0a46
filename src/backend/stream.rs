//! Server-sent order events for the signed-in driver.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::Stream;
use reqwest::StatusCode;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource, RequestBuilderExt};
use tracing::{debug, info, warn};

use crate::backend::ApiClient;
use crate::error::TrackerError;
use crate::models::events::OrderEvent;

/// Stream of `order_assigned` / `order_cancelled` events.
///
/// Transport errors are yielded and the underlying source reconnects on its
/// own. An unauthorized response closes the stream after yielding
/// `TrackerError::Auth`.
pub struct OrderEventStream {
    event_source: EventSource,
}

impl OrderEventStream {
    pub fn connect(api: &ApiClient, token: &str) -> Result<Self, TrackerError> {
        // Long-lived connection: no request timeout on this client.
        let sse_client = reqwest::Client::builder()
            .build()
            .map_err(|err| TrackerError::Internal(format!("failed to build sse client: {err}")))?;

        let event_source = sse_client
            .get(api.events_url(token))
            .eventsource()
            .map_err(|err| TrackerError::Internal(format!("failed to open event stream: {err}")))?;

        info!("order event stream opening");
        Ok(Self { event_source })
    }

    pub fn close(&mut self) {
        self.event_source.close();
    }
}

impl Stream for OrderEventStream {
    type Item = Result<OrderEvent, TrackerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.event_source).poll_next(cx) {
                Poll::Ready(Some(Ok(Event::Open))) => {
                    debug!("order event stream opened");
                    continue;
                }
                Poll::Ready(Some(Ok(Event::Message(msg)))) => {
                    match OrderEvent::decode(&msg.event, &msg.data) {
                        Ok(Some(event)) => return Poll::Ready(Some(Ok(event))),
                        Ok(None) => {
                            debug!(event = %msg.event, "ignoring order stream event");
                            continue;
                        }
                        Err(err) => {
                            warn!(event = %msg.event, error = %err, "malformed order stream payload");
                            continue;
                        }
                    }
                }
                Poll::Ready(Some(Err(EventSourceError::InvalidStatusCode(status, _))))
                    if status == StatusCode::UNAUTHORIZED =>
                {
                    self.event_source.close();
                    return Poll::Ready(Some(Err(TrackerError::Auth)));
                }
                Poll::Ready(Some(Err(EventSourceError::StreamEnded))) => {
                    debug!("order event stream ended, reconnecting");
                    continue;
                }
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Some(Err(TrackerError::Network(err.to_string()))));
                }
                Poll::Ready(None) => {
                    info!("order event stream closed");
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for OrderEventStream {
    fn drop(&mut self) {
        self.event_source.close();
    }
}
