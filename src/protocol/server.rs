//! Server role: handler registry with duplicate detection.
//!
//! One handler per frame type. A retransmitted request reuses its message
//! id, so each registered type keeps a bounded recently-seen id set and
//! hands the handler an `is_new` flag instead of filtering duplicates
//! itself: a chunk request must not be re-applied, but its response must
//! still be resent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{trace, warn};

use crate::core::body;
use crate::core::frame::Frame;
use crate::error::Result;
use crate::utils::dedup::SeenCache;

/// Metadata for one inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// Datagram sender, when the endpoint runs over UDP.
    pub peer: Option<SocketAddr>,
    pub message_id: i64,
}

/// Raw request handler. Returning `Ok(None)` drops the request silently;
/// returning a body sends it back with the paired response type and the
/// request's message id.
pub trait FrameHandler: Send + Sync {
    fn handle(
        &self,
        ctx: RequestContext,
        is_new: bool,
        request_body: Bytes,
    ) -> BoxFuture<'_, Result<Option<Bytes>>>;
}

/// Adapt a typed async closure into a [`FrameHandler`] by decoding the
/// request body from JSON and encoding the optional response back.
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> Arc<dyn FrameHandler>
where
    Req: serde::de::DeserializeOwned + Send + 'static,
    Resp: serde::Serialize + Send + 'static,
    F: Fn(RequestContext, bool, Req) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Resp>>> + Send + 'static,
{
    struct Typed<F, Req> {
        f: F,
        _req: std::marker::PhantomData<fn(Req)>,
    }

    impl<Req, Resp, F, Fut> FrameHandler for Typed<F, Req>
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Resp: serde::Serialize + Send + 'static,
        F: Fn(RequestContext, bool, Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<Resp>>> + Send + 'static,
    {
        fn handle(
            &self,
            ctx: RequestContext,
            is_new: bool,
            request_body: Bytes,
        ) -> BoxFuture<'_, Result<Option<Bytes>>> {
            let request = body::decode::<Req>(&request_body);
            let fut = request.map(|req| (self.f)(ctx, is_new, req));
            Box::pin(async move {
                match fut?.await? {
                    Some(resp) => Ok(Some(body::encode(&resp)?)),
                    None => Ok(None),
                }
            })
        }
    }

    Arc::new(Typed {
        f,
        _req: std::marker::PhantomData,
    })
}

struct Registration {
    handler: Arc<dyn FrameHandler>,
    seen: SeenCache,
}

/// Per-endpoint handler registry.
pub(crate) struct ServerManager {
    handlers: Mutex<HashMap<i32, Registration>>,
}

impl ServerManager {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, frame_type: i32, handler: Arc<dyn FrameHandler>) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.insert(
            frame_type,
            Registration {
                handler,
                seen: SeenCache::new(),
            },
        );
    }

    pub(crate) fn unregister(&self, frame_type: i32) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&frame_type);
    }

    /// Route an inbound request. Returns the response frame to send back,
    /// if any. The handler is invoked with the registry lock released so a
    /// handler may register or unregister types on the same endpoint.
    pub(crate) async fn dispatch(
        &self,
        peer: Option<SocketAddr>,
        frame: Frame,
    ) -> Option<Frame> {
        let (handler, is_new) = {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            let registration = match handlers.get_mut(&frame.frame_type) {
                Some(r) => r,
                None => {
                    trace!(frame_type = frame.frame_type, "No handler, dropping frame");
                    return None;
                }
            };
            let is_new = registration.seen.check_new(frame.message_id);
            (registration.handler.clone(), is_new)
        };

        let ctx = RequestContext {
            peer,
            message_id: frame.message_id,
        };
        match handler.handle(ctx, is_new, frame.body).await {
            Ok(Some(resp_body)) => Some(Frame::new(
                frame.frame_type + 1,
                frame.message_id,
                resp_body,
            )),
            Ok(None) => None,
            Err(e) => {
                warn!(frame_type = frame.frame_type, error = %e, "Handler failed, dropping request");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_requests_see_is_new_false() {
        let manager = ServerManager::new();
        manager.register(
            4,
            typed_handler(|_ctx, is_new, _req: ()| async move { Ok(Some(is_new)) }),
        );

        let first = manager
            .dispatch(None, Frame::new(4, 77, Bytes::new()))
            .await
            .unwrap();
        assert_eq!(first.frame_type, 5);
        assert_eq!(first.message_id, 77);
        assert_eq!(body::decode::<bool>(&first.body).unwrap(), true);

        let retransmit = manager
            .dispatch(None, Frame::new(4, 77, Bytes::new()))
            .await
            .unwrap();
        assert_eq!(body::decode::<bool>(&retransmit.body).unwrap(), false);
    }

    #[tokio::test]
    async fn unregistered_types_are_dropped() {
        let manager = ServerManager::new();
        assert!(manager
            .dispatch(None, Frame::new(9, 1, Bytes::new()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn none_response_drops_silently() {
        let manager = ServerManager::new();
        manager.register(
            0,
            typed_handler(|_ctx, _is_new, _req: ()| async move { Ok(None::<()>) }),
        );
        assert!(manager
            .dispatch(None, Frame::new(0, 1, Bytes::new()))
            .await
            .is_none());
    }
}
