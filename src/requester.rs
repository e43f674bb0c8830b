//! Request seam between the gateway client and the protocol services.
//!
//! Chat and session services are generic over [`Requester`] so tests can
//! substitute an in-memory fake for the live multiplexer.

use serde_json::Value;
use std::future::Future;

use crate::client::GatewayError;

/// A handle that can issue gateway RPCs.
pub trait Requester: Send + Sync {
    /// Issue `method` with `params` and resolve with the response payload.
    fn request(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, GatewayError>> + Send;
}
