//! Method blacklist.

use std::collections::HashSet;

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Flow, Stage};
use crate::rpc::{RequestSession, RpcResponse};

/// Answers blacklisted methods with a disabled-method error.
#[derive(Debug, Default)]
pub struct DisableStage {
    disabled: HashSet<String>,
}

impl DisableStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rpc_method_to_blacklist(&mut self, method: impl Into<String>) {
        self.disabled.insert(method.into());
    }

    pub fn is_disabled(&self, method: &str) -> bool {
        self.disabled.contains(method)
    }
}

impl Stage for DisableStage {
    fn name(&self) -> &'static str {
        "disable"
    }

    fn on_rpc_request(&self, session: &mut RequestSession) -> ProxyResult<Flow> {
        let request = session.request()?;
        if !self.is_disabled(&request.method) {
            return Ok(Flow::Continue);
        }

        let id = request.id;
        let err = ProxyError::MethodDisabled(request.method.clone());
        tracing::debug!(connection_id = %session.connection_id(), request_id = id, error = %err, "Rejecting disabled method");
        session.fill_response(RpcResponse::failure(id, err.to_rpc_error()))?;
        Ok(Flow::Stop)
    }
}
