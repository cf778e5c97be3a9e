use async_trait::async_trait;
use dyn_clone::DynClone;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

use crate::transport::{BranchRequest, CallError, Transport};

/// Participant code invoked in-process by [`LocalTransport`].
#[async_trait]
pub trait BranchHandler: DynClone + Send + Sync {
    async fn handle(&self, request: BranchRequest) -> Result<(), CallError>;
}

dyn_clone::clone_trait_object!(BranchHandler);

/// Routes branch calls to handlers registered per endpoint, without a network.
#[derive(Clone, Default)]
pub struct LocalTransport {
    handlers: Arc<RwLock<HashMap<String, Box<dyn BranchHandler>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<H: BranchHandler + 'static>(self, endpoint: impl Into<String>, handler: H) -> Self {
        self.handlers
            .write()
            .insert(endpoint.into(), Box::new(handler));

        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: BranchRequest) -> Result<(), CallError> {
        let handler = self.handlers.read().get(&request.endpoint).cloned();

        match handler {
            Some(handler) => handler.handle(request).await,
            None => Err(CallError::Unreachable(format!(
                "no handler for {}",
                request.endpoint
            ))),
        }
    }
}
