use std::time::Duration;
use tracing::{debug, warn, Instrument};

use crate::{
    trace::branch_span,
    transport::{BranchRequest, CallError, Transport},
};

/// Issues single branch calls through a transport, bounded by a timeout.
#[derive(Clone)]
pub struct BranchCaller {
    transport: Box<dyn Transport>,
    pub(crate) timeout: Duration,
}

impl BranchCaller {
    pub fn new<T: Transport + 'static>(transport: T, timeout: Duration) -> Self {
        Self {
            transport: Box::new(transport),
            timeout,
        }
    }

    pub async fn call(&self, request: BranchRequest) -> Result<(), CallError> {
        let span = branch_span(
            &request.gid,
            &request.branch_id,
            request.op,
            &request.endpoint,
        );

        async move {
            let op = request.op;

            let res = match tokio::time::timeout(self.timeout, self.transport.call(request)).await
            {
                Ok(res) => res,
                Err(_) => Err(CallError::Timeout(self.timeout)),
            };

            match &res {
                Ok(()) => debug!("{op} succeeded"),
                Err(e) => warn!("{op} failed: {e}"),
            }

            res
        }
        .instrument(span)
        .await
    }
}
