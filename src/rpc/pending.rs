// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::errors::RpcError;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub(crate) type ReplyResult = Result<Vec<u8>, RpcError>;

/// One in-flight request waiting for its reply.
pub(crate) struct RpcPendingRequest {
    pub(crate) correlation_id: String,
    reply: oneshot::Sender<ReplyResult>,
    cancellation: CancellationToken,
}

impl RpcPendingRequest {
    pub(crate) fn new(
        correlation_id: &str,
        reply: oneshot::Sender<ReplyResult>,
        cancellation: CancellationToken,
    ) -> RpcPendingRequest {
        RpcPendingRequest {
            correlation_id: correlation_id.to_owned(),
            reply,
            cancellation,
        }
    }

    /// Resolves the waiting caller; releases its cancellation.
    pub(crate) fn complete(self, result: ReplyResult) {
        // the caller may already be gone
        let _ = self.reply.send(result);
        self.cancellation.cancel();
    }
}

/// Correlation table of a client.
///
/// Entries are only inserted when absent and only removed through
/// [`take`](PendingRequests::take), so each request completes at most once no
/// matter which of reply, timeout or cancellation comes first.
#[derive(Default)]
pub(crate) struct PendingRequests {
    requests: DashMap<String, RpcPendingRequest>,
}

impl PendingRequests {
    pub(crate) fn insert(&self, request: RpcPendingRequest) -> Result<(), RpcError> {
        match self.requests.entry(request.correlation_id.clone()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateCorrelationId(request.correlation_id)),
            Entry::Vacant(entry) => {
                entry.insert(request);
                Ok(())
            }
        }
    }

    pub(crate) fn take(&self, correlation_id: &str) -> Option<RpcPendingRequest> {
        self.requests.remove(correlation_id).map(|(_, request)| request)
    }

    pub(crate) fn drain(&self) -> Vec<RpcPendingRequest> {
        let ids: Vec<String> = self.requests.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter_map(|id| self.take(id)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn contains(&self, correlation_id: &str) -> bool {
        self.requests.contains_key(correlation_id)
    }
}
