//! In-memory implementations of the API traits. Every call is recorded so
//! tests can assert on the exact mutations a reconciliation issued.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::sync::Mutex;

use crate::error::ApiError;

mod compute;
mod load_balancing;
mod metadata;

pub use compute::{ComputeState, FakeCompute};
pub use load_balancing::{FakeLoadBalancer, FakeLoadBalancing, LoadBalancingState};
pub use metadata::FakeMetadata;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    pub target: String,
}

impl Call {
    /// Describe and read calls don't change remote state
    pub fn is_mutating(&self) -> bool {
        !(self.operation.starts_with("read_") || self.operation.starts_with("describe_"))
    }
}

#[derive(Debug, Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ApiError>>>,
}

impl Recorder {
    /// Records the call, failing it when an error was queued for the operation
    pub async fn record(&self, operation: &'static str, target: &str) -> Result<(), ApiError> {
        self.calls.lock().await.push(Call {
            operation,
            target: target.to_owned(),
        });

        match self
            .failures
            .lock()
            .await
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub async fn fail_next(&self, operation: &'static str, error: ApiError) {
        self.failures
            .lock()
            .await
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_to(&self, operation: &str) -> Vec<Call> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    pub async fn mutating_calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.is_mutating())
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.calls.lock().await.clear();
    }
}

/// The three fakes bundled together
#[derive(Debug, Default, Clone)]
pub struct FakeCloud {
    pub compute: Arc<FakeCompute>,
    pub load_balancing: Arc<FakeLoadBalancing>,
    pub metadata: Arc<FakeMetadata>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mutating_calls(&self) -> Vec<Call> {
        let mut calls = self.compute.recorder.mutating_calls().await;
        calls.extend(self.load_balancing.recorder.mutating_calls().await);

        calls
    }

    pub async fn clear_calls(&self) {
        self.compute.recorder.clear().await;
        self.load_balancing.recorder.clear().await;
    }
}

pub(crate) fn not_found(code: &str, id: &str) -> ApiError {
    ApiError::new(code, format!("The resource '{id}' doesn't exist."))
}
