//! End-to-end coverage for driving a `MutationOperation` through `Store::mutate`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use opcore::context::Context;
use opcore::error::OperationError;
use opcore::operation::{MutationAdapter, MutationOperation};
use opcore::path::Path;
use opcore::{Continuation, Store};
use pretty_assertions::assert_eq;

struct CreatePost {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl MutationOperation for CreatePost {
    type Arguments = String;
    type Value = u32;
    type Failure = &'static str;

    fn path(&self) -> Path {
        Path::of("create-post")
    }

    async fn mutate(
        &self,
        arguments: String,
        _context: Context,
        _continuation: Continuation<u32, &'static str>,
    ) -> Result<u32, OperationError<&'static str>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if arguments.is_empty() {
            Err(OperationError::Failed("title must not be empty"))
        } else {
            Ok(arguments.len() as u32)
        }
    }
}

#[tokio::test]
async fn mutate_binds_arguments_into_the_run_and_returns_the_result() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Store::new(MutationAdapter(CreatePost {
        calls: calls.clone(),
    }));

    let result = store.mutate("hello".to_string()).await;
    assert_eq!(result.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.state().value(), Some(&5));
}

#[tokio::test]
async fn each_mutate_call_is_a_fresh_invocation_with_its_own_arguments() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Store::new(MutationAdapter(CreatePost {
        calls: calls.clone(),
    }));

    let first = store.mutate(String::new()).await;
    assert!(first.is_err());
    assert!(store.state().error().is_some());

    let second = store.mutate("world".to_string()).await;
    assert!(second.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.state().value(), Some(&5));
    // A subsequent success clears the prior error, matching `apply_result`'s last-write-wins rule.
    assert!(store.state().error().is_none());
}
