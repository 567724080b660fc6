/*!
Flush pipelines from a `tokio` runtime.
*/

use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};

use crate::pipeline::Pipeline;

/**
Wait for every event published before this call to be dispatched, and for sinks to flush.

If the current thread is a worker of a multi-threaded `tokio` runtime then this call will be executed using [`tokio::task::block_in_place`] to avoid starving other work.
*/
pub fn blocking_flush(pipeline: &Pipeline, timeout: Duration) -> bool {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| pipeline.blocking_flush(timeout))
        }
        _ => pipeline.blocking_flush(timeout),
    }
}

/**
Wait for every event published before this call to be dispatched.

This function is an asynchronous variant of [`blocking_flush`]. It doesn't flush sinks.
*/
pub async fn flush(pipeline: &Pipeline, timeout: Duration) -> bool {
    let (notifier, notified) = tokio::sync::oneshot::channel();

    pipeline.when_flushed(move || {
        let _ = notifier.send(());
    });

    wait(notified, timeout).await
}

async fn wait(mut notified: tokio::sync::oneshot::Receiver<()>, timeout: Duration) -> bool {
    if notified.try_recv().is_ok() {
        return true;
    }

    // The watcher hasn't fired, so there's no point waiting for nothing
    if timeout == Duration::ZERO {
        return false;
    }

    match tokio::time::timeout(timeout, notified).await {
        Ok(Ok(())) => true,
        // The pipeline dropped the watcher; that only happens once it's stopped
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}
