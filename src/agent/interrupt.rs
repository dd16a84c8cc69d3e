use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared flag set by Ctrl+C and checked at stream chunks, approval prompts and cycle boundaries.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Drives `future` to completion unless the handle trips first, in which case `None` is returned.
pub async fn await_or_interrupt<F>(future: F, interrupt: &InterruptHandle) -> Option<F::Output>
where
    F: Future,
{
    let mut future = Box::pin(future);
    loop {
        if interrupt.is_interrupted() {
            return None;
        }
        if let Ok(output) = tokio::time::timeout(INTERRUPT_POLL_INTERVAL, &mut future).await {
            return Some(output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_when_not_interrupted() {
        let handle = InterruptHandle::new();
        assert_eq!(await_or_interrupt(async { 7 }, &handle).await, Some(7));
    }

    #[tokio::test]
    async fn pending_future_is_abandoned_on_interrupt() {
        let handle = InterruptHandle::new();
        let trigger = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.interrupt();
        });
        let result = await_or_interrupt(std::future::pending::<()>(), &handle).await;
        assert!(result.is_none());
        handle.reset();
        assert!(!handle.is_interrupted());
    }
}
