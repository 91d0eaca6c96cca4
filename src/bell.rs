use std::sync::Arc;
use tokio::sync::Notify;

/// Cross-thread wakeup for the link loop.
///
/// Any thread may [`ring`](Bell::ring) the bell; the loop task wakes from its
/// poll wait and runs another pass. A ring with no waiter is remembered, so a
/// ring that races the loop entering its wait is never lost.
#[derive(Clone, Default)]
pub struct Bell {
    notify: Arc<Notify>,
}

impl Bell {
    pub fn new() -> Bell {
        Bell::default()
    }

    /// Wake the loop task. Cheap, non-blocking, callable from any thread.
    pub fn ring(&self) {
        self.notify.notify_one();
    }

    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ring_before_wait_is_not_lost() {
        let bell = Bell::new();
        bell.ring();
        tokio::time::timeout(Duration::from_secs(1), bell.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ring_wakes_other_task() {
        let bell = Bell::new();
        let waiter = bell.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bell.ring();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
