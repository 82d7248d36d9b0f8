//! A value that is resolved at most once and observed by any number of
//! waiters

use tokio::sync::watch;

pub(crate) struct SetOnce<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> SetOnce<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the value
    ///
    /// Hands `value` back if it was already resolved.
    pub fn set(&self, value: T) -> Result<(), T> {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        });
        match value {
            None => Ok(()),
            Some(rejected) => Err(rejected),
        }
    }

    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait for the value to be resolved
    pub async fn get(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_set_only_once() {
        let once = SetOnce::new();
        assert_eq!(once.peek(), None);
        assert_eq!(once.set(1), Ok(()));
        assert_eq!(once.set(2), Err(2));
        assert_eq!(once.peek(), Some(1));
    }

    #[tokio::test]
    async fn test_many_waiters_see_same_value() {
        let once = Arc::new(SetOnce::new());

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let once = once.clone();
                tokio::spawn(async move { once.get().await })
            })
            .collect();

        tokio::task::yield_now().await;
        once.set("settings".to_string()).unwrap();

        for waiter in waiters {
            let value = timeout(Duration::from_secs(5), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(value, "settings");
        }

        // Late waiters resolve immediately
        assert_eq!(once.get().await, "settings");
    }
}
