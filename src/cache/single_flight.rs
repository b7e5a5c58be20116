use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

type Slot<T> = Arc<tokio::sync::Mutex<Option<T>>>;

/// At most one computation per key at a time. Callers that arrive while a
/// computation is running wait for it and share a successful result; after a
/// failure the next waiter computes again.
#[derive(Debug)]
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

/// One caller's hold on a key's slot. The last holder to go, finished or
/// cancelled, removes the slot.
struct SlotLease<'a, T> {
    inflight: &'a Mutex<HashMap<String, Slot<T>>>,
    key: &'a str,
    slot: Option<Slot<T>>,
}

impl<T> Drop for SlotLease<'_, T> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.slot.take());
        if inflight
            .get(self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            inflight.remove(self.key);
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub async fn run<E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lease = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            SlotLease {
                inflight: &self.inflight,
                key,
                slot: Some(Arc::clone(inflight.entry(key.to_string()).or_default())),
            }
        };
        let Some(slot) = lease.slot.as_ref() else {
            return compute().await;
        };
        let mut guard = slot.lock().await;
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }
        let result = compute().await;
        if let Ok(value) = result.as_ref() {
            *guard = Some(value.clone());
        }
        result
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let flight = Arc::new(SingleFlight::<u32>::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("k", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, ()>(42)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_leaders_release_their_slot() {
        let flight = SingleFlight::<u32>::default();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            flight.run("k", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ()>(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(flight.in_flight(), 0);
        assert_eq!(flight.run("k", || async { Ok::<_, ()>(2) }).await, Ok(2));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_are_not_shared() {
        let flight = SingleFlight::<u32>::default();
        let first: Result<u32, &str> = flight.run("k", || async { Err("boom") }).await;
        assert_eq!(first, Err("boom"));
        let second: Result<u32, &str> = flight.run("k", || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
    }
}
