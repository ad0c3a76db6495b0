use crate::error::ProxyError;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Shared result delivered to every caller of one flight
pub type FlightResult<T> = std::result::Result<Arc<T>, Arc<ProxyError>>;

/// Which side of the rendezvous a caller landed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Waiter,
}

/// Removes the in-flight handle even if the compute task panics, so later
/// callers start a fresh flight instead of joining a dead one.
struct FlightGuard<T> {
    map: Arc<Mutex<HashMap<String, broadcast::Sender<FlightResult<T>>>>>,
    key: String,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.map.lock().unwrap().remove(&self.key);
    }
}

/// Coalesces concurrent identical cache misses into one upstream call.
///
/// The first caller for a key becomes the leader and its compute runs in a
/// spawned task; everyone (leader included) waits on a broadcast channel.
/// Cancelling any caller never cancels the shared compute.
pub struct SingleFlight<T> {
    in_flight: Arc<Mutex<HashMap<String, broadcast::Sender<FlightResult<T>>>>>,
}

impl<T: Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `compute` for `key`, or join the flight already running for it.
    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> (FlightResult<T>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>> + Send + 'static,
    {
        // The lock covers only handle installation; the compute itself is
        // spawned afterwards.
        let (mut receiver, leader_sender) = {
            let mut map = self.in_flight.lock().unwrap();
            if let Some(sender) = map.get(key) {
                (sender.subscribe(), None)
            } else {
                let (sender, receiver) = broadcast::channel(1);
                map.insert(key.to_string(), sender.clone());
                (receiver, Some(sender))
            }
        };

        let role = match leader_sender {
            Some(sender) => {
                let guard = FlightGuard {
                    map: Arc::clone(&self.in_flight),
                    key: key.to_string(),
                };
                let future = compute();
                tokio::spawn(async move {
                    let result = future.await.map(Arc::new).map_err(Arc::new);
                    // Drop the handle before waking waiters: a caller
                    // arriving after this point starts a new flight.
                    drop(guard);
                    let _ = sender.send(result);
                });
                FlightRole::Leader
            }
            None => FlightRole::Waiter,
        };

        match receiver.recv().await {
            Ok(result) => (result, role),
            Err(e) => {
                debug!("Flight for key dropped without a result: {e}");
                (
                    Err(Arc::new(ProxyError::Internal(
                        "in-flight fetch terminated without a result".to_string(),
                    ))),
                    role,
                )
            }
        }
    }

    /// Number of flights currently in progress
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

impl<T: Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn single_caller_computes_once() {
        let sf: SingleFlight<String> = SingleFlight::new();
        let (result, role) = sf.run("k", || async { Ok("value".to_string()) }).await;

        assert_eq!(*result.unwrap(), "value");
        assert_eq!(role, FlightRole::Leader);
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_compute() {
        let sf: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let sf = Arc::clone(&sf);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                sf.run("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    Ok("shared".to_string())
                })
                .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (result, role) = handle.await.unwrap();
            assert_eq!(*result.unwrap(), "shared");
            if role == FlightRole::Leader {
                leaders += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let sf: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in ["a", "b", "c"] {
            let sf = Arc::clone(&sf);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                sf.run(key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    Ok(key.to_string())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().0.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_are_shared_with_waiters() {
        let sf: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());

        let sf1 = Arc::clone(&sf);
        let first = tokio::spawn(async move {
            sf1.run("k", || async {
                sleep(Duration::from_millis(30)).await;
                Err(ProxyError::Upstream5xx { status: 500 })
            })
            .await
        });

        sleep(Duration::from_millis(10)).await;
        let (result, role) = sf
            .run("k", || async { Ok("should not run".to_string()) })
            .await;

        assert_eq!(role, FlightRole::Waiter);
        let err = result.unwrap_err();
        assert!(matches!(*err, ProxyError::Upstream5xx { status: 500 }));
        assert!(first.await.unwrap().0.is_err());
    }

    #[tokio::test]
    async fn sequential_calls_compute_again() {
        let sf: SingleFlight<String> = SingleFlight::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let (result, _) = sf
                .run("k", || async { Ok("v".to_string()) })
                .await;
            result.unwrap();
            calls.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_leader_does_not_cancel_the_flight() {
        let sf: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());

        let sf1 = Arc::clone(&sf);
        let leader = tokio::spawn(async move {
            sf1.run("k", || async {
                sleep(Duration::from_millis(50)).await;
                Ok("survived".to_string())
            })
            .await
        });

        // Let the leader install the flight, then join as a waiter
        sleep(Duration::from_millis(10)).await;
        let sf2 = Arc::clone(&sf);
        let waiter =
            tokio::spawn(async move { sf2.run("k", || async { Ok("n/a".to_string()) }).await });

        sleep(Duration::from_millis(10)).await;
        leader.abort();

        let (result, role) = waiter.await.unwrap();
        assert_eq!(role, FlightRole::Waiter);
        assert_eq!(*result.unwrap(), "survived");
    }
}
