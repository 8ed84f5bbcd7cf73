use std::{collections::HashMap, sync::Arc, time::Duration};

use tether_models::{DeviceKey, codes};
use tether_tunnel::{Session, Stream};
use tokio::{
    sync::{RwLock, watch},
    time::Instant,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("device {0} is not connected")]
    Unreachable(DeviceKey),
    #[error("timed out waiting for device {0}")]
    Timeout(DeviceKey),
    #[error("connection to device {0} went away")]
    Defunct(DeviceKey),
}

impl BrokerError {
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::Unreachable(_) => codes::DEVICE_CONNECTION_FAILURE,
            BrokerError::Timeout(_) => codes::DEVICE_CONNECTION_TIMEOUT,
            BrokerError::Defunct(_) => codes::DEVICE_CHANNEL_DEFUNCT,
        }
    }
}

struct BrokerInner {
    sessions: RwLock<HashMap<DeviceKey, Session>>,
    // Bumped on every registration so waiting dialers re-check the registry.
    registrations: watch::Sender<u64>,
    reconnect_grace: Duration,
}

/// Registry of the one live session per device.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(reconnect_grace: Duration) -> Self {
        let (registrations, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                sessions: RwLock::new(HashMap::new()),
                registrations,
                reconnect_grace,
            }),
        }
    }

    /// Installs `session` for `key`, retiring whatever was there before.
    pub async fn register(&self, key: DeviceKey, session: Session) {
        {
            let mut sessions = self.inner.sessions.write().await;
            if let Some(previous) = sessions.remove(&key) {
                if !previous.same(&session) {
                    tracing::info!(device = %key, "retiring previous device session");
                    previous.shutdown();
                }
            }
            sessions.insert(key, session);
        }
        self.inner.registrations.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Removes `session` if it is still the registered one for `key`.
    pub async fn unregister(&self, key: &DeviceKey, session: &Session) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.get(key).is_some_and(|s| s.same(session)) {
            sessions.remove(key);
            return true;
        }
        false
    }

    pub async fn get(&self, key: &DeviceKey) -> Option<Session> {
        self.inner.sessions.read().await.get(key).cloned()
    }

    pub async fn connected(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<DeviceKey> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Opens a fresh exchange to the device behind `key`.
    ///
    /// With no live session the call waits for a registration until the
    /// reconnect grace window or `deadline` runs out, whichever comes first.
    pub async fn open(&self, key: &DeviceKey, deadline: Instant) -> Result<Stream, BrokerError> {
        let grace_end = Instant::now() + self.inner.reconnect_grace;
        let mut registrations = self.inner.registrations.subscribe();

        loop {
            if let Some(session) = self.get(key).await.filter(|s| !s.is_closed()) {
                return match tokio::time::timeout_at(deadline, session.open_stream()).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(_)) => Err(BrokerError::Defunct(key.clone())),
                    Err(_) => Err(BrokerError::Timeout(key.clone())),
                };
            }

            let wait_until = grace_end.min(deadline);
            match tokio::time::timeout_at(wait_until, registrations.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(BrokerError::Unreachable(key.clone())),
                Err(_) if deadline <= grace_end => return Err(BrokerError::Timeout(key.clone())),
                Err(_) => return Err(BrokerError::Unreachable(key.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::new("project", "device")
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn replacement_retires_previous_session() {
        let broker = Broker::new(Duration::from_millis(50));
        let (c1, d1) = Session::pair();
        let (c2, d2) = Session::pair();

        broker.register(key(), c1.clone()).await;
        broker.register(key(), c2.clone()).await;

        assert!(c1.is_closed());
        assert!(c1.open_stream().await.is_err());
        within(d1.closed()).await;

        let mut stream = broker.open(&key(), far()).await.unwrap();
        stream.send(b"hello").await.unwrap();
        let mut remote = within(d2.accept()).await.unwrap();
        assert_eq!(within(remote.recv()).await.unwrap(), b"hello");
        assert!(within(d1.accept()).await.is_none());
    }

    #[tokio::test]
    async fn unknown_device_is_unreachable_before_deadline() {
        let broker = Broker::new(Duration::from_millis(50));
        let started = Instant::now();
        let deadline = started + Duration::from_secs(2);

        let err = broker.open(&key(), deadline).await.unwrap_err();

        assert_eq!(err, BrokerError::Unreachable(key()));
        assert_eq!(err.status_code(), codes::DEVICE_CONNECTION_FAILURE);
        assert!(Instant::now() < deadline);
    }

    #[tokio::test]
    async fn short_deadline_reports_timeout() {
        let broker = Broker::new(Duration::from_secs(10));
        let deadline = Instant::now() + Duration::from_millis(50);

        let err = broker.open(&key(), deadline).await.unwrap_err();

        assert_eq!(err, BrokerError::Timeout(key()));
        assert_eq!(err.status_code(), codes::DEVICE_CONNECTION_TIMEOUT);
    }

    #[tokio::test]
    async fn waits_for_reconnecting_device_within_grace() {
        let broker = Broker::new(Duration::from_secs(2));
        let (controller, device) = Session::pair();

        let registrar = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registrar.register(key(), controller).await;
        });

        let stream = broker.open(&key(), far()).await.unwrap();
        drop(stream);
        assert!(within(device.accept()).await.is_some());
    }

    #[tokio::test]
    async fn closed_session_is_not_dialed() {
        let broker = Broker::new(Duration::from_millis(20));
        let (controller, _device) = Session::pair();
        broker.register(key(), controller.clone()).await;
        controller.shutdown();

        let err = broker.open(&key(), far()).await.unwrap_err();
        assert_eq!(err, BrokerError::Unreachable(key()));
        assert!(broker.connected().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_exchanges_do_not_close_the_channel() {
        let broker = Broker::new(Duration::from_millis(50));
        let (controller, device) = Session::pair();
        broker.register(key(), controller.clone()).await;

        let mut opened = Vec::new();
        for _ in 0..8 {
            opened.push(broker.open(&key(), far()).await.unwrap());
        }
        let mut accepted = Vec::new();
        for _ in 0..8 {
            accepted.push(within(device.accept()).await.unwrap());
        }

        // Close in an interleaved order from both ends.
        for (i, stream) in opened.into_iter().enumerate() {
            if i % 2 == 0 {
                drop(stream);
            } else {
                drop(accepted.remove(0));
                drop(stream);
            }
        }
        drop(accepted);

        assert!(!controller.is_closed());
        let again = broker.open(&key(), far()).await.unwrap();
        again.send(b"next").await.unwrap();
        let mut remote = within(device.accept()).await.unwrap();
        assert_eq!(within(remote.recv()).await.unwrap(), b"next");
    }

    #[tokio::test]
    async fn stale_unregister_keeps_replacement() {
        let broker = Broker::new(Duration::from_millis(50));
        let (c1, _d1) = Session::pair();
        let (c2, _d2) = Session::pair();
        broker.register(key(), c1.clone()).await;
        broker.register(key(), c2.clone()).await;

        assert!(!broker.unregister(&key(), &c1).await);
        assert!(broker.get(&key()).await.unwrap().same(&c2));

        assert!(broker.unregister(&key(), &c2).await);
        assert!(broker.get(&key()).await.is_none());
    }

    #[tokio::test]
    async fn cancelled_open_releases_waiter() {
        let broker = Broker::new(Duration::from_secs(10));
        let res = tokio::time::timeout(
            Duration::from_millis(30),
            broker.open(&key(), Instant::now() + Duration::from_secs(10)),
        )
        .await;
        assert!(res.is_err());

        let (controller, _device) = Session::pair();
        broker.register(key(), controller).await;
        assert!(broker.open(&key(), far()).await.is_ok());
    }
}
