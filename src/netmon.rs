//! Network change notification.
//!
//! Watches the rtnetlink address multicast groups and fans a unit tick
//! out to subscribers whenever an interface gains or loses an address.
//! Consumers treat a tick as "re-check your network posture": drop
//! caches, re-handshake, re-resolve. Delivery is lossy: subscriber
//! channels hold one pending tick, redundant ticks are dropped, and
//! consumers must be idempotent.

use futures::StreamExt;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::RouteNetlinkMessage;
use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR};
use netlink_sys::{AsyncSocket, SocketAddr};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Errors from starting the monitor.
#[derive(Debug, Error)]
pub enum NetMonError {
    #[error("netlink connection failed: {0}")]
    Connection(std::io::Error),

    #[error("failed to join address notification groups: {0}")]
    Bind(std::io::Error),
}

type Subscribers = Arc<Mutex<Vec<mpsc::Sender<()>>>>;

/// Coalescing network-event bus.
pub struct NetMonitor {
    subscribers: Subscribers,
    task: JoinHandle<()>,
    /// The connection task exits once every request handle is gone, so
    /// the monitor keeps one for its lifetime.
    _handle: rtnetlink::Handle,
}

impl NetMonitor {
    /// Bind the notification socket and start the fan-out task.
    pub fn spawn() -> Result<Self, NetMonError> {
        let (mut connection, handle, mut messages) =
            rtnetlink::new_connection().map_err(NetMonError::Connection)?;

        let groups = RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;
        let addr = SocketAddr::new(0, groups);
        connection
            .socket_mut()
            .socket_mut()
            .bind(&addr)
            .map_err(NetMonError::Bind)?;
        tokio::spawn(connection);

        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let fanout = subscribers.clone();

        let task = tokio::spawn(async move {
            info!("network monitor started");

            while let Some((message, _)) = messages.next().await {
                let is_address_change = matches!(
                    message.payload,
                    NetlinkPayload::InnerMessage(
                        RouteNetlinkMessage::NewAddress(_) | RouteNetlinkMessage::DelAddress(_)
                    )
                );
                if !is_address_change {
                    continue;
                }

                debug!("interface address change");
                let mut subs = fanout.lock().expect("subscriber list poisoned");
                // A full channel already holds a pending tick; a closed
                // one belongs to a gone consumer.
                subs.retain(|tx| !matches!(tx.try_send(()), Err(mpsc::error::TrySendError::Closed(_))));
            }

            info!("network monitor stopped");
        });

        Ok(Self {
            subscribers,
            task,
            _handle: handle,
        })
    }

    /// Subscribe to change ticks. The channel holds at most one pending
    /// tick; missing one is recovered by the forced-reconnect timer.
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Stop the fan-out task.
    pub fn stop(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The netlink subscription itself needs a live kernel socket; only
    // the fan-out discipline is unit-testable.

    #[tokio::test]
    async fn test_fanout_coalesces_and_drops_closed() {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, rx2) = mpsc::channel(1);
        subscribers.lock().unwrap().push(tx1);
        subscribers.lock().unwrap().push(tx2);
        drop(rx2);

        // Deliver three ticks the way the monitor task does.
        for _ in 0..3 {
            let mut subs = subscribers.lock().unwrap();
            subs.retain(|tx| {
                !matches!(tx.try_send(()), Err(mpsc::error::TrySendError::Closed(_)))
            });
        }

        // Closed subscriber was dropped, live one coalesced to a single tick.
        assert_eq!(subscribers.lock().unwrap().len(), 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }
}
