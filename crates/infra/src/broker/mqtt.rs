//! MQTT broker backend (rumqttc).
//!
//! One client connection per process. A background task drives the MQTT event loop:
//! it forwards every incoming publish to the [`MessageHandler`] and, after each fresh
//! session (`ConnAck`), re-issues every active filter so a reconnect does not lose
//! live subscriptions.
//!
//! A subscribe resolves only on the broker's SUBACK. rumqttc reports the packet id of
//! a subscribe when it goes out (`Outgoing::Subscribe`), and requests leave in the
//! order they were queued, so [`Acks`] pairs each waiting caller with its packet id
//! by position and then with the SUBACK carrying that id.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode, Transport,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use geobus_core::TopicFilter;
use geobus_events::{Broker, BrokerError, MessageHandler};

use crate::config::MqttConfig;

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

type AckReply = oneshot::Sender<Result<(), BrokerError>>;

struct PendingAck {
    filter: String,
    reply: AckReply,
}

/// Subscribe requests awaiting their SUBACK.
///
/// `queued` mirrors the client's request queue: one slot per subscribe request not
/// yet written, `None` for requests nobody waits on (resubscribes after a reconnect).
#[derive(Default)]
struct Acks {
    queued: VecDeque<Option<PendingAck>>,
    sent: HashMap<u16, PendingAck>,
}

impl Acks {
    fn queue(&mut self, pending: Option<PendingAck>) {
        self.queued.push_back(pending);
    }

    /// Undo the last `queue` after the request could not be handed to the client.
    fn unqueue_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(Some(pending)) => {
                self.sent.insert(pkid, pending);
            }
            Some(None) => {}
            None => debug!(pkid, "untracked mqtt subscribe sent"),
        }
    }

    fn acked(&mut self, pkid: u16, codes: &[SubscribeReasonCode]) {
        if let Some(pending) = self.sent.remove(&pkid) {
            let result = suback_result(&pending.filter, codes);
            let _ = pending.reply.send(result);
        }
    }

    /// Requests already written die with the connection; queued ones go out after
    /// the reconnect.
    fn connection_lost(&mut self, reason: &str) {
        for (_, pending) in self.sent.drain() {
            let _ = pending.reply.send(Err(BrokerError::Unavailable(format!(
                "connection lost before SUBACK: {reason}"
            ))));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        self.connection_lost(reason);
        for pending in self.queued.drain(..).flatten() {
            let _ = pending
                .reply
                .send(Err(BrokerError::Unavailable(reason.to_string())));
        }
    }
}

fn suback_result(filter: &str, codes: &[SubscribeReasonCode]) -> Result<(), BrokerError> {
    if codes.is_empty() {
        return Err(BrokerError::Rejected {
            filter: filter.to_string(),
            reason: "SUBACK carried no return code".to_string(),
        });
    }
    if codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(BrokerError::Rejected {
            filter: filter.to_string(),
            reason: "SUBACK returned failure".to_string(),
        });
    }
    Ok(())
}

fn lock_acks(acks: &Mutex<Acks>) -> Result<std::sync::MutexGuard<'_, Acks>, BrokerError> {
    acks.lock()
        .map_err(|_| BrokerError::Unavailable("mqtt ack tracker poisoned".to_string()))
}

pub struct MqttBroker {
    client: AsyncClient,
    filters: Arc<Mutex<BTreeSet<TopicFilter>>>,
    acks: Arc<Mutex<Acks>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl core::fmt::Debug for MqttBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MqttBroker").finish_non_exhaustive()
    }
}

impl MqttBroker {
    /// Create the client and start driving its event loop on the current runtime.
    ///
    /// The connection itself is established asynchronously by the event loop.
    pub fn connect(config: &MqttConfig, handler: Arc<dyn MessageHandler>) -> Result<Self, BrokerError> {
        let options = mqtt_options(config)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let filters = Arc::new(Mutex::new(BTreeSet::new()));
        let acks = Arc::new(Mutex::new(Acks::default()));

        let task = tokio::spawn(drive(
            event_loop,
            client.clone(),
            filters.clone(),
            acks.clone(),
            handler,
        ));
        info!(broker = %config.broker_url, client_id = %config.client_id, "mqtt client started");

        Ok(Self {
            client,
            filters,
            acks,
            event_loop: Mutex::new(Some(task)),
        })
    }

    /// Send DISCONNECT and let the event loop flush it before stopping.
    pub async fn disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "mqtt disconnect request failed");
        }
        let task = self.event_loop.lock().ok().and_then(|mut t| t.take());
        let Some(mut task) = task else {
            return;
        };
        match tokio::time::timeout(DISCONNECT_GRACE, &mut task).await {
            Ok(_) => info!("mqtt client disconnected"),
            Err(_) => {
                warn!("mqtt event loop did not stop in time; aborting it");
                task.abort();
            }
        }
    }

    fn remember(&self, filter: &TopicFilter, active: bool) {
        if let Ok(mut filters) = self.filters.lock() {
            if active {
                filters.insert(filter.clone());
            } else {
                filters.remove(filter);
            }
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    /// Resolves on the SUBACK. Fails fast when the client's request queue is full.
    async fn subscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
        let (reply, ack) = oneshot::channel();
        {
            let mut acks = lock_acks(&self.acks)?;
            acks.queue(Some(PendingAck {
                filter: filter.as_str().to_string(),
                reply,
            }));
            if let Err(err) = self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                acks.unqueue_last();
                return Err(BrokerError::Unavailable(err.to_string()));
            }
        }

        match tokio::time::timeout(SUBACK_TIMEOUT, ack).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(BrokerError::Unavailable("mqtt event loop stopped".to_string()));
            }
            Err(_) => {
                return Err(BrokerError::Unavailable(format!(
                    "no SUBACK within {SUBACK_TIMEOUT:?}"
                )));
            }
        }
        self.remember(filter, true);
        debug!(filter = %filter, "mqtt subscription acknowledged");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &TopicFilter) -> Result<(), BrokerError> {
        self.remember(filter, false);
        self.client
            .try_unsubscribe(filter.as_str())
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }
}

fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, BrokerError> {
    let url = url::Url::parse(&config.broker_url)
        .map_err(|e| BrokerError::Unavailable(format!("invalid broker url: {e}")))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BrokerError::Unavailable("broker url has no host".to_string()))?;

    let (tls, default_port) = match url.scheme() {
        "mqtt" | "tcp" => (false, 1883),
        "mqtts" | "ssl" => (true, 8883),
        other => {
            return Err(BrokerError::Unavailable(format!(
                "unsupported broker scheme '{other}'"
            )));
        }
    };

    let mut options = MqttOptions::new(
        config.client_id.clone(),
        host.to_string(),
        url.port().unwrap_or(default_port),
    );
    options.set_keep_alive(config.keep_alive.max(Duration::from_secs(5)));
    if tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    filters: Arc<Mutex<BTreeSet<TopicFilter>>>,
    acks: Arc<Mutex<Acks>>,
    handler: Arc<dyn MessageHandler>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => handler.on_message(&publish.topic),
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let active: Vec<TopicFilter> = filters
                    .lock()
                    .map(|f| f.iter().cloned().collect())
                    .unwrap_or_default();
                info!(filters = active.len(), "mqtt session established");
                let Ok(mut acks) = acks.lock() else { continue };
                for filter in active {
                    acks.queue(None);
                    if let Err(err) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        acks.unqueue_last();
                        warn!(filter = %filter, error = %err, "mqtt resubscribe failed");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                if let Ok(mut acks) = acks.lock() {
                    acks.sent(pkid);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                if let Ok(mut acks) = acks.lock() {
                    acks.acked(suback.pkid, &suback.return_codes);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                let reason = err.to_string();
                if let Ok(mut acks) = acks.lock() {
                    acks.connection_lost(&reason);
                }
                warn!(error = %reason, "mqtt connection error; reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    if let Ok(mut acks) = acks.lock() {
        acks.fail_all("mqtt client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> MqttConfig {
        MqttConfig {
            broker_url: url.to_string(),
            client_id: "geobus-test".to_string(),
            keep_alive: Duration::from_secs(30),
        }
    }

    #[test]
    fn builds_options_from_url() {
        let options = mqtt_options(&config("tcp://localhost:1884")).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1884));
        assert_eq!(options.client_id(), "geobus-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn tls_schemes_use_default_port() {
        let options = mqtt_options(&config("mqtts://mqtt.digitransit.fi")).unwrap();
        assert_eq!(options.broker_address(), ("mqtt.digitransit.fi".to_string(), 8883));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(mqtt_options(&config("http://localhost")).is_err());
    }

    fn pending(filter: &str) -> (PendingAck, oneshot::Receiver<Result<(), BrokerError>>) {
        let (reply, ack) = oneshot::channel();
        let pending = PendingAck {
            filter: filter.to_string(),
            reply,
        };
        (pending, ack)
    }

    #[test]
    fn suback_failure_code_is_a_rejection() {
        let ok = [SubscribeReasonCode::Success(QoS::AtMostOnce)];
        assert_eq!(suback_result("a/#", &ok), Ok(()));

        let err = suback_result("a/#", &[SubscribeReasonCode::Failure]).unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { ref filter, .. } if filter == "a/#"));
        assert!(matches!(suback_result("a/#", &[]), Err(BrokerError::Rejected { .. })));
    }

    #[test]
    fn acks_pair_callers_with_packet_ids_in_send_order() {
        let mut acks = Acks::default();
        let (first, mut first_ack) = pending("/+/one/#");
        let (second, mut second_ack) = pending("/+/two/#");

        acks.queue(Some(first));
        acks.queue(None);
        acks.queue(Some(second));
        acks.sent(7);
        acks.sent(8);
        acks.sent(9);
        assert!(acks.queued.is_empty());
        assert_eq!(acks.sent.len(), 2);

        acks.acked(9, &[SubscribeReasonCode::Failure]);
        acks.acked(7, &[SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        acks.acked(8, &[SubscribeReasonCode::Success(QoS::AtMostOnce)]);

        assert_eq!(first_ack.try_recv().unwrap(), Ok(()));
        assert!(matches!(
            second_ack.try_recv().unwrap(),
            Err(BrokerError::Rejected { ref filter, .. }) if filter == "/+/two/#"
        ));
    }

    #[test]
    fn lost_connection_fails_written_requests_only() {
        let mut acks = Acks::default();
        let (written, mut written_ack) = pending("/+/one/#");
        let (queued, mut queued_ack) = pending("/+/two/#");

        acks.queue(Some(written));
        acks.sent(1);
        acks.queue(Some(queued));
        acks.connection_lost("reset by peer");

        assert!(matches!(
            written_ack.try_recv().unwrap(),
            Err(BrokerError::Unavailable(_))
        ));
        assert!(queued_ack.try_recv().is_err());

        acks.sent(2);
        acks.acked(2, &[SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        assert_eq!(queued_ack.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn stopping_fails_every_waiter() {
        let mut acks = Acks::default();
        let (written, mut written_ack) = pending("/+/one/#");
        let (queued, mut queued_ack) = pending("/+/two/#");
        acks.queue(Some(written));
        acks.sent(1);
        acks.queue(Some(queued));

        acks.fail_all("mqtt client disconnected");

        assert!(written_ack.try_recv().unwrap().is_err());
        assert!(queued_ack.try_recv().unwrap().is_err());
        assert!(acks.queued.is_empty() && acks.sent.is_empty());
    }
}
