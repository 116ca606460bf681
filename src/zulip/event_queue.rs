//! Long-poll subscriptions to the Zulip event feed.
//!
//! Each subscription runs in its own task: register, poll, deliver events in
//! ascending id order, and re-register transparently when the server forgets
//! the queue. Unsubscribing cancels the in-flight poll request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RegisterRequest, RegisterResponse, ZulipClient, ZulipError, ZulipEvent};
use crate::error::BridgeError;

/// Remote side of the event feed.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn register_queue(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, ZulipError>;
    async fn get_events(
        &self,
        queue_id: &str,
        last_event_id: i64,
        timeout: Duration,
    ) -> Result<Vec<ZulipEvent>, ZulipError>;
    async fn delete_queue(&self, queue_id: &str) -> Result<(), ZulipError>;
}

#[async_trait]
impl EventFeed for ZulipClient {
    async fn register_queue(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, ZulipError> {
        ZulipClient::register_queue(self, request).await
    }

    async fn get_events(
        &self,
        queue_id: &str,
        last_event_id: i64,
        timeout: Duration,
    ) -> Result<Vec<ZulipEvent>, ZulipError> {
        ZulipClient::get_events(self, queue_id, last_event_id, timeout).await
    }

    async fn delete_queue(&self, queue_id: &str) -> Result<(), ZulipError> {
        ZulipClient::delete_queue(self, queue_id).await
    }
}

/// Receives every event of a subscription, one at a time and in order.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: ZulipEvent);

    /// Called after every successful registration, including silent re-registrations.
    async fn on_registered(&self, _response: &RegisterResponse) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    #[default]
    Unregistered,
    Registered,
    Polling,
    Closed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    pub queue_id: Option<String>,
    pub last_event_id: i64,
    pub event_types: Vec<String>,
    pub poll_timeout_secs: u64,
    pub events_received: u64,
    pub poll_errors: u64,
    pub reregistrations: u64,
}

impl SubscriptionStatus {
    fn new(request: &RegisterRequest) -> Self {
        Self {
            state: SubscriptionState::Unregistered,
            queue_id: None,
            last_event_id: -1,
            event_types: request.event_types.clone(),
            poll_timeout_secs: super::DEFAULT_LONGPOLL_TIMEOUT_SECS,
            events_received: 0,
            poll_errors: 0,
            reregistrations: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    status: Arc<RwLock<SubscriptionStatus>>,
}

impl SubscriptionHandle {
    pub fn status(&self) -> SubscriptionStatus {
        self.status.read().clone()
    }
}

struct SubscriptionEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: Arc<RwLock<SubscriptionStatus>>,
}

pub struct EventQueueClient {
    feed: Arc<dyn EventFeed>,
    poll_delay: Duration,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
}

impl EventQueueClient {
    pub fn new(feed: Arc<dyn EventFeed>, poll_delay: Duration) -> Self {
        Self {
            feed,
            poll_delay,
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a queue and starts polling it in the background.
    pub async fn register(
        &self,
        request: RegisterRequest,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Result<SubscriptionHandle, BridgeError> {
        let response = self
            .feed
            .register_queue(&request)
            .await
            .map_err(|e| BridgeError::Registration(e.to_string()))?;

        info!(
            queue_id = %response.queue_id,
            last_event_id = response.last_event_id,
            event_types = ?request.event_types,
            "registered zulip event queue"
        );
        dispatcher.on_registered(&response).await;

        let status = Arc::new(RwLock::new(SubscriptionStatus::new(&request)));
        let cancel = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let poller = Poller {
            feed: self.feed.clone(),
            dispatcher,
            request,
            status: status.clone(),
            cancel: cancel.clone(),
            poll_delay: self.poll_delay,
        };
        let task = tokio::spawn(poller.run(response));

        self.subscriptions.lock().insert(
            id,
            SubscriptionEntry {
                cancel,
                task,
                status: status.clone(),
            },
        );

        Ok(SubscriptionHandle { id, status })
    }

    /// Stops polling and asks the server to drop the queue.
    ///
    /// A queue the server already forgot counts as success.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), ZulipError> {
        let Some(entry) = self.subscriptions.lock().remove(&handle.id) else {
            return Ok(());
        };
        self.close(entry).await
    }

    pub async fn shutdown(&self) {
        let entries: Vec<SubscriptionEntry> = self
            .subscriptions
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            if let Err(e) = self.close(entry).await {
                warn!(error = %e, "failed to delete zulip event queue during shutdown");
            }
        }
    }

    async fn close(&self, entry: SubscriptionEntry) -> Result<(), ZulipError> {
        entry.cancel.cancel();
        if let Err(e) = entry.task.await {
            warn!(error = %e, "zulip poll task ended abnormally");
        }

        let queue_id = entry.status.write().queue_id.take();
        let Some(queue_id) = queue_id else {
            return Ok(());
        };
        match self.feed.delete_queue(&queue_id).await {
            Ok(()) => {
                debug!(%queue_id, "deleted zulip event queue");
                Ok(())
            }
            Err(e) if e.is_bad_event_queue() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct ActiveQueue {
    queue_id: String,
    cursor: i64,
    timeout: Duration,
}

struct Poller {
    feed: Arc<dyn EventFeed>,
    dispatcher: Arc<dyn EventDispatcher>,
    request: RegisterRequest,
    status: Arc<RwLock<SubscriptionStatus>>,
    cancel: CancellationToken,
    poll_delay: Duration,
}

impl Poller {
    async fn run(self, initial: RegisterResponse) {
        let mut active = Some(self.activate(&initial));

        loop {
            match active.take() {
                Some(mut queue) => {
                    self.status.write().state = SubscriptionState::Polling;
                    let outcome = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        result = self.feed.get_events(&queue.queue_id, queue.cursor, queue.timeout) => result,
                    };

                    match outcome {
                        Ok(events) => {
                            self.deliver(&mut queue, events).await;
                            active = Some(queue);
                        }
                        Err(e) => match BridgeError::from(e) {
                            BridgeError::StaleSubscription(msg) => {
                                info!(queue_id = %queue.queue_id, %msg, "zulip event queue expired, re-registering");
                                self.status.write().state = SubscriptionState::Unregistered;
                                active = self.reregister().await;
                            }
                            other => {
                                warn!(queue_id = %queue.queue_id, error = %other, "zulip event poll failed");
                                self.status.write().poll_errors += 1;
                                active = Some(queue);
                            }
                        },
                    }
                }
                None => active = self.reregister().await,
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_delay) => {}
            }
        }

        self.status.write().state = SubscriptionState::Closed;
        debug!("zulip poll loop stopped");
    }

    fn activate(&self, response: &RegisterResponse) -> ActiveQueue {
        let timeout = response.poll_timeout();
        let mut status = self.status.write();
        status.state = SubscriptionState::Registered;
        status.queue_id = Some(response.queue_id.clone());
        status.last_event_id = response.last_event_id;
        status.poll_timeout_secs = timeout.as_secs();

        ActiveQueue {
            queue_id: response.queue_id.clone(),
            cursor: response.last_event_id,
            timeout,
        }
    }

    async fn reregister(&self) -> Option<ActiveQueue> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            result = self.feed.register_queue(&self.request) => result,
        };

        match result {
            Ok(response) => {
                info!(queue_id = %response.queue_id, "re-registered zulip event queue");
                self.status.write().reregistrations += 1;
                self.dispatcher.on_registered(&response).await;
                Some(self.activate(&response))
            }
            Err(e) => {
                warn!(error = %e, "zulip event queue re-registration failed, will retry");
                self.status.write().poll_errors += 1;
                None
            }
        }
    }

    async fn deliver(&self, queue: &mut ActiveQueue, events: Vec<ZulipEvent>) {
        for event in events {
            // Ids at or below the cursor were already delivered on this queue.
            if event.id <= queue.cursor {
                continue;
            }
            queue.cursor = queue.cursor.max(event.id);
            {
                let mut status = self.status.write();
                status.last_event_id = queue.cursor;
                status.events_received += 1;
            }
            self.dispatcher.dispatch(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Map;
    use tokio::sync::{Notify, mpsc};

    use super::{EventDispatcher, EventFeed, EventQueueClient, SubscriptionState};
    use crate::error::BridgeError;
    use crate::zulip::{RegisterRequest, RegisterResponse, ZulipError, ZulipEvent};

    type PollResult = Result<Vec<ZulipEvent>, ZulipError>;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFeed {
        registrations: Mutex<Vec<RegisterRequest>>,
        register_failures: AtomicUsize,
        polls: Mutex<VecDeque<PollResult>>,
        poll_calls: Mutex<Vec<(String, i64)>>,
        deleted: Mutex<Vec<String>>,
        delete_result: Mutex<Option<ZulipError>>,
        poll_started: Notify,
        pending_aborted: Arc<AtomicBool>,
    }

    impl FakeFeed {
        fn with_polls(polls: Vec<PollResult>) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(polls.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl EventFeed for FakeFeed {
        async fn register_queue(
            &self,
            request: &RegisterRequest,
        ) -> Result<RegisterResponse, ZulipError> {
            if self.register_failures.load(Ordering::SeqCst) > 0 {
                self.register_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(api_error("INVALID_API_KEY"));
            }
            let mut registrations = self.registrations.lock();
            registrations.push(request.clone());
            Ok(RegisterResponse {
                queue_id: format!("q{}", registrations.len()),
                last_event_id: -1,
                event_queue_longpoll_timeout_seconds: Some(90),
                realm_linkifiers: None,
            })
        }

        async fn get_events(
            &self,
            queue_id: &str,
            last_event_id: i64,
            _timeout: Duration,
        ) -> PollResult {
            self.poll_calls
                .lock()
                .push((queue_id.to_string(), last_event_id));
            self.poll_started.notify_one();
            let next = self.polls.lock().pop_front();
            match next {
                Some(result) => result,
                None => {
                    let _guard = DropFlag(self.pending_aborted.clone());
                    futures::future::pending::<PollResult>().await
                }
            }
        }

        async fn delete_queue(&self, queue_id: &str) -> Result<(), ZulipError> {
            self.deleted.lock().push(queue_id.to_string());
            match self.delete_result.lock().take() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    struct ChannelDispatcher {
        sender: mpsc::UnboundedSender<ZulipEvent>,
        registrations: AtomicUsize,
    }

    #[async_trait]
    impl EventDispatcher for ChannelDispatcher {
        async fn dispatch(&self, event: ZulipEvent) {
            let _ = self.sender.send(event);
        }

        async fn on_registered(&self, _response: &RegisterResponse) {
            self.registrations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dispatcher() -> (Arc<ChannelDispatcher>, mpsc::UnboundedReceiver<ZulipEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelDispatcher {
                sender,
                registrations: AtomicUsize::new(0),
            }),
            receiver,
        )
    }

    fn event(id: i64, kind: &str) -> ZulipEvent {
        ZulipEvent {
            id,
            kind: kind.to_string(),
            payload: Map::new(),
        }
    }

    fn api_error(code: &str) -> ZulipError {
        ZulipError::Api {
            code: code.to_string(),
            msg: format!("{code} from test"),
        }
    }

    fn request() -> RegisterRequest {
        let mut request = RegisterRequest::new(["message", "update_message"]);
        request.fetch_event_types = vec!["realm_linkifiers".to_string()];
        request
    }

    async fn next_kind(receiver: &mut mpsc::UnboundedReceiver<ZulipEvent>) -> String {
        tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("event arrives in time")
            .expect("dispatcher channel open")
            .kind
    }

    #[tokio::test]
    async fn stale_queue_is_reregistered_with_original_request() {
        let feed = FakeFeed::with_polls(vec![
            Ok(vec![event(0, "a"), event(1, "b")]),
            Ok(vec![event(1, "b"), event(2, "c")]),
            Err(api_error("BAD_EVENT_QUEUE_ID")),
            Ok(vec![event(0, "d")]),
        ]);
        let client = EventQueueClient::new(feed.clone(), Duration::from_millis(1));
        let (dispatcher, mut receiver) = dispatcher();

        let handle = client
            .register(request(), dispatcher.clone())
            .await
            .expect("registered");

        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(next_kind(&mut receiver).await);
        }
        assert_eq!(kinds, vec!["a", "b", "c", "d"]);

        let registrations = feed.registrations.lock().clone();
        assert_eq!(registrations.len(), 2);
        assert!(registrations.iter().all(|r| *r == request()));
        assert_eq!(dispatcher.registrations.load(Ordering::SeqCst), 2);

        let calls = feed.poll_calls.lock().clone();
        assert_eq!(
            &calls[..4],
            &[
                ("q1".to_string(), -1),
                ("q1".to_string(), 1),
                ("q1".to_string(), 2),
                ("q2".to_string(), -1),
            ]
        );

        let status = handle.status();
        assert_eq!(status.reregistrations, 1);
        assert_eq!(status.queue_id.as_deref(), Some("q2"));

        client.unsubscribe(&handle).await.expect("unsubscribed");
        assert_eq!(feed.deleted.lock().as_slice(), ["q2".to_string()]);
        assert!(receiver.try_recv().is_err(), "no duplicate deliveries");
    }

    #[tokio::test]
    async fn transient_errors_keep_the_queue_and_retry() {
        let feed = FakeFeed::with_polls(vec![Err(api_error("BAD_REQUEST")), Ok(vec![event(0, "a")])]);
        let client = EventQueueClient::new(feed.clone(), Duration::from_millis(1));
        let (dispatcher, mut receiver) = dispatcher();

        let handle = client
            .register(request(), dispatcher)
            .await
            .expect("registered");

        assert_eq!(next_kind(&mut receiver).await, "a");
        assert_eq!(feed.registrations.lock().len(), 1);
        assert_eq!(handle.status().poll_errors, 1);

        client.shutdown().await;
        assert_eq!(handle.status().state, SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn unsubscribe_aborts_pending_poll_without_further_requests() {
        let feed = FakeFeed::with_polls(Vec::new());
        let client = EventQueueClient::new(feed.clone(), Duration::from_millis(1));
        let (dispatcher, _receiver) = dispatcher();

        let handle = client
            .register(request(), dispatcher)
            .await
            .expect("registered");
        tokio::time::timeout(Duration::from_secs(2), feed.poll_started.notified())
            .await
            .expect("poll started");

        tokio::time::timeout(Duration::from_millis(200), client.unsubscribe(&handle))
            .await
            .expect("unsubscribe does not wait for the long poll")
            .expect("queue deleted");

        assert!(feed.pending_aborted.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(feed.poll_calls.lock().len(), 1);
        assert_eq!(handle.status().state, SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn unsubscribe_tolerates_already_deleted_queue() {
        let feed = FakeFeed::with_polls(Vec::new());
        *feed.delete_result.lock() = Some(api_error("BAD_EVENT_QUEUE_ID"));
        let client = EventQueueClient::new(feed.clone(), Duration::from_millis(1));
        let (dispatcher, _receiver) = dispatcher();

        let handle = client
            .register(request(), dispatcher)
            .await
            .expect("registered");

        client
            .unsubscribe(&handle)
            .await
            .expect("already gone counts as success");
    }

    #[tokio::test]
    async fn failed_initial_registration_is_reported() {
        let feed = FakeFeed::with_polls(Vec::new());
        feed.register_failures.store(1, Ordering::SeqCst);
        let client = EventQueueClient::new(feed.clone(), Duration::from_millis(1));
        let (dispatcher, _receiver) = dispatcher();

        let result = client.register(request(), dispatcher).await;

        assert!(matches!(result, Err(BridgeError::Registration(_))));
        assert!(feed.poll_calls.lock().is_empty());
    }
}
