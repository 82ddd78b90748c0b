//! # Message Bridge Module
//!
//! Each worker owns one bridge: a typed mailbox whose handlers always run on
//! the owning worker's thread, so they may touch its execution context.
//!
//! ## Key Concepts
//! - Intake: posts from any thread land on a lock-free `SegQueue` in
//!   arrival order
//! - Delivery: posting schedules one coalesced delivery block on the owner
//!   through `WorkerInterface::execute_block`
//! - Parking: a message whose type has no handler stays buffered, together
//!   with every later message of that type, until a handler is registered
//!
//! Handlers are one per type; registering again replaces the previous
//! handler (overwrite, not merge).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

use scriptpool_api::Value;

use crate::log_message;
use crate::thread::context::{ContextScope, WorkerInterface};
use crate::thread::error::WorkerError;
use crate::thread::task::panic_message;
use crate::thread::worker::WorkerId;

/// A typed message exchanged between workers, or posted by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: String,
    pub payload: Value,
    /// Posting worker; `None` when posted by the pool or host.
    pub sender: Option<WorkerId>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            sender: None,
        }
    }
}

/// Handler invoked on the owning worker's thread.
pub type MessageHandler = Arc<dyn Fn(&Message, &mut ContextScope<'_>) + Send + Sync>;

struct BridgeInner {
    owner: Weak<dyn WorkerInterface>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    intake: SegQueue<Message>,
    parked: Mutex<VecDeque<Message>>,
    delivery_scheduled: AtomicBool,
    /// Bumped by `clear_message_buffer` so an in-flight delivery pass drops
    /// what it could not deliver instead of re-parking it.
    epoch: AtomicU64,
}

/// Per-worker mailbox. Cloning shares the same bridge.
#[derive(Clone)]
pub struct MessageBridge {
    inner: Arc<BridgeInner>,
}

/// Resets the coalescing flag even when the delivery block is dropped
/// without running (owner stopped or lost its context).
struct DeliveryTicket(Arc<BridgeInner>);

impl Drop for DeliveryTicket {
    fn drop(&mut self) {
        self.0.delivery_scheduled.store(false, Ordering::SeqCst);
    }
}

impl MessageBridge {
    pub fn new(owner: Weak<dyn WorkerInterface>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                owner,
                handlers: RwLock::new(HashMap::new()),
                intake: SegQueue::new(),
                parked: Mutex::new(VecDeque::new()),
                delivery_scheduled: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Id of the owning worker, if it is still alive.
    pub fn owner_id(&self) -> Option<WorkerId> {
        self.inner.owner.upgrade().map(|owner| owner.worker_id())
    }

    /// Send `message` from this bridge's worker to `target`.
    ///
    /// Messages posted to one target are delivered in post order.
    pub fn post_message(&self, mut message: Message, target: &MessageBridge) {
        message.sender = self.owner_id();
        target.deliver(message);
    }

    /// Buffer a message for this bridge's worker and schedule delivery.
    pub fn deliver(&self, message: Message) {
        log_message!(message.message_type, "buffered", sender = ?message.sender);
        self.inner.intake.push(message);
        self.schedule_delivery();
    }

    /// Install the handler for `message_type`. Returns `true` if it replaced
    /// an existing handler.
    ///
    /// Messages already parked for this type are scheduled for delivery.
    pub fn register_message_handler<F>(&self, message_type: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Message, &mut ContextScope<'_>) + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        let replaced = self
            .inner
            .handlers
            .write()
            .unwrap()
            .insert(message_type.clone(), Arc::new(handler))
            .is_some();
        if replaced {
            debug!(message_type = %message_type, "Replaced message handler");
        }
        if self.buffered_message_count() > 0 {
            self.schedule_delivery();
        }
        replaced
    }

    /// Remove the handler for `message_type`; later messages of that type
    /// are parked.
    pub fn unregister_message_handler(&self, message_type: &str) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap()
            .remove(message_type)
            .is_some()
    }

    pub fn has_handler(&self, message_type: &str) -> bool {
        self.inner.handlers.read().unwrap().contains_key(message_type)
    }

    /// Deliver everything currently buffered, on the owning worker's thread.
    pub fn process_buffered_messages(&self) -> Result<(), WorkerError> {
        let owner = self.owner()?;
        let inner = Arc::clone(&self.inner);
        owner.execute_block(Box::new(move |scope: &mut ContextScope<'_>| {
            BridgeInner::run_pass(inner, scope);
        }))
    }

    /// Drop every undelivered message without invoking handlers. Returns the
    /// number discarded.
    pub fn clear_message_buffer(&self) -> usize {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let mut parked = self.inner.parked.lock().unwrap();
        let mut dropped = parked.len();
        parked.clear();
        while self.inner.intake.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Cleared message buffer");
        }
        dropped
    }

    /// Messages posted but not yet delivered, parked ones included.
    pub fn buffered_message_count(&self) -> usize {
        self.inner.parked.lock().unwrap().len() + self.inner.intake.len()
    }

    /// Queue one delivery pass on the owner unless one is already queued.
    pub(crate) fn schedule_delivery(&self) {
        if self.inner.delivery_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let owner = match self.owner() {
            Ok(owner) => owner,
            Err(_) => {
                self.inner.delivery_scheduled.store(false, Ordering::SeqCst);
                return;
            }
        };

        let ticket = DeliveryTicket(Arc::clone(&self.inner));
        let scheduled = owner.execute_block(Box::new(move |scope: &mut ContextScope<'_>| {
            let inner = Arc::clone(&ticket.0);
            drop(ticket);
            BridgeInner::run_pass(inner, scope);
        }));
        if let Err(error) = scheduled {
            debug!("Message delivery deferred: {}", error);
        }
    }

    fn owner(&self) -> Result<Arc<dyn WorkerInterface>, WorkerError> {
        self.inner.owner.upgrade().ok_or(WorkerError::Detached)
    }
}

impl BridgeInner {
    /// Deliver, then queue a follow-up pass if a handler for a parked type
    /// was registered while this pass held those messages.
    fn run_pass(inner: Arc<BridgeInner>, scope: &mut ContextScope<'_>) {
        inner.deliver_buffered(scope);
        if inner.has_deliverable_parked() {
            MessageBridge { inner }.schedule_delivery();
        }
    }

    fn has_deliverable_parked(&self) -> bool {
        let parked = self.parked.lock().unwrap();
        if parked.is_empty() {
            return false;
        }
        let handlers = self.handlers.read().unwrap();
        parked
            .iter()
            .any(|message| handlers.contains_key(&message.message_type))
    }

    /// One delivery pass. Runs on the owning worker's thread.
    fn deliver_buffered(&self, scope: &mut ContextScope<'_>) -> usize {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut batch = std::mem::take(&mut *self.parked.lock().unwrap());
        while let Some(message) = self.intake.pop() {
            batch.push_back(message);
        }

        let mut blocked: HashSet<String> = HashSet::new();
        let mut held = VecDeque::new();
        let mut delivered = 0;

        for message in batch {
            if blocked.contains(&message.message_type) {
                held.push_back(message);
                continue;
            }
            let handler = self
                .handlers
                .read()
                .unwrap()
                .get(&message.message_type)
                .cloned();
            match handler {
                Some(handler) => {
                    log_message!(message.message_type, "delivered", worker_id = %scope.worker_id());
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&message, scope)));
                    if let Err(payload) = outcome {
                        warn!(
                            message_type = %message.message_type,
                            "Message handler panicked: {}",
                            panic_message(payload)
                        );
                    }
                    delivered += 1;
                }
                None => {
                    blocked.insert(message.message_type.clone());
                    held.push_back(message);
                }
            }
        }

        if !held.is_empty() && self.epoch.load(Ordering::SeqCst) == epoch {
            let mut parked = self.parked.lock().unwrap();
            // Anything parked meanwhile arrived later; keep it behind.
            held.extend(parked.drain(..));
            *parked = held;
        }
        delivered
    }
}

impl fmt::Debug for MessageBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<String> = self.inner.handlers.read().unwrap().keys().cloned().collect();
        f.debug_struct("MessageBridge")
            .field("owner", &self.owner_id())
            .field("handlers", &handlers)
            .field("buffered", &self.buffered_message_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::context::Block;
    use crate::thread::worker::WorkerStatus;
    use scriptpool_api::testing::ScriptedProvider;
    use scriptpool_api::{ContextHandle, ContextProvider};
    use serde_json::json;

    /// Runs blocks on the calling thread, one at a time, or holds them
    /// while paused.
    struct InlineOwner {
        provider: ScriptedProvider,
        context: Mutex<ContextHandle>,
        held: Mutex<VecDeque<Block>>,
        paused: AtomicBool,
        running: AtomicBool,
    }

    impl InlineOwner {
        fn new() -> Arc<Self> {
            let provider = ScriptedProvider::new();
            let context = provider.create_context().unwrap();
            Arc::new(Self {
                provider,
                context: Mutex::new(context),
                held: Mutex::new(VecDeque::new()),
                paused: AtomicBool::new(false),
                running: AtomicBool::new(false),
            })
        }

        fn run(&self, block: Block) {
            let mut context = self.context.lock().unwrap();
            let mut scope = ContextScope::new(WorkerId(7), &self.provider, &mut context);
            block(&mut scope);
        }

        /// Blocks queued by a running block run after it, like on a worker.
        fn drain(&self) {
            if self.running.swap(true, Ordering::SeqCst) {
                return;
            }
            loop {
                let next = self.held.lock().unwrap().pop_front();
                match next {
                    Some(block) => self.run(block),
                    None => break,
                }
            }
            self.running.store(false, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.paused.store(false, Ordering::SeqCst);
            self.drain();
        }
    }

    impl WorkerInterface for InlineOwner {
        fn worker_id(&self) -> WorkerId {
            WorkerId(7)
        }

        fn status(&self) -> WorkerStatus {
            WorkerStatus::Idle
        }

        fn execute_block(&self, block: Block) -> Result<(), WorkerError> {
            self.held.lock().unwrap().push_back(block);
            if !self.paused.load(Ordering::SeqCst) {
                self.drain();
            }
            Ok(())
        }
    }

    fn bridge_for(owner: &Arc<InlineOwner>) -> MessageBridge {
        let weak: Weak<dyn WorkerInterface> = Arc::downgrade(owner) as Weak<dyn WorkerInterface>;
        MessageBridge::new(weak)
    }

    fn recording(bridge: &MessageBridge, message_type: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bridge.register_message_handler(message_type, move |message: &Message, _: &mut ContextScope<'_>| {
            sink.lock().unwrap().push(message.payload.clone());
        });
        seen
    }

    #[test]
    fn test_delivers_in_post_order() {
        let owner = InlineOwner::new();
        let bridge = bridge_for(&owner);
        let seen = recording(&bridge, "tick");

        owner.paused.store(true, Ordering::SeqCst);
        for i in 1..=3 {
            bridge.deliver(Message::new("tick", json!(i)));
        }
        assert_eq!(bridge.buffered_message_count(), 3);
        // Coalesced into one pending delivery block.
        assert_eq!(owner.held.lock().unwrap().len(), 1);

        owner.resume();
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(bridge.buffered_message_count(), 0);
    }

    #[test]
    fn test_unhandled_messages_park_until_registration() {
        let owner = InlineOwner::new();
        let bridge = bridge_for(&owner);
        let other = recording(&bridge, "other");

        bridge.deliver(Message::new("late", json!("a")));
        bridge.deliver(Message::new("other", json!("x")));
        bridge.deliver(Message::new("late", json!("b")));
        assert_eq!(bridge.buffered_message_count(), 2);
        assert_eq!(*other.lock().unwrap(), vec![json!("x")]);

        let late = recording(&bridge, "late");
        assert_eq!(*late.lock().unwrap(), vec![json!("a"), json!("b")]);
        assert_eq!(bridge.buffered_message_count(), 0);
    }

    #[test]
    fn test_register_replaces_handler() {
        let owner = InlineOwner::new();
        let bridge = bridge_for(&owner);
        let first = recording(&bridge, "ping");
        assert!(bridge.register_message_handler("ping", |_: &Message, _: &mut ContextScope<'_>| {}));

        bridge.deliver(Message::new("ping", json!(1)));
        assert!(first.lock().unwrap().is_empty());
        assert!(bridge.unregister_message_handler("ping"));
        assert!(!bridge.has_handler("ping"));
    }

    #[test]
    fn test_post_message_stamps_sender() {
        let owner = InlineOwner::new();
        let source = bridge_for(&owner);
        let target_owner = InlineOwner::new();
        let target = bridge_for(&target_owner);

        let senders = Arc::new(Mutex::new(Vec::new()));
        let sink = senders.clone();
        target.register_message_handler("hello", move |message: &Message, _: &mut ContextScope<'_>| {
            sink.lock().unwrap().push(message.sender);
        });

        source.post_message(Message::new("hello", Value::Null), &target);
        target.deliver(Message::new("hello", Value::Null));
        assert_eq!(*senders.lock().unwrap(), vec![Some(WorkerId(7)), None]);
    }

    #[test]
    fn test_clear_drops_without_invoking_handlers() {
        let owner = InlineOwner::new();
        let bridge = bridge_for(&owner);
        let seen = recording(&bridge, "tick");

        owner.paused.store(true, Ordering::SeqCst);
        bridge.deliver(Message::new("tick", json!(1)));
        bridge.deliver(Message::new("nobody", json!(2)));
        assert_eq!(bridge.clear_message_buffer(), 2);

        owner.resume();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bridge.buffered_message_count(), 0);
    }

    #[test]
    fn test_handler_can_use_context() {
        let owner = InlineOwner::new();
        let bridge = bridge_for(&owner);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        bridge.register_message_handler("count", move |_: &Message, scope: &mut ContextScope<'_>| {
            let value = scope.evaluate("counter", &Default::default());
            sink.lock().unwrap().push(value);
        });

        bridge.deliver(Message::new("count", Value::Null));
        bridge.deliver(Message::new("count", Value::Null));
        assert_eq!(
            *results.lock().unwrap(),
            vec![Ok(json!(1)), Ok(json!(2))]
        );
    }

    #[test]
    fn test_handler_registered_mid_pass_gets_parked_messages() {
        let owner = InlineOwner::new();
        let bridge = bridge_for(&owner);
        let late: Arc<Mutex<Vec<Value>>> = Arc::default();

        let (registrar, sink) = (bridge.clone(), late.clone());
        bridge.register_message_handler("slow", move |_: &Message, _: &mut ContextScope<'_>| {
            let sink = sink.clone();
            registrar.register_message_handler("late", move |message: &Message, _: &mut ContextScope<'_>| {
                sink.lock().unwrap().push(message.payload.clone());
            });
        });

        owner.paused.store(true, Ordering::SeqCst);
        bridge.deliver(Message::new("late", json!("a")));
        bridge.deliver(Message::new("slow", Value::Null));
        owner.resume();

        assert_eq!(*late.lock().unwrap(), vec![json!("a")]);
        assert_eq!(bridge.buffered_message_count(), 0);
    }
}
