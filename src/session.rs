// session.rs
//
// The MQTT session and its state machine.
//
// This file is part of the Polar MQTT bridge library.
//

/*******************************************************************************
 * Copyright (c) 2017-2023 Frank Pagliughi <fpagliughi@mindspring.com>
 *
 * All rights reserved. This program and the accompanying materials
 * are made available under the terms of the Eclipse Public License v2.0
 * and Eclipse Distribution License v1.0 which accompany this distribution.
 *
 * The Eclipse Public License is available at
 *    http://www.eclipse.org/legal/epl-v20.html
 * and the Eclipse Distribution License is available at
 *   http://www.eclipse.org/org/documents/edl-v10.php.
 *
 * Contributors:
 *    Frank Pagliughi - initial implementation and documentation
 *******************************************************************************/

//! The session.
//!
//! A [`Session`] is one client identity talking to one broker. It moves
//! through the states:
//!
//! ```text
//!   Disconnected -> Connecting -> Connected
//!   Connecting/Connected -> Reconnecting      (connection lost)
//!   Reconnecting -> Connecting -> Connected   (engine retry)
//!   any -> Disconnected                       (stop)
//! ```
//!
//! Operations return a plain success indicator. Every failure is also
//! reported to the session handler's `on_error`, so that a caller across
//! the C boundary gets the code and text even when it ignores the return
//! value.
//!
//! Handlers are invoked on the engine's delivery thread. Once
//! [`detach_handlers`](Session::detach_handlers) returns, no handler call
//! is running or will be started, except one running on the calling
//! thread itself.

use crate::{
    connection_config::ConnectionConfig,
    engine::{Engine, EngineEvents},
    errors::*,
    factory::ApiFactory,
    message::MessageView,
    types::{QoS, SessionState},
};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::Duration,
};

/// How long `stop()` lets the engine finish in-flight work.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives the state changes and errors of a session.
pub trait SessionHandler: Send + Sync {
    /// The session moved to a new state.
    fn on_state_change(&self, state: SessionState);

    /// An operation failed, or the connection was lost.
    fn on_error(&self, code: i32, msg: &str);
}

/// Receives the messages arriving on a session.
pub trait MessageHandler: Send + Sync {
    /// A message arrived. The view is only valid for this call.
    fn on_message(&self, msg: &MessageView<'_>);
}

// The state and the tables, all under one lock.
struct SessionCore {
    state: SessionState,
    subscriptions: BTreeMap<i64, String>,
    next_sub_handle: i64,
    next_message_id: i64,
}

impl Default for SessionCore {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            subscriptions: BTreeMap::new(),
            next_sub_handle: 1,
            next_message_id: 1,
        }
    }
}

#[derive(Default)]
struct Handlers {
    session: Option<Arc<dyn SessionHandler>>,
    message: Option<Arc<dyn MessageHandler>>,
    // Threads currently inside a handler call.
    active: Vec<ThreadId>,
}

struct SessionInner {
    factory: ApiFactory,
    client_id: String,
    config: Mutex<ConnectionConfig>,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    core: Mutex<SessionCore>,
    handlers: Mutex<Handlers>,
    idle: Condvar,
}

/// An MQTT session.
///
/// This is a cheap handle to the shared session. Clones refer to the same
/// session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a new, disconnected session with the default configuration.
    pub fn new(factory: ApiFactory, client_id: &str) -> Self {
        debug!("Creating session '{}'", client_id);
        Self {
            inner: Arc::new(SessionInner {
                factory,
                client_id: client_id.to_string(),
                config: Mutex::new(ConnectionConfig::default()),
                engine: Mutex::new(None),
                core: Mutex::new(SessionCore::default()),
                handlers: Mutex::new(Handlers::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Gets the client identifier.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Gets the factory token that created this session.
    pub fn factory(&self) -> &ApiFactory {
        &self.inner.factory
    }

    /// Gets the current state.
    pub fn state(&self) -> SessionState {
        lock!(self.inner.core).state
    }

    /// Gets exclusive access to the connection configuration.
    ///
    /// Changes take effect on the next `start()`.
    pub fn config(&self) -> MutexGuard<'_, ConnectionConfig> {
        lock!(self.inner.config)
    }

    /// Gets a snapshot of the subscription table, in handle order.
    pub fn subscriptions(&self) -> Vec<(i64, String)> {
        lock!(self.inner.core)
            .subscriptions
            .iter()
            .map(|(h, t)| (*h, t.clone()))
            .collect()
    }

    /// Gets the topic filter of a subscription handle, if it is live.
    pub fn subscription_topic(&self, handle: i64) -> Option<String> {
        lock!(self.inner.core).subscriptions.get(&handle).cloned()
    }

    /// Sets or clears the session handler.
    pub fn set_session_handler(&self, handler: Option<Arc<dyn SessionHandler>>) {
        lock!(self.inner.handlers).session = handler;
    }

    /// Sets or clears the message handler.
    pub fn set_message_handler(&self, handler: Option<Arc<dyn MessageHandler>>) {
        lock!(self.inner.handlers).message = handler;
    }

    /// Clears both handlers and waits for any handler call in progress
    /// on another thread to finish.
    pub fn detach_handlers(&self) {
        let me = thread::current().id();
        let mut handlers = lock!(self.inner.handlers);
        handlers.session = None;
        handlers.message = None;

        while handlers.active.iter().any(|id| *id != me) {
            handlers = self
                .inner
                .idle
                .wait(handlers)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Connects to the broker, blocking until the attempt completes.
    ///
    /// Returns `true` if the session is connected, or was already started.
    /// On failure the reason goes to the session handler, and the session
    /// is left Disconnected.
    pub fn start(&self) -> bool {
        let inner = &self.inner;

        if lock!(inner.engine).is_some() {
            debug!("Session '{}' is already started", inner.client_id);
            return true;
        }

        let (create_opts, connect_opts) = {
            let cfg = lock!(inner.config);
            if !cfg.has_broker() {
                drop(cfg);
                warn!("Session '{}' started with no broker", inner.client_id);
                inner.notify_error(RC_BAD_CONFIG, MSG_BROKER_NOT_SET);
                return false;
            }
            (cfg.create_options(&inner.client_id), cfg.connect_options())
        };

        debug!("Starting session '{}' on {}", inner.client_id, create_opts.server_uri);

        let engine = match inner.factory.engines().create(&create_opts) {
            Ok(engine) => engine,
            Err(rc) => {
                inner.notify_error(rc, MSG_CREATE_FAILED);
                return false;
            }
        };

        let events: Arc<dyn EngineEvents> = Arc::clone(inner) as Arc<dyn EngineEvents>;
        engine.set_callbacks(Arc::downgrade(&events));

        // Claim the session. A concurrent start that got here first wins.
        {
            let mut core = lock!(inner.core);
            if core.state != SessionState::Disconnected {
                drop(core);
                engine.destroy();
                return true;
            }
            core.state = SessionState::Connecting;
        }
        *lock!(inner.engine) = Some(Arc::clone(&engine));
        inner.notify_state(SessionState::Connecting);

        let res = engine.connect(&connect_opts);
        let still_ours = inner.owns_engine(&engine);

        match res {
            Ok(()) if still_ours => {
                inner.set_state(SessionState::Connected);
                debug!("Session '{}' connected", inner.client_id);
                true
            }
            Ok(()) => {
                debug!("Session '{}' was stopped while connecting", inner.client_id);
                inner.notify_error(RC_DISCONNECTED, MSG_CONNECT_FAILED);
                false
            }
            Err(rc) => {
                warn!("Session '{}' failed to connect: {}", inner.client_id, rc);
                inner.notify_error(rc, MSG_CONNECT_FAILED);
                if still_ours {
                    lock!(inner.engine).take();
                    engine.destroy();
                    inner.set_state(SessionState::Disconnected);
                }
                false
            }
        }
    }

    /// Disconnects from the broker and releases the engine client.
    ///
    /// Stopping a session that isn't started does nothing.
    pub fn stop(&self) -> bool {
        let engine = lock!(self.inner.engine).take();

        if let Some(engine) = engine {
            debug!("Stopping session '{}'", self.inner.client_id);
            if let Err(rc) = engine.disconnect(DISCONNECT_TIMEOUT) {
                debug!("Disconnect of '{}' failed: {}", self.inner.client_id, rc);
            }
            engine.destroy();
            self.inner.set_state(SessionState::Disconnected);
        }
        true
    }

    /// Subscribes to a topic filter.
    ///
    /// Returns the new subscription handle, or -1 on failure.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> i64 {
        let engine = match self.inner.engine() {
            Some(engine) => engine,
            None => {
                self.inner.notify_error(RC_DISCONNECTED, MSG_SUBSCRIBE_FAILED);
                return -1;
            }
        };

        if let Err(rc) = engine.subscribe(topic, qos) {
            self.inner.notify_error(rc, MSG_SUBSCRIBE_FAILED);
            return -1;
        }

        let mut core = lock!(self.inner.core);
        let handle = core.next_sub_handle;
        core.next_sub_handle += 1;
        core.subscriptions.insert(handle, topic.to_string());
        debug!("Session '{}' subscribed to '{}' as {}", self.inner.client_id, topic, handle);
        handle
    }

    /// Removes a subscription by its handle.
    ///
    /// An unknown handle is a usage error: it returns `false` without
    /// notifying the session handler. On an engine failure the
    /// subscription stays in the table.
    pub fn unsubscribe(&self, handle: i64) -> bool {
        let topic = match self.subscription_topic(handle) {
            Some(topic) => topic,
            None => return false,
        };

        let engine = match self.inner.engine() {
            Some(engine) => engine,
            None => {
                self.inner.notify_error(RC_DISCONNECTED, MSG_UNSUBSCRIBE_FAILED);
                return false;
            }
        };

        if let Err(rc) = engine.unsubscribe(&topic) {
            self.inner.notify_error(rc, MSG_UNSUBSCRIBE_FAILED);
            return false;
        }

        lock!(self.inner.core).subscriptions.remove(&handle);
        true
    }

    /// Publishes a message.
    ///
    /// Returns the message id, or -1 on failure. An id is used up even if
    /// the publish fails.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> i64 {
        let id = {
            let mut core = lock!(self.inner.core);
            let id = core.next_message_id;
            core.next_message_id += 1;
            id
        };

        let engine = match self.inner.engine() {
            Some(engine) => engine,
            None => {
                self.inner.notify_error(RC_DISCONNECTED, MSG_PUBLISH_FAILED);
                return -1;
            }
        };

        match engine.publish(topic, payload, qos, retain, id) {
            Ok(()) => id,
            Err(rc) => {
                self.inner.notify_error(rc, MSG_PUBLISH_FAILED);
                -1
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////

impl SessionInner {
    fn engine(&self) -> Option<Arc<dyn Engine>> {
        lock!(self.engine).clone()
    }

    fn owns_engine(&self, engine: &Arc<dyn Engine>) -> bool {
        lock!(self.engine)
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, engine))
    }

    // Sets the state, then tells the handler about it.
    fn set_state(&self, state: SessionState) {
        lock!(self.core).state = state;
        self.notify_state(state);
    }

    fn notify_state(&self, state: SessionState) {
        trace!("Session '{}' is {}", self.client_id, state);
        if let Some((handler, _active)) = self.enter(|h| h.session.clone()) {
            handler.on_state_change(state);
        }
    }

    fn notify_error(&self, code: i32, msg: &str) {
        trace!("Session '{}' error {}: {}", self.client_id, code, msg);
        if let Some((handler, _active)) = self.enter(|h| h.session.clone()) {
            handler.on_error(code, msg);
        }
    }

    // Picks a handler and marks this thread as active until the returned
    // guard drops, so that `detach_handlers()` can wait for the call.
    // The handler itself is invoked outside the lock.
    fn enter<H, S>(&self, select: S) -> Option<(Arc<H>, ActiveDispatch<'_>)>
    where
        H: ?Sized,
        S: FnOnce(&Handlers) -> Option<Arc<H>>,
    {
        let mut handlers = lock!(self.handlers);
        let handler = select(&handlers)?;
        handlers.active.push(thread::current().id());
        Some((handler, ActiveDispatch { inner: self }))
    }
}

// Marks the end of a handler call, even if it unwinds.
struct ActiveDispatch<'a> {
    inner: &'a SessionInner,
}

impl Drop for ActiveDispatch<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut handlers = lock!(self.inner.handlers);
        if let Some(pos) = handlers.active.iter().position(|id| *id == me) {
            handlers.active.swap_remove(pos);
        }
        self.inner.idle.notify_all();
    }
}

impl EngineEvents for SessionInner {
    fn connection_lost(&self, cause: Option<&str>) {
        warn!(
            "Session '{}' lost its connection: {}",
            self.client_id,
            cause.unwrap_or("unknown cause")
        );
        self.set_state(SessionState::Reconnecting);
        self.notify_error(RC_CONNECTION_LOST, cause.unwrap_or(MSG_CONNECTION_LOST));
    }

    fn message_arrived(&self, msg: &MessageView<'_>) {
        trace!("Session '{}' received a message on '{}'", self.client_id, msg.topic());
        if let Some((handler, _active)) = self.enter(|h| h.message.clone()) {
            handler.on_message(msg);
        }
    }

    fn reconnecting(&self) {
        self.set_state(SessionState::Connecting);
    }

    fn reconnected(&self) {
        debug!("Session '{}' reconnected", self.client_id);
        self.set_state(SessionState::Connected);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let engine = self
            .engine
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(engine) = engine {
            let _ = engine.disconnect(DISCONNECT_TIMEOUT);
            engine.destroy();
        }
        debug!("Dropped session '{}'", self.client_id);
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::UnavailableEngineFactory,
        factory::InitOptions,
        loopback::{LoopbackBroker, Operation},
    };
    use std::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        State(SessionState),
        Error(i32, String),
        Message(String, Vec<u8>),
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<Event>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }

        fn send(&self, ev: Event) {
            let _ = lock!(self.tx).send(ev);
        }
    }

    impl SessionHandler for Recorder {
        fn on_state_change(&self, state: SessionState) {
            self.send(Event::State(state));
        }

        fn on_error(&self, code: i32, msg: &str) {
            self.send(Event::Error(code, msg.to_string()));
        }
    }

    impl MessageHandler for Recorder {
        fn on_message(&self, msg: &MessageView<'_>) {
            self.send(Event::Message(msg.topic().to_string(), msg.payload().to_vec()));
        }
    }

    fn drain(rx: &mpsc::Receiver<Event>) -> Vec<Event> {
        rx.try_iter().collect()
    }

    fn next(rx: &mpsc::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn loopback_session(broker: &LoopbackBroker, id: &str) -> (Session, mpsc::Receiver<Event>) {
        let fact = ApiFactory::initialize(InitOptions::default(), broker.engine_factory()).unwrap();
        let (rec, rx) = Recorder::new();
        let sess = fact.create_session(id, rec.clone());
        sess.set_message_handler(Some(rec));
        sess.config().set_broker("test.broker", 1883);
        (sess, rx)
    }

    #[test]
    fn test_never_started() {
        let fact = ApiFactory::initialize(InitOptions::default(), Arc::new(UnavailableEngineFactory)).unwrap();
        let (rec, rx) = Recorder::new();
        let sess = fact.create_session("idle", rec);

        assert_eq!(SessionState::Disconnected, sess.state());
        assert!(sess.stop());
        assert!(sess.stop());
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_start_without_broker() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");
        sess.config().set_broker("", 1883);

        assert!(!sess.start());
        assert_eq!(
            vec![Event::Error(RC_BAD_CONFIG, MSG_BROKER_NOT_SET.to_string())],
            drain(&rx)
        );
        assert_eq!(SessionState::Disconnected, sess.state());
    }

    #[test]
    fn test_start_and_stop() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");

        assert!(sess.start());
        assert_eq!(SessionState::Connected, sess.state());
        assert!(broker.is_connected("cli"));
        assert_eq!(
            vec![
                Event::State(SessionState::Connecting),
                Event::State(SessionState::Connected)
            ],
            drain(&rx)
        );

        // Already started
        assert!(sess.start());
        assert!(drain(&rx).is_empty());

        assert!(sess.stop());
        assert_eq!(SessionState::Disconnected, sess.state());
        assert!(!broker.is_connected("cli"));
        assert_eq!(vec![Event::State(SessionState::Disconnected)], drain(&rx));
    }

    #[test]
    fn test_connect_failure() {
        let broker = LoopbackBroker::new();
        broker.refuse_connections(Some(3));
        let (sess, rx) = loopback_session(&broker, "cli");

        assert!(!sess.start());
        assert_eq!(
            vec![
                Event::State(SessionState::Connecting),
                Event::Error(3, MSG_CONNECT_FAILED.to_string()),
                Event::State(SessionState::Disconnected),
            ],
            drain(&rx)
        );
        assert_eq!(SessionState::Disconnected, sess.state());

        broker.refuse_connections(None);
        assert!(sess.start());
    }

    #[test]
    fn test_engine_unavailable() {
        let fact = ApiFactory::initialize(InitOptions::default(), Arc::new(UnavailableEngineFactory)).unwrap();
        let (rec, rx) = Recorder::new();
        let sess = fact.create_session("cli", rec);
        sess.config().set_broker("localhost", 1883);

        assert!(!sess.start());
        assert_eq!(
            vec![Event::Error(RC_ENGINE_UNAVAILABLE, MSG_CREATE_FAILED.to_string())],
            drain(&rx)
        );
    }

    #[test]
    fn test_operations_while_disconnected() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");

        assert_eq!(-1, sess.subscribe("a/b", QoS::AtLeastOnce));
        assert_eq!(-1, sess.publish("a/b", b"x", QoS::AtMostOnce, false));
        assert_eq!(
            vec![
                Event::Error(RC_DISCONNECTED, MSG_SUBSCRIBE_FAILED.to_string()),
                Event::Error(RC_DISCONNECTED, MSG_PUBLISH_FAILED.to_string()),
            ],
            drain(&rx)
        );
    }

    #[test]
    fn test_subscription_handles() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");
        assert!(sess.start());
        drain(&rx);

        let h1 = sess.subscribe("a/+", QoS::AtLeastOnce);
        assert_eq!(1, h1);
        assert!(broker.has_subscription("cli", "a/+"));

        assert!(sess.unsubscribe(h1));
        assert!(!broker.has_subscription("cli", "a/+"));
        assert!(sess.subscriptions().is_empty());

        // Handles are never reused
        let h2 = sess.subscribe("a/+", QoS::AtLeastOnce);
        assert_eq!(2, h2);

        // Unknown handles fail quietly
        assert!(!sess.unsubscribe(h1));
        assert!(!sess.unsubscribe(42));
        assert!(drain(&rx).is_empty());

        broker.fail_next(Operation::Subscribe, -8);
        assert_eq!(-1, sess.subscribe("b", QoS::AtMostOnce));

        broker.fail_next(Operation::Unsubscribe, -9);
        assert!(!sess.unsubscribe(h2));
        assert_eq!(Some("a/+".to_string()), sess.subscription_topic(h2));

        assert_eq!(
            vec![
                Event::Error(-8, MSG_SUBSCRIBE_FAILED.to_string()),
                Event::Error(-9, MSG_UNSUBSCRIBE_FAILED.to_string()),
            ],
            drain(&rx)
        );
        assert_eq!(3, sess.subscribe("c", QoS::AtMostOnce));
    }

    #[test]
    fn test_publish_ids_and_failure() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");
        assert!(sess.start());
        drain(&rx);

        assert_eq!(1, sess.publish("t/1", b"hello", QoS::AtLeastOnce, false));

        broker.fail_next(Operation::Publish, -4);
        assert_eq!(-1, sess.publish("t/1", b"hello", QoS::AtLeastOnce, false));
        assert_eq!(vec![Event::Error(-4, MSG_PUBLISH_FAILED.to_string())], drain(&rx));

        assert_eq!(3, sess.publish("t/1", b"again", QoS::AtLeastOnce, false));
        assert_eq!(2, broker.published().len());
    }

    #[test]
    fn test_message_delivery() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");
        assert!(sess.start());
        drain(&rx);

        sess.subscribe("t/#", QoS::AtLeastOnce);
        sess.publish("t/1", b"hello", QoS::AtLeastOnce, false);

        assert_eq!(Event::Message("t/1".into(), b"hello".to_vec()), next(&rx));
    }

    #[test]
    fn test_connection_lost_and_regained() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");
        assert!(sess.start());
        drain(&rx);

        assert!(broker.drop_connection("cli"));
        assert_eq!(Event::State(SessionState::Reconnecting), next(&rx));
        match next(&rx) {
            Event::Error(RC_CONNECTION_LOST, _) => (),
            ev => panic!("Unexpected event: {:?}", ev),
        }
        assert_eq!(SessionState::Reconnecting, sess.state());

        assert!(broker.restore_connection("cli"));
        assert_eq!(Event::State(SessionState::Connecting), next(&rx));
        assert_eq!(Event::State(SessionState::Connected), next(&rx));

        assert!(sess.stop());
        assert_eq!(SessionState::Disconnected, sess.state());
    }

    #[test]
    fn test_stop_while_reconnecting() {
        let broker = LoopbackBroker::new();
        let (sess, rx) = loopback_session(&broker, "cli");
        assert!(sess.start());
        drain(&rx);

        assert!(broker.drop_connection("cli"));
        assert_eq!(Event::State(SessionState::Reconnecting), next(&rx));
        match next(&rx) {
            Event::Error(RC_CONNECTION_LOST, _) => (),
            ev => panic!("Unexpected event: {:?}", ev),
        }

        assert!(sess.stop());
        assert_eq!(SessionState::Disconnected, sess.state());
        assert_eq!(vec![Event::State(SessionState::Disconnected)], drain(&rx));

        // The engine is gone, so a late reconnect changes nothing.
        broker.restore_connection("cli");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(SessionState::Disconnected, sess.state());
        assert!(drain(&rx).is_empty());
    }

    // An engine whose connect blocks until the test lets it go.
    struct GatedEngine {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Engine for GatedEngine {
        fn set_callbacks(&self, _events: std::sync::Weak<dyn EngineEvents>) {}

        fn connect(&self, _opts: &crate::engine::ConnectOptions) -> crate::engine::EngineResult {
            let _ = lock!(self.entered).send(());
            let _ = lock!(self.release).recv();
            Ok(())
        }

        fn disconnect(&self, _timeout: Duration) -> crate::engine::EngineResult {
            Ok(())
        }

        fn subscribe(&self, _topic: &str, _qos: QoS) -> crate::engine::EngineResult {
            Ok(())
        }

        fn unsubscribe(&self, _topic: &str) -> crate::engine::EngineResult {
            Ok(())
        }

        fn publish(&self, _: &str, _: &[u8], _: QoS, _: bool, _: i64) -> crate::engine::EngineResult {
            Ok(())
        }

        fn destroy(&self) {}
    }

    struct GatedFactory(Mutex<Option<Arc<GatedEngine>>>);

    impl crate::engine::EngineFactory for GatedFactory {
        fn create(
            &self,
            _opts: &crate::engine::CreateOptions,
        ) -> crate::engine::EngineResult<Arc<dyn Engine>> {
            match lock!(self.0).take() {
                Some(engine) => Ok(engine),
                None => Err(RC_ENGINE_UNAVAILABLE),
            }
        }
    }

    #[test]
    fn test_stop_during_connect_reports_error() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let engine = Arc::new(GatedEngine {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });

        let engines = Arc::new(GatedFactory(Mutex::new(Some(engine))));
        let fact = ApiFactory::initialize(InitOptions::default(), engines).unwrap();
        let (rec, rx) = Recorder::new();
        let sess = fact.create_session("cli", rec);
        sess.config().set_broker("localhost", 1883);

        let thr_sess = sess.clone();
        let starter = thread::spawn(move || thr_sess.start());

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(sess.stop());
        release_tx.send(()).unwrap();

        assert!(!starter.join().unwrap());
        assert_eq!(SessionState::Disconnected, sess.state());
        assert_eq!(
            vec![
                Event::State(SessionState::Connecting),
                Event::State(SessionState::Disconnected),
                Event::Error(RC_DISCONNECTED, MSG_CONNECT_FAILED.to_string()),
            ],
            drain(&rx)
        );
    }

    #[test]
    fn test_detach_handlers_waits_for_callbacks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Slow(Arc<AtomicUsize>);

        impl MessageHandler for Slow {
            fn on_message(&self, _msg: &MessageView<'_>) {
                thread::sleep(Duration::from_millis(50));
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let broker = LoopbackBroker::new();
        let (sess, _rx) = loopback_session(&broker, "cli");
        let count = Arc::new(AtomicUsize::new(0));
        sess.set_message_handler(Some(Arc::new(Slow(Arc::clone(&count)))));
        assert!(sess.start());
        sess.subscribe("t", QoS::AtMostOnce);

        for _ in 0..5 {
            sess.publish("t", b"x", QoS::AtMostOnce, false);
        }
        thread::sleep(Duration::from_millis(20));

        sess.detach_handlers();
        let n = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(n, count.load(Ordering::SeqCst));
        sess.stop();
    }
}
