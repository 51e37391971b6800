// loopback.rs
//
// An in-process engine that routes messages between local clients.
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

//! The loopback engine.
//!
//! A [`LoopbackBroker`] stands in for a real broker and network. Clients
//! created from its engine factory "connect" to it, and messages
//! published by any of them are routed to every connected client with a
//! matching subscription. It is intended for tests and for running the
//! library without a network.
//!
//! As with a real engine, each client has its own delivery thread, and
//! all events are raised on that thread, never on the caller's.
//!
//! The broker can also be told to misbehave: to fail the next call of an
//! operation with a given code, to refuse connections, to require
//! credentials, or to drop and later restore a client's connection.
//!
//! ```
//! use polar_mqtt::{LoopbackBroker, Operation};
//!
//! let broker = LoopbackBroker::new();
//! broker.fail_next(Operation::Publish, -5);
//! let engines = broker.engine_factory();
//! # let _ = engines;
//! ```

use crate::{
    engine::{ConnectOptions, CreateOptions, Engine, EngineEvents, EngineFactory, EngineResult},
    message::{Message, MessageView},
    topic_matcher::TopicMatcher,
    types::QoS,
};
use crossbeam_channel::{self as channel, Receiver, Sender};
use std::{
    collections::{HashMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

/// A general failure.
pub const RC_FAILURE: i32 = -1;

/// The client is not connected to the broker.
pub const RC_NOT_CONNECTED: i32 = -3;

/// The broker refused the credentials (CONNACK "not authorized").
pub const RC_NOT_AUTHORIZED: i32 = 5;

/// The most published messages the broker remembers.
pub const PUBLISHED_LOG_CAP: usize = 1024;

/// An engine operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Creating a client
    Create,
    /// Connecting
    Connect,
    /// Disconnecting
    Disconnect,
    /// Subscribing
    Subscribe,
    /// Unsubscribing
    Unsubscribe,
    /// Publishing
    Publish,
}

// Something for a client's delivery thread to do.
enum Delivery {
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retained: bool,
        id: i64,
    },
    ConnectionLost(String),
    Reconnecting,
    Reconnected,
    Shutdown,
}

// The broker's view of one client.
struct ClientLink {
    engine_id: u64,
    tx: Sender<Delivery>,
    subscriptions: TopicMatcher<QoS>,
    online: bool,
    clean_session: bool,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientLink>,
    retained: HashMap<String, (Vec<u8>, QoS)>,
    failures: HashMap<Operation, VecDeque<i32>>,
    refuse_code: Option<i32>,
    credentials: Option<(String, String)>,
    published: VecDeque<Message>,
    next_msg_id: i64,
}

impl BrokerState {
    fn take_failure(&mut self, op: Operation) -> EngineResult {
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(rc) => Err(rc),
            None => Ok(()),
        }
    }

    fn online_link(&mut self, client_id: &str, engine_id: u64) -> EngineResult<&mut ClientLink> {
        match self.clients.get_mut(client_id) {
            Some(link) if link.engine_id == engine_id && link.online => Ok(link),
            _ => Err(RC_NOT_CONNECTED),
        }
    }

    fn next_id(&mut self) -> i64 {
        self.next_msg_id += 1;
        self.next_msg_id
    }
}

/// An in-process stand-in for an MQTT broker.
///
/// This is cheap to clone; all clones share the same broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    /// Creates a new broker with no clients.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets an engine factory whose clients connect to this broker.
    pub fn engine_factory(&self) -> Arc<dyn EngineFactory> {
        Arc::new(LoopbackEngineFactory {
            broker: self.clone(),
        })
    }

    /// Makes the next call of the operation fail with the code.
    ///
    /// Calls queue up, so failing the same operation twice fails its next
    /// two calls.
    pub fn fail_next(&self, op: Operation, rc: i32) {
        lock!(self.state).failures.entry(op).or_default().push_back(rc);
    }

    /// Refuses all connections with the code, or accepts them again with
    /// `None`.
    pub fn refuse_connections(&self, rc: Option<i32>) {
        lock!(self.state).refuse_code = rc;
    }

    /// Only accepts connections with this user name and password.
    pub fn require_credentials(&self, user_name: &str, password: &str) {
        lock!(self.state).credentials = Some((user_name.to_string(), password.to_string()));
    }

    /// Determines if the client is connected and online.
    pub fn is_connected(&self, client_id: &str) -> bool {
        lock!(self.state)
            .clients
            .get(client_id)
            .map_or(false, |link| link.online)
    }

    /// Determines if the client holds a subscription to the exact filter.
    pub fn has_subscription(&self, client_id: &str, filter: &str) -> bool {
        lock!(self.state)
            .clients
            .get(client_id)
            .map_or(false, |link| link.subscriptions.get(filter).is_some())
    }

    /// Gets a copy of the messages accepted for publishing, in order.
    ///
    /// Only the last [`PUBLISHED_LOG_CAP`] are kept.
    pub fn published(&self) -> Vec<Message> {
        lock!(self.state).published.iter().cloned().collect()
    }

    /// Forgets the published and retained messages, and any failures
    /// still queued. Connected clients and their subscriptions stay.
    pub fn reset(&self) {
        let mut state = lock!(self.state);
        state.published.clear();
        state.retained.clear();
        state.failures.clear();
    }

    /// Simulates a network failure for the client.
    ///
    /// The client's engine reports the connection as lost, and the client
    /// stays offline until [`restore_connection`](Self::restore_connection).
    pub fn drop_connection(&self, client_id: &str) -> bool {
        let mut state = lock!(self.state);
        match state.clients.get_mut(client_id) {
            Some(link) if link.online => {
                link.online = false;
                let _ = link.tx.send(Delivery::ConnectionLost("Connection reset by peer".into()));
                true
            }
            _ => false,
        }
    }

    /// Simulates the client's engine reconnecting after a dropped
    /// connection.
    pub fn restore_connection(&self, client_id: &str) -> bool {
        let mut state = lock!(self.state);
        match state.clients.get_mut(client_id) {
            Some(link) if !link.online => {
                let _ = link.tx.send(Delivery::Reconnecting);
                link.online = true;
                let _ = link.tx.send(Delivery::Reconnected);
                true
            }
            _ => false,
        }
    }

    fn connect(&self, client_id: &str, engine_id: u64, tx: &Sender<Delivery>, opts: &ConnectOptions)
        -> EngineResult
    {
        let mut state = lock!(self.state);
        state.take_failure(Operation::Connect)?;

        if let Some(rc) = state.refuse_code {
            return Err(rc);
        }

        if let Some((user, pass)) = state.credentials.as_ref() {
            match opts.credentials.as_ref() {
                Some(cr) if &cr.user_name == user && &cr.password == pass => (),
                _ => return Err(RC_NOT_AUTHORIZED),
            }
        }

        // A prior session is only resumed if both sides asked for it.
        let subscriptions = match state.clients.remove(client_id) {
            Some(prev) => {
                if prev.online && prev.engine_id != engine_id {
                    let _ = prev.tx.send(Delivery::ConnectionLost("Client ID taken over".into()));
                }
                if opts.clean_session || prev.clean_session {
                    TopicMatcher::new()
                }
                else {
                    prev.subscriptions
                }
            }
            None => TopicMatcher::new(),
        };

        state.clients.insert(
            client_id.to_string(),
            ClientLink {
                engine_id,
                tx: tx.clone(),
                subscriptions,
                online: true,
                clean_session: opts.clean_session,
            },
        );
        Ok(())
    }

    fn disconnect(&self, client_id: &str, engine_id: u64) -> EngineResult {
        let mut state = lock!(self.state);
        state.take_failure(Operation::Disconnect)?;
        Self::detach(&mut state, client_id, engine_id);
        Ok(())
    }

    fn detach(state: &mut BrokerState, client_id: &str, engine_id: u64) {
        let clean = match state.clients.get_mut(client_id) {
            Some(link) if link.engine_id == engine_id => {
                link.online = false;
                link.clean_session
            }
            _ => return,
        };
        if clean {
            state.clients.remove(client_id);
        }
    }

    fn subscribe(&self, client_id: &str, engine_id: u64, filter: &str, qos: QoS) -> EngineResult {
        let mut state = lock!(self.state);
        state.take_failure(Operation::Subscribe)?;
        if filter.is_empty() {
            return Err(RC_FAILURE);
        }

        let link = state.online_link(client_id, engine_id)?;
        link.subscriptions.insert(filter, qos);
        let tx = link.tx.clone();

        let mut replay = Vec::new();
        for (topic, (payload, rqos)) in state.retained.iter() {
            let mut m = TopicMatcher::new();
            m.insert(filter, ());
            if m.has_match(topic) {
                replay.push((topic.clone(), payload.clone(), (*rqos).min(qos)));
            }
        }

        for (topic, payload, qos) in replay {
            let id = state.next_id();
            let _ = tx.send(Delivery::Message {
                topic,
                payload,
                qos,
                retained: true,
                id,
            });
        }
        Ok(())
    }

    fn unsubscribe(&self, client_id: &str, engine_id: u64, filter: &str) -> EngineResult {
        let mut state = lock!(self.state);
        state.take_failure(Operation::Unsubscribe)?;
        let link = state.online_link(client_id, engine_id)?;
        link.subscriptions.remove(filter);
        Ok(())
    }

    fn publish(&self, client_id: &str, engine_id: u64, topic: &str, payload: &[u8], qos: QoS, retained: bool)
        -> EngineResult
    {
        let mut state = lock!(self.state);
        state.take_failure(Operation::Publish)?;
        state.online_link(client_id, engine_id)?;

        if topic.is_empty() || topic.contains(|c: char| c == '+' || c == '#') {
            return Err(RC_FAILURE);
        }

        if retained {
            if payload.is_empty() {
                state.retained.remove(topic);
            }
            else {
                state.retained.insert(topic.to_string(), (payload.to_vec(), qos));
            }
        }

        let msg = Message::new(topic, payload).with_qos(qos).with_retain(retained);
        if state.published.len() == PUBLISHED_LOG_CAP {
            state.published.pop_front();
        }
        state.published.push_back(msg);

        let targets: Vec<_> = state
            .clients
            .values()
            .filter(|link| link.online)
            .filter_map(|link| {
                link.subscriptions
                    .matches(topic)
                    .into_iter()
                    .map(|(_, sub_qos)| *sub_qos)
                    .max()
                    .map(|sub_qos| (link.tx.clone(), sub_qos.min(qos)))
            })
            .collect();

        for (tx, qos) in targets {
            let id = state.next_id();
            let _ = tx.send(Delivery::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
                retained: false,
                id,
            });
        }
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////

struct LoopbackEngineFactory {
    broker: LoopbackBroker,
}

impl EngineFactory for LoopbackEngineFactory {
    fn create(&self, opts: &CreateOptions) -> EngineResult<Arc<dyn Engine>> {
        lock!(self.broker.state).take_failure(Operation::Create)?;
        let engine = LoopbackEngine::new(self.broker.clone(), opts)?;
        Ok(Arc::new(engine))
    }
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

type EventSlot = Arc<Mutex<Option<Weak<dyn EngineEvents>>>>;

/// A client of a [`LoopbackBroker`].
pub struct LoopbackEngine {
    id: u64,
    client_id: String,
    broker: LoopbackBroker,
    tx: Sender<Delivery>,
    events: EventSlot,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl LoopbackEngine {
    fn new(broker: LoopbackBroker, opts: &CreateOptions) -> EngineResult<Self> {
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::unbounded();
        let events: EventSlot = Arc::new(Mutex::new(None));

        let thr_events = Arc::clone(&events);
        let worker = thread::Builder::new()
            .name(format!("loopback-{}", opts.client_id))
            .spawn(move || Self::run(rx, thr_events))
            .map_err(|err| {
                warn!("Unable to start the loopback delivery thread: {}", err);
                RC_FAILURE
            })?;

        debug!("Created loopback client '{}' for {}", opts.client_id, opts.server_uri);

        Ok(Self {
            id,
            client_id: opts.client_id.clone(),
            broker,
            tx,
            events,
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    // The delivery thread. Each event is raised against the registered
    // receiver, if it is still alive. Message buffers are dropped once the
    // callback returns.
    fn run(rx: Receiver<Delivery>, events: EventSlot) {
        for delivery in rx.iter() {
            if let Delivery::Shutdown = delivery {
                break;
            }

            let target = lock!(events).as_ref().and_then(Weak::upgrade);
            let target = match target {
                Some(target) => target,
                None => continue,
            };

            let res = panic::catch_unwind(AssertUnwindSafe(|| match delivery {
                Delivery::Message { topic, payload, qos, retained, id } => {
                    let view = MessageView::new(&topic, &payload, qos, retained, id);
                    target.message_arrived(&view);
                }
                Delivery::ConnectionLost(cause) => target.connection_lost(Some(cause.as_str())),
                Delivery::Reconnecting => target.reconnecting(),
                Delivery::Reconnected => target.reconnected(),
                Delivery::Shutdown => (),
            }));

            if res.is_err() {
                error!("Panic in a loopback event callback");
            }
        }
        trace!("Loopback delivery thread exiting");
    }
}

impl Engine for LoopbackEngine {
    fn set_callbacks(&self, events: Weak<dyn EngineEvents>) {
        *lock!(self.events) = Some(events);
    }

    fn connect(&self, opts: &ConnectOptions) -> EngineResult {
        self.broker.connect(&self.client_id, self.id, &self.tx, opts)
    }

    fn disconnect(&self, _timeout: Duration) -> EngineResult {
        self.broker.disconnect(&self.client_id, self.id)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> EngineResult {
        self.broker.subscribe(&self.client_id, self.id, topic, qos)
    }

    fn unsubscribe(&self, topic: &str) -> EngineResult {
        self.broker.unsubscribe(&self.client_id, self.id, topic)
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retained: bool, _id: i64) -> EngineResult {
        self.broker.publish(&self.client_id, self.id, topic, payload, qos, retained)
    }

    fn destroy(&self) {
        LoopbackBroker::detach(&mut lock!(self.broker.state), &self.client_id, self.id);

        let worker = lock!(self.worker).take();
        if let Some(worker) = worker {
            let _ = self.tx.send(Delivery::Shutdown);
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
        *lock!(self.events) = None;
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////
