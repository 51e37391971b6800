// paho_engine.rs
//
// An engine backed by the Paho MQTT C asynchronous library.
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

//! The Paho C engine.
//!
//! The C library is asynchronous: each request returns at once and later
//! completes through an `onSuccess` or `onFailure` callback. The engine
//! contract is blocking, so each request here passes a boxed channel
//! sender as the callback context, and waits on the receiver. Whichever
//! completion callback runs takes back ownership of the box.
//!
//! Automatic reconnect is turned on whenever the reconnect delay is
//! non-zero. The C library has no "reconnecting" event, so one is raised
//! right after a lost connection when a retry will follow, and
//! "reconnected" is raised from the library's connected callback after the
//! first connection.

use crate::{
    c_trace,
    engine::{ConnectOptions, CreateOptions, Engine, EngineEvents, EngineFactory, EngineResult},
    factory::InitOptions,
    message::MessageView,
    types::QoS,
};
use crossbeam_channel as channel;
use paho_mqtt_sys as ffi;
use std::{
    cell::Cell,
    ffi::{CStr, CString},
    os::raw::{c_char, c_int, c_void},
    panic::{self, AssertUnwindSafe},
    ptr, slice, str,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

/// A general failure, as reported by the C library.
const RC_FAILURE: i32 = -1;

/// A string could not be passed to the C library.
const RC_BAD_STRING: i32 = -5;

/// Extra time allowed past an operation's own timeout.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

thread_local! {
    // Set while this thread is inside an engine callback.
    static IN_CALLBACK: Cell<bool> = Cell::new(false);
}

/// Creates clients of the Paho C library.
#[derive(Debug, Default, Clone, Copy)]
pub struct PahoEngineFactory;

impl PahoEngineFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self
    }
}

impl EngineFactory for PahoEngineFactory {
    fn init(&self, opts: &InitOptions) -> EngineResult {
        c_trace::install(opts);
        Ok(())
    }

    fn create(&self, opts: &CreateOptions) -> EngineResult<Arc<dyn Engine>> {
        let engine = PahoEngine::new(opts)?;
        Ok(Arc::new(engine))
    }
}

/////////////////////////////////////////////////////////////////////////////

// The context handed to the C library for the connection callbacks.
struct EngineContext {
    // Held for reading while a callback runs, so that taking the write lock
    // waits for callbacks in progress.
    events: RwLock<Option<Weak<dyn EngineEvents>>>,
    auto_reconnect: AtomicBool,
    connected_once: AtomicBool,
}

impl EngineContext {
    // Runs the closure against the event receiver, if it's still there.
    unsafe fn with_events<F>(context: *mut c_void, f: F)
    where
        F: FnOnce(&EngineContext, &dyn EngineEvents),
    {
        if context.is_null() {
            return;
        }

        // The C library holds a reference until the client is destroyed.
        // Hold another for the length of the callback.
        let context = context as *const EngineContext;
        Arc::increment_strong_count(context);
        let ctx = Arc::from_raw(context);

        let guard = ctx.events.read().unwrap_or_else(|e| e.into_inner());
        if let Some(events) = guard.as_ref().and_then(Weak::upgrade) {
            let _scope = CallbackScope::enter();
            if panic::catch_unwind(AssertUnwindSafe(|| f(&*ctx, &*events))).is_err() {
                error!("Panic in a Paho engine callback");
            }
        }
    }
}

// Marks the current thread as inside an engine callback until dropped.
struct CallbackScope;

impl CallbackScope {
    fn enter() -> Self {
        IN_CALLBACK.with(|c| c.set(true));
        CallbackScope
    }

    fn is_active() -> bool {
        IN_CALLBACK.with(|c| c.get())
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|c| c.set(false));
    }
}

// The raw client handle.
struct Handle(ffi::MQTTAsync);

// The handle is only ever passed to the C library, which is thread safe.
unsafe impl Send for Handle {}

/// A client of the Paho C library.
pub struct PahoEngine {
    handle: Mutex<Handle>,
    context: Arc<EngineContext>,
    op_timeout: Mutex<Duration>,
    server_uri: String,
}

// The completion channel for a single request.
type Completion = channel::Sender<i32>;

unsafe extern "C" fn on_op_success(context: *mut c_void, _rsp: *mut ffi::MQTTAsync_successData) {
    if !context.is_null() {
        let tx = Box::from_raw(context as *mut Completion);
        let _ = tx.send(0);
    }
}

unsafe extern "C" fn on_op_failure(context: *mut c_void, rsp: *mut ffi::MQTTAsync_failureData) {
    if !context.is_null() {
        let tx = Box::from_raw(context as *mut Completion);
        let rc = match rsp.as_ref() {
            Some(rsp) if rsp.code != 0 => rsp.code as i32,
            _ => RC_FAILURE,
        };
        let _ = tx.send(rc);
    }
}

unsafe extern "C" fn on_connection_lost(context: *mut c_void, cause: *mut c_char) {
    let cause = if cause.is_null() {
        None
    }
    else {
        CStr::from_ptr(cause).to_str().ok()
    };

    EngineContext::with_events(context, |ctx, events| {
        events.connection_lost(cause);
        if ctx.auto_reconnect.load(Ordering::SeqCst) {
            events.reconnecting();
        }
    });
}

unsafe extern "C" fn on_connected(context: *mut c_void, _cause: *mut c_char) {
    EngineContext::with_events(context, |ctx, events| {
        if ctx.connected_once.swap(true, Ordering::SeqCst) {
            events.reconnected();
        }
    });
}

unsafe extern "C" fn on_message_arrived(
    context: *mut c_void,
    topic_name: *mut c_char,
    topic_len: c_int,
    mut cmsg: *mut ffi::MQTTAsync_message,
) -> c_int {
    if !topic_name.is_null() && !cmsg.is_null() {
        // A zero length means a NUL-terminated topic.
        let topic = if topic_len <= 0 {
            CStr::from_ptr(topic_name).to_bytes()
        }
        else {
            slice::from_raw_parts(topic_name as *const u8, topic_len as usize)
        };

        let msg = &*cmsg;
        let payload = if msg.payload.is_null() || msg.payloadlen <= 0 {
            &[][..]
        }
        else {
            slice::from_raw_parts(msg.payload as *const u8, msg.payloadlen as usize)
        };

        match str::from_utf8(topic) {
            Ok(topic) => {
                let qos = QoS::from_ordinal(msg.qos).unwrap_or_default();
                let view = MessageView::new(topic, payload, qos, msg.retained != 0, msg.msgid as i64);
                EngineContext::with_events(context, |_, events| events.message_arrived(&view));
            }
            Err(_) => warn!("Dropping a message with a topic that isn't UTF-8"),
        }
    }

    ffi::MQTTAsync_freeMessage(&mut cmsg);
    ffi::MQTTAsync_free(topic_name as *mut c_void);
    1
}

fn cstring(s: &str) -> EngineResult<CString> {
    CString::new(s).map_err(|_| RC_BAD_STRING)
}

// An optional string; an empty one is passed as NULL.
fn opt_cstring(s: &str) -> EngineResult<Option<CString>> {
    if s.is_empty() {
        Ok(None)
    }
    else {
        cstring(s).map(Some)
    }
}

fn opt_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(ptr::null(), |s| s.as_ptr())
}

fn secs(d: Duration) -> c_int {
    d.as_secs().min(c_int::MAX as u64) as c_int
}

impl PahoEngine {
    fn new(opts: &CreateOptions) -> EngineResult<Self> {
        let server_uri = cstring(&opts.server_uri)?;
        let client_id = cstring(&opts.client_id)?;

        let mut copts = ffi::MQTTAsync_createOptions {
            sendWhileDisconnected: 1,
            maxBufferedMessages: opts.max_buffered_messages,
            ..ffi::MQTTAsync_createOptions::default()
        };

        let mut handle: ffi::MQTTAsync = ptr::null_mut();
        let rc = unsafe {
            ffi::MQTTAsync_createWithOptions(
                &mut handle,
                server_uri.as_ptr(),
                client_id.as_ptr(),
                ffi::MQTTCLIENT_PERSISTENCE_NONE as c_int,
                ptr::null_mut(),
                &mut copts,
            )
        };

        if rc != 0 {
            warn!("Unable to create a Paho client for {}: {}", opts.server_uri, rc);
            return Err(rc);
        }
        debug!("Created Paho client '{}' for {}", opts.client_id, opts.server_uri);

        let context = Arc::new(EngineContext {
            events: RwLock::new(None),
            auto_reconnect: AtomicBool::new(false),
            connected_once: AtomicBool::new(false),
        });

        // The C library owns this reference until the client is destroyed.
        let raw = Arc::into_raw(Arc::clone(&context)) as *mut c_void;
        unsafe {
            ffi::MQTTAsync_setCallbacks(
                handle,
                raw,
                Some(on_connection_lost),
                Some(on_message_arrived),
                None,
            );
            ffi::MQTTAsync_setConnected(handle, raw, Some(on_connected));
        }

        Ok(Self {
            handle: Mutex::new(Handle(handle)),
            context,
            op_timeout: Mutex::new(Duration::from_secs(30)),
            server_uri: opts.server_uri.clone(),
        })
    }

    fn handle(&self) -> EngineResult<ffi::MQTTAsync> {
        let h = lock!(self.handle).0;
        if h.is_null() {
            Err(RC_FAILURE)
        }
        else {
            Ok(h)
        }
    }

    // Issues a request and waits for it to complete.
    //
    // The request closure gets the completion context to put in its
    // options. If the request is rejected outright, no callback will run,
    // so the context is reclaimed here.
    fn request<F>(&self, what: &str, timeout: Duration, f: F) -> EngineResult
    where
        F: FnOnce(ffi::MQTTAsync, *mut c_void) -> c_int,
    {
        let handle = self.handle()?;
        let (tx, rx) = channel::bounded(1);
        let context = Box::into_raw(Box::new(tx)) as *mut c_void;

        let rc = f(handle, context);
        if rc != 0 {
            drop(unsafe { Box::from_raw(context as *mut Completion) });
            debug!("Paho {} request rejected: {}", what, rc);
            return Err(rc);
        }

        match rx.recv_timeout(timeout + TIMEOUT_SLACK) {
            Ok(0) => Ok(()),
            Ok(rc) => {
                debug!("Paho {} failed: {}", what, rc);
                Err(rc)
            }
            Err(_) => {
                warn!("Timed out waiting for Paho {} to complete", what);
                Err(RC_FAILURE)
            }
        }
    }

    fn response_options(context: *mut c_void) -> ffi::MQTTAsync_responseOptions {
        ffi::MQTTAsync_responseOptions {
            onSuccess: Some(on_op_success),
            onFailure: Some(on_op_failure),
            context,
            ..ffi::MQTTAsync_responseOptions::default()
        }
    }
}

impl Engine for PahoEngine {
    fn set_callbacks(&self, events: Weak<dyn EngineEvents>) {
        *self.context.events.write().unwrap_or_else(|e| e.into_inner()) = Some(events);
    }

    fn connect(&self, opts: &ConnectOptions) -> EngineResult {
        let (user, pass) = match opts.credentials.as_ref() {
            Some(cr) => (opt_cstring(&cr.user_name)?, opt_cstring(&cr.password)?),
            None => (None, None),
        };

        let tls = match opts.tls.as_ref() {
            Some(tls) => Some((
                opt_cstring(&tls.trust_store)?,
                opt_cstring(&tls.key_store)?,
                opt_cstring(&tls.private_key)?,
            )),
            None => None,
        };

        let mut ssl_opts = tls.as_ref().map(|(trust, key, private)| ffi::MQTTAsync_SSLOptions {
            trustStore: opt_ptr(trust),
            keyStore: opt_ptr(key),
            privateKey: opt_ptr(private),
            ..ffi::MQTTAsync_SSLOptions::default()
        });

        let retry = secs(opts.retry_interval);
        let auto_reconnect = retry > 0;
        self.context.auto_reconnect.store(auto_reconnect, Ordering::SeqCst);
        *lock!(self.op_timeout) = opts.connect_timeout;

        debug!("Connecting to {}", self.server_uri);

        self.request("connect", opts.connect_timeout, |handle, context| {
            let copts = ffi::MQTTAsync_connectOptions {
                keepAliveInterval: secs(opts.keep_alive_interval),
                cleansession: opts.clean_session as c_int,
                maxInflight: opts.max_inflight,
                connectTimeout: secs(opts.connect_timeout),
                retryInterval: retry,
                username: opt_ptr(&user),
                password: opt_ptr(&pass),
                ssl: ssl_opts
                    .as_mut()
                    .map_or(ptr::null_mut(), |ssl| ssl as *mut _),
                automaticReconnect: auto_reconnect as c_int,
                minRetryInterval: retry.max(1),
                maxRetryInterval: retry.max(60),
                onSuccess: Some(on_op_success),
                onFailure: Some(on_op_failure),
                context,
                ..ffi::MQTTAsync_connectOptions::default()
            };
            unsafe { ffi::MQTTAsync_connect(handle, &copts) }
        })
    }

    fn disconnect(&self, timeout: Duration) -> EngineResult {
        self.request("disconnect", timeout, |handle, context| {
            let mut dopts = ffi::MQTTAsync_disconnectOptions {
                timeout: timeout.as_millis().min(c_int::MAX as u128) as c_int,
                onSuccess: Some(on_op_success),
                onFailure: Some(on_op_failure),
                context,
                ..ffi::MQTTAsync_disconnectOptions::default()
            };
            unsafe { ffi::MQTTAsync_disconnect(handle, &mut dopts) }
        })
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> EngineResult {
        let ctopic = cstring(topic)?;
        let timeout = *lock!(self.op_timeout);

        self.request("subscribe", timeout, |handle, context| {
            let mut rsp = Self::response_options(context);
            unsafe { ffi::MQTTAsync_subscribe(handle, ctopic.as_ptr(), i32::from(qos), &mut rsp) }
        })
    }

    fn unsubscribe(&self, topic: &str) -> EngineResult {
        let ctopic = cstring(topic)?;
        let timeout = *lock!(self.op_timeout);

        self.request("unsubscribe", timeout, |handle, context| {
            let mut rsp = Self::response_options(context);
            unsafe { ffi::MQTTAsync_unsubscribe(handle, ctopic.as_ptr(), &mut rsp) }
        })
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retained: bool, id: i64) -> EngineResult {
        let ctopic = cstring(topic)?;
        let timeout = *lock!(self.op_timeout);
        trace!("Publishing message {} to '{}'", id, topic);

        self.request("publish", timeout, |handle, context| {
            let msg = ffi::MQTTAsync_message {
                payload: payload.as_ptr() as *mut c_void,
                payloadlen: payload.len() as c_int,
                qos: i32::from(qos),
                retained: retained as c_int,
                ..ffi::MQTTAsync_message::default()
            };
            let mut rsp = Self::response_options(context);
            unsafe { ffi::MQTTAsync_sendMessage(handle, ctopic.as_ptr(), &msg, &mut rsp) }
        })
    }

    fn destroy(&self) {
        let mut handle = std::mem::replace(&mut *lock!(self.handle), Handle(ptr::null_mut()));
        if handle.0.is_null() {
            return;
        }

        unsafe { ffi::MQTTAsync_destroy(&mut handle.0) };

        // Wait out any callback in progress, unless we're inside one.
        if CallbackScope::is_active() {
            if let Ok(mut events) = self.context.events.try_write() {
                *events = None;
            }
        }
        else {
            *self.context.events.write().unwrap_or_else(|e| e.into_inner()) = None;
        }

        // Take back the reference the C library held.
        unsafe { Arc::decrement_strong_count(Arc::as_ptr(&self.context)) };
        debug!("Destroyed Paho client for {}", self.server_uri);
    }
}

impl Drop for PahoEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////
