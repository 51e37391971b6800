// client.rs
//
// The safe Rust client, built on the flat C interface.
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

//! The safe client.
//!
//! This is the consumer's side of the C interface, written the way any
//! foreign caller would use it: strings are converted to C strings up
//! front (so a string with a NUL fails before anything crosses the
//! boundary), every failing return code becomes a typed [`Error`], and
//! callbacks come back through `extern "C"` trampolines that find the
//! user's closures through the context pointer.
//!
//! The closures live in a reference counted, lock protected context. One
//! reference is lent to the C side for as long as the session exists, and
//! is reclaimed when the [`Client`] is dropped, after the session has been
//! stopped and destroyed. From then on no closure is called.
//!
//! ```no_run
//! use polar_mqtt::{Client, Library, QoS};
//!
//! let lib = Library::init("sample", "1.0").unwrap();
//! let cli = Client::builder(&lib, "sample_client")
//!     .on_message(|msg| println!("{}", msg))
//!     .finalize()
//!     .unwrap();
//!
//! cli.connect("localhost", 1883).unwrap();
//! cli.subscribe("sample/#", QoS::AtLeastOnce).unwrap();
//! cli.publish_bytes("sample/hello", b"Hello", QoS::AtLeastOnce, false).unwrap();
//! ```

use crate::{
    bridge::{self, MqttMessageData, SessionHandle, MQTT_NULL_SESSION},
    engine::EngineFactory,
    errors::{Error, Result, MQTT_SUCCESS},
    factory::InitOptions,
    message::{Message, MessageView},
    types::{Parameter, QoS, SessionState},
};
use crossbeam_channel as channel;
use libc::{c_char, c_int, c_void};
use std::{
    ffi::{CStr, CString},
    fmt,
    panic::{self, AssertUnwindSafe},
    ptr, slice,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
    time::Duration,
};

/// User callback for arriving messages. The view is only valid for the
/// call.
pub type MessageCallback = dyn Fn(&MessageView<'_>) + Send + Sync + 'static;

/// User callback for changes of session state.
pub type StateCallback = dyn Fn(SessionState) + Send + Sync + 'static;

/// User callback for errors, with the code and a description.
pub type ErrorCallback = dyn Fn(i32, &str) + Send + Sync + 'static;

/////////////////////////////////////////////////////////////////////////////
// Library

// Holds one reference to the initialized C library.
struct LibraryRef;

impl Drop for LibraryRef {
    fn drop(&mut self) {
        bridge::mqtt_uninitialize();
    }
}

/// A reference to the initialized library.
///
/// The library stays initialized while any clone of this, or any client
/// created from it, is alive.
#[derive(Clone)]
pub struct Library {
    _inner: Arc<LibraryRef>,
}

impl Library {
    /// Initializes the library with the engine compiled into it.
    pub fn init(app_name: &str, app_version: &str) -> Result<Self> {
        Self::with_options(InitOptions::new(app_name, app_version), None)
    }

    /// Initializes the library to use the given engine.
    ///
    /// The engine only takes effect if the library is not already
    /// initialized.
    pub fn with_engine(app_name: &str, app_version: &str, engines: Arc<dyn EngineFactory>) -> Result<Self> {
        Self::with_options(InitOptions::new(app_name, app_version), Some(engines))
    }

    /// Initializes the library with full options.
    pub fn with_options(opts: InitOptions, engines: Option<Arc<dyn EngineFactory>>) -> Result<Self> {
        let app_name = CString::new(opts.app_name())?;
        let app_version = CString::new(opts.app_version())?;
        let log_file = match opts.log_file_path() {
            Some(path) => {
                let path = path.to_str().ok_or(Error::InitializationError)?;
                Some(CString::new(path)?)
            }
            None => None,
        };

        if let Some(engines) = engines {
            bridge::install_engine_factory(engines);
        }

        let rc = unsafe {
            bridge::mqtt_initialize(
                app_name.as_ptr(),
                app_version.as_ptr(),
                opts.is_debug() as c_int,
                log_file.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            )
        };

        if rc != MQTT_SUCCESS {
            warn!("Library initialization failed: {}", rc);
            return Err(Error::InitializationError);
        }

        Ok(Self {
            _inner: Arc::new(LibraryRef),
        })
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Library")
    }
}

/////////////////////////////////////////////////////////////////////////////
// Callback context

// Where arriving messages are queued, for clients that consume them.
// `None` is queued when the connection is lost.
#[derive(Clone)]
enum Consumer {
    Channel(channel::Sender<Option<Message>>),
    Stream(async_channel::Sender<Option<Message>>),
}

impl Consumer {
    fn send(&self, msg: Option<Message>) {
        match self {
            Consumer::Channel(tx) => {
                let _ = tx.send(msg);
            }
            Consumer::Stream(tx) => {
                if tx.try_send(msg).is_err() {
                    debug!("Stream consumer full or closed; message dropped");
                }
            }
        }
    }
}

// The user callbacks, shared with the C side.
//
// The lock is only held to clone out what a callback needs, never while
// user code runs, so the closures are free to use their own client.
#[derive(Default)]
struct CallbackContext {
    on_message: Option<Arc<MessageCallback>>,
    on_state_change: Option<Arc<StateCallback>>,
    on_error: Option<Arc<ErrorCallback>>,
    consumer: Option<Consumer>,
}

type SharedContext = RwLock<CallbackContext>;

fn read(ctx: &SharedContext) -> RwLockReadGuard<'_, CallbackContext> {
    ctx.read().unwrap_or_else(PoisonError::into_inner)
}

// Takes a strong reference to the context for the length of a callback.
//
// The reference lent to the C side is alive while callbacks can be made,
// but a closure may drop its own client, which gives that one back.
unsafe fn context_ref(context: *mut c_void) -> Option<Arc<SharedContext>> {
    if context.is_null() {
        return None;
    }
    let ptr = context as *const SharedContext;
    Arc::increment_strong_count(ptr);
    Some(Arc::from_raw(ptr))
}

// Calls into user code, keeping any panic on this side of the boundary.
fn invoke<F: FnOnce()>(what: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("The {} callback panicked", what);
    }
}

unsafe extern "C" fn on_message_trampoline(msg: *const MqttMessageData, context: *mut c_void) {
    if msg.is_null() {
        return;
    }
    let ctx = match context_ref(context) {
        Some(ctx) => ctx,
        None => return,
    };
    let data = &*msg;

    if data.topic.is_null() {
        return;
    }
    let topic = match CStr::from_ptr(data.topic).to_str() {
        Ok(topic) => topic,
        Err(_) => {
            warn!("Dropping a message with a topic that isn't UTF-8");
            return;
        }
    };

    let payload = if data.payload.is_null() || data.payload_length == 0 {
        &[][..]
    }
    else {
        slice::from_raw_parts(data.payload, data.payload_length)
    };

    let qos = QoS::from_ordinal(data.qos).unwrap_or_default();
    let view = MessageView::new(topic, payload, qos, data.retained != 0, data.message_id);

    let (consumer, cb) = {
        let ctx = read(&ctx);
        (ctx.consumer.clone(), ctx.on_message.clone())
    };

    invoke("message", || {
        if let Some(consumer) = consumer {
            consumer.send(Some(view.to_message()));
        }
        if let Some(cb) = cb {
            cb(&view);
        }
    });
}

unsafe extern "C" fn on_state_trampoline(state: c_int, context: *mut c_void) {
    let ctx = match context_ref(context) {
        Some(ctx) => ctx,
        None => return,
    };
    let state = SessionState::from(state);

    let (consumer, cb) = {
        let ctx = read(&ctx);
        let consumer = match state {
            SessionState::Reconnecting => ctx.consumer.clone(),
            _ => None,
        };
        (consumer, ctx.on_state_change.clone())
    };

    invoke("state", || {
        if let Some(consumer) = consumer {
            consumer.send(None);
        }
        if let Some(cb) = cb {
            cb(state);
        }
    });
}

unsafe extern "C" fn on_error_trampoline(code: c_int, msg: *const c_char, context: *mut c_void) {
    let ctx = match context_ref(context) {
        Some(ctx) => ctx,
        None => return,
    };

    // Copied out, as the C string goes away when we return.
    let msg = if msg.is_null() {
        String::new()
    }
    else {
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    };

    let cb = read(&ctx).on_error.clone();
    if let Some(cb) = cb {
        invoke("error", || cb(code, &msg));
    }
}

/////////////////////////////////////////////////////////////////////////////
// Client

/// Builds a [`Client`] with any of the three callbacks.
pub struct ClientBuilder {
    lib: Library,
    client_id: String,
    ctx: CallbackContext,
}

impl ClientBuilder {
    /// Starts a builder for a client with the given identifier.
    pub fn new(lib: &Library, client_id: &str) -> Self {
        Self {
            lib: lib.clone(),
            client_id: client_id.to_string(),
            ctx: CallbackContext::default(),
        }
    }

    /// Sets the callback for arriving messages.
    pub fn on_message<F>(mut self, cb: F) -> Self
    where
        F: Fn(&MessageView<'_>) + Send + Sync + 'static,
    {
        self.ctx.on_message = Some(Arc::new(cb));
        self
    }

    /// Sets the callback for state changes.
    pub fn on_state_change<F>(mut self, cb: F) -> Self
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        self.ctx.on_state_change = Some(Arc::new(cb));
        self
    }

    /// Sets the callback for errors.
    pub fn on_error<F>(mut self, cb: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.ctx.on_error = Some(Arc::new(cb));
        self
    }

    /// Creates the client.
    pub fn finalize(self) -> Result<Client> {
        Client::create(self.lib, &self.client_id, self.ctx)
    }
}

/// An MQTT client session.
///
/// The client can be shared between threads. Dropping it stops the
/// session and destroys it.
///
/// The callbacks run on the engine's thread. They may use their own
/// client, including stopping it, replacing its callbacks, or dropping it.
pub struct Client {
    handle: SessionHandle,
    client_id: String,
    context: Arc<SharedContext>,
    _lib: Library,
}

impl Client {
    /// Creates a client with optional callbacks.
    pub fn new(
        lib: &Library,
        client_id: &str,
        on_message: Option<Box<MessageCallback>>,
        on_state_change: Option<Box<StateCallback>>,
        on_error: Option<Box<ErrorCallback>>,
    ) -> Result<Self> {
        let ctx = CallbackContext {
            on_message: on_message.map(Arc::from),
            on_state_change: on_state_change.map(Arc::from),
            on_error: on_error.map(Arc::from),
            consumer: None,
        };
        Self::create(lib.clone(), client_id, ctx)
    }

    /// Starts building a client.
    pub fn builder(lib: &Library, client_id: &str) -> ClientBuilder {
        ClientBuilder::new(lib, client_id)
    }

    fn create(lib: Library, client_id: &str, ctx: CallbackContext) -> Result<Self> {
        let c_client_id = CString::new(client_id)?;
        let context = Arc::new(RwLock::new(ctx));

        // Lent to the C side until the session is destroyed.
        let raw = Arc::into_raw(Arc::clone(&context)) as *mut c_void;

        let handle = unsafe {
            bridge::mqtt_create_session(
                c_client_id.as_ptr(),
                Some(on_message_trampoline),
                Some(on_state_trampoline),
                Some(on_error_trampoline),
                raw,
            )
        };

        if handle == MQTT_NULL_SESSION {
            unsafe { Arc::decrement_strong_count(raw as *const SharedContext) };
            return Err(Error::InitializationError);
        }

        debug!("Created client '{}' as session {}", client_id, handle);
        Ok(Self {
            handle,
            client_id: client_id.to_string(),
            context,
            _lib: lib,
        })
    }

    /// Gets the client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Gets the session handle used with the C interface.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    fn write_context<F: FnOnce(&mut CallbackContext)>(&self, f: F) {
        let mut ctx = self.context.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut ctx);
    }

    /// Replaces the message callback.
    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&MessageView<'_>) + Send + Sync + 'static,
    {
        self.write_context(|ctx| ctx.on_message = Some(Arc::new(cb)));
    }

    /// Replaces the state change callback.
    pub fn set_state_callback<F>(&self, cb: F)
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        self.write_context(|ctx| ctx.on_state_change = Some(Arc::new(cb)));
    }

    /// Replaces the error callback.
    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.write_context(|ctx| ctx.on_error = Some(Arc::new(cb)));
    }

    /// Removes all the callbacks.
    pub fn clear_callbacks(&self) {
        self.write_context(|ctx| {
            ctx.on_message = None;
            ctx.on_state_change = None;
            ctx.on_error = None;
        });
    }

    /// Starts queuing arriving messages, and gets the receiver for them.
    ///
    /// A `None` is queued when the connection is lost. This should be
    /// called before subscribing, or messages may be missed.
    pub fn start_consuming(&self) -> channel::Receiver<Option<Message>> {
        let (tx, rx) = channel::unbounded();
        self.write_context(|ctx| ctx.consumer = Some(Consumer::Channel(tx)));
        rx
    }

    /// Starts queuing arriving messages into a bounded async stream.
    ///
    /// Messages that arrive while the stream is full are dropped.
    pub fn get_stream(&self, buffer_sz: usize) -> async_channel::Receiver<Option<Message>> {
        let (tx, rx) = async_channel::bounded(buffer_sz.max(1));
        self.write_context(|ctx| ctx.consumer = Some(Consumer::Stream(tx)));
        rx
    }

    /// Stops queuing arriving messages.
    pub fn stop_consuming(&self) {
        self.write_context(|ctx| ctx.consumer = None);
    }

    /// Sets the broker host and port.
    pub fn set_broker(&self, host: &str, port: u16) -> Result<()> {
        let c_host = CString::new(host)?;
        if host.trim().is_empty() {
            return Err(Error::InvalidBrokerUrl);
        }

        match unsafe { bridge::mqtt_set_broker(self.handle, c_host.as_ptr(), port) } {
            MQTT_SUCCESS => Ok(()),
            _ => Err(Error::InvalidBrokerUrl),
        }
    }

    /// Sets the user name and password.
    pub fn set_credentials(&self, user_name: &str, password: &str) -> Result<()> {
        let c_user = CString::new(user_name)?;
        let c_pass = CString::new(password)?;
        if user_name.is_empty() {
            return Err(Error::InvalidCredentials);
        }

        match unsafe { bridge::mqtt_set_credentials(self.handle, c_user.as_ptr(), c_pass.as_ptr()) } {
            MQTT_SUCCESS => Ok(()),
            _ => Err(Error::InvalidCredentials),
        }
    }

    /// Sets the TLS certificate files, which also turns TLS on.
    pub fn set_tls(&self, ca_file: &str, cert_file: &str, key_file: &str) -> Result<()> {
        let ca = CString::new(ca_file)?;
        let cert = CString::new(cert_file)?;
        let key = CString::new(key_file)?;

        let rc = unsafe {
            bridge::mqtt_set_tls_certificates(self.handle, ca.as_ptr(), cert.as_ptr(), key.as_ptr())
        };
        self.check(rc)
    }

    /// Sets an integer parameter. A boolean parameter is ignored.
    pub fn set_int_parameter(&self, param: Parameter, value: i32) -> Result<()> {
        self.check(bridge::mqtt_set_int_parameter(self.handle, param.into(), value))
    }

    /// Sets a boolean parameter. An integer parameter is ignored.
    pub fn set_bool_parameter(&self, param: Parameter, value: bool) -> Result<()> {
        self.check(bridge::mqtt_set_bool_parameter(self.handle, param.into(), value as c_int))
    }

    /// Sets the keep alive interval, to the second.
    pub fn set_keep_alive(&self, interval: Duration) -> Result<()> {
        self.set_int_parameter(Parameter::KeepAliveInterval, secs(interval))
    }

    /// Sets whether the broker should discard any previous session.
    pub fn set_clean_session(&self, clean: bool) -> Result<()> {
        self.set_bool_parameter(Parameter::CleanSession, clean)
    }

    /// Sets the time allowed to connect, to the second.
    pub fn set_connection_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_int_parameter(Parameter::ConnectionTimeout, secs(timeout))
    }

    /// Sets the delay between reconnect attempts, to the second.
    pub fn set_reconnect_delay(&self, delay: Duration) -> Result<()> {
        self.set_int_parameter(Parameter::ReconnectDelay, secs(delay))
    }

    fn check(&self, rc: c_int) -> Result<()> {
        if rc == MQTT_SUCCESS {
            Ok(())
        }
        else {
            Err(Error::InvalidSession)
        }
    }

    /// Connects to the configured broker, blocking until done.
    ///
    /// The reason for a failure also goes to the error callback.
    pub fn start(&self) -> Result<()> {
        match bridge::mqtt_session_start(self.handle) {
            MQTT_SUCCESS => Ok(()),
            _ => Err(Error::ConnectionError),
        }
    }

    /// Sets the broker, then connects to it.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.set_broker(host, port)?;
        self.start()
    }

    /// Disconnects from the broker. Stopping a stopped client does nothing.
    pub fn stop(&self) -> Result<()> {
        self.check(bridge::mqtt_session_stop(self.handle))
    }

    /// Gets the current session state.
    pub fn state(&self) -> SessionState {
        SessionState::from(bridge::mqtt_session_get_state(self.handle))
    }

    /// Determines if the client is connected.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Subscribes to a topic filter, returning the subscription handle.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<i64> {
        let c_topic = CString::new(topic)?;
        if topic.is_empty() {
            return Err(Error::InvalidTopic);
        }

        match unsafe { bridge::mqtt_subscribe(self.handle, c_topic.as_ptr(), qos.into()) } {
            -1 => Err(Error::SubscriptionError),
            handle => Ok(handle),
        }
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, handle: i64) -> Result<()> {
        match bridge::mqtt_unsubscribe(self.handle, handle) {
            MQTT_SUCCESS => Ok(()),
            _ => Err(Error::UnsubscriptionError),
        }
    }

    /// Publishes a message, returning its message id.
    pub fn publish(&self, msg: &Message) -> Result<i64> {
        self.publish_bytes(msg.topic(), msg.payload(), msg.qos(), msg.is_retained())
    }

    /// Publishes a payload, returning the message id.
    pub fn publish_bytes(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<i64> {
        let c_topic = CString::new(topic)?;
        if topic.is_empty() {
            return Err(Error::InvalidTopic);
        }

        let id = unsafe {
            bridge::mqtt_publish(
                self.handle,
                c_topic.as_ptr(),
                payload.as_ptr(),
                payload.len(),
                qos.into(),
                retain as c_int,
            )
        };

        match id {
            -1 => Err(Error::PublicationError),
            id => Ok(id),
        }
    }
}

fn secs(d: Duration) -> i32 {
    d.as_secs().min(i32::MAX as u64) as i32
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = bridge::mqtt_session_stop(self.handle);
        bridge::mqtt_destroy_session(self.handle);

        // Take back the reference lent to the C side.
        unsafe { Arc::decrement_strong_count(Arc::as_ptr(&self.context)) };
        debug!("Dropped client '{}'", self.client_id);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id)
            .field("handle", &self.handle)
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{MSG_BROKER_NOT_SET, MSG_PUBLISH_FAILED},
        loopback::{LoopbackBroker, Operation},
    };
    use serial_test::serial;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
        thread,
    };

    fn library(broker: &LoopbackBroker) -> Library {
        let _ = env_logger::builder().is_test(true).try_init();
        Library::with_engine("test", "1.0", broker.engine_factory()).unwrap()
    }

    fn wait_for<F: Fn() -> bool>(f: F) -> bool {
        for _ in 0..500 {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    #[serial]
    fn test_create_without_init() {
        let lib = Library {
            _inner: Arc::new(LibraryRef),
        };
        // The fake reference must not release anything.
        std::mem::forget(lib.clone());
        let res = Client::builder(&lib, "cli").finalize();
        assert!(matches!(res, Err(Error::InitializationError)));
    }

    #[test]
    #[serial]
    fn test_library_refs() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let lib2 = lib.clone();
        drop(lib);

        let cli = Client::builder(&lib2, "cli").finalize().unwrap();
        drop(lib2);

        // The client keeps the library alive
        assert_eq!(1, bridge::mqtt_session_count());
        drop(cli);
        assert_eq!(0, bridge::mqtt_session_count());

        let res = Client::builder(&library(&broker), "cli").finalize();
        assert!(res.is_ok());
    }

    #[test]
    #[serial]
    fn test_send_and_sync() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let cli = Arc::new(Client::builder(&lib, "cli").finalize().unwrap());

        let cli2 = Arc::clone(&cli);
        let thr = thread::spawn(move || {
            assert!(!cli2.is_connected());
        });
        assert_eq!(SessionState::Disconnected, cli.state());
        thr.join().unwrap();
    }

    #[test]
    #[serial]
    fn test_state_sequence() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let states = Arc::new(Mutex::new(Vec::new()));
        let thr_states = Arc::clone(&states);

        let cli = Client::builder(&lib, "cli")
            .on_state_change(move |st| thr_states.lock().unwrap().push(st))
            .finalize()
            .unwrap();

        cli.connect("test.broker", 1883).unwrap();
        assert_eq!(
            vec![SessionState::Connecting, SessionState::Connected],
            *states.lock().unwrap()
        );
        assert!(cli.is_connected());

        cli.stop().unwrap();
        cli.stop().unwrap();
        assert_eq!(SessionState::Disconnected, cli.state());
    }

    #[test]
    #[serial]
    fn test_publish_and_failure() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let thr_errors = Arc::clone(&errors);

        let cli = Client::builder(&lib, "cli")
            .on_error(move |rc, msg| thr_errors.lock().unwrap().push((rc, msg.to_string())))
            .finalize()
            .unwrap();
        cli.connect("test.broker", 1883).unwrap();

        let id = cli.publish_bytes("t/1", b"hello", QoS::AtLeastOnce, false).unwrap();
        assert!(id > 0);

        broker.fail_next(Operation::Publish, -6);
        let res = cli.publish(&Message::new("t/1", "hello").with_qos(QoS::AtLeastOnce));
        assert!(matches!(res, Err(Error::PublicationError)));

        let errors = errors.lock().unwrap();
        assert_eq!(1, errors.len());
        assert_eq!((-6, MSG_PUBLISH_FAILED.to_string()), errors[0]);
    }

    #[test]
    #[serial]
    fn test_input_errors() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let cli = Client::builder(&lib, "cli").finalize().unwrap();

        assert!(matches!(cli.set_credentials("us\0er", "pw"), Err(Error::Nul(_))));
        assert!(matches!(cli.set_credentials("user", "p\0w"), Err(Error::Nul(_))));
        assert!(matches!(cli.set_credentials("", "pw"), Err(Error::InvalidCredentials)));
        assert!(matches!(cli.set_broker("", 1883), Err(Error::InvalidBrokerUrl)));
        assert!(matches!(cli.set_broker("host\0", 1883), Err(Error::Nul(_))));
        assert!(matches!(cli.subscribe("", QoS::AtMostOnce), Err(Error::InvalidTopic)));
        assert!(matches!(cli.publish_bytes("a\0b", b"", QoS::AtMostOnce, false), Err(Error::Nul(_))));
        assert!(matches!(Client::builder(&lib, "a\0b").finalize(), Err(Error::Nul(_))));

        assert!(matches!(cli.unsubscribe(99), Err(Error::UnsubscriptionError)));
        assert!(matches!(cli.subscribe("t", QoS::AtMostOnce), Err(Error::SubscriptionError)));
    }

    #[test]
    #[serial]
    fn test_start_without_broker() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let thr_errors = Arc::clone(&errors);

        let cli = Client::builder(&lib, "cli")
            .on_error(move |_, msg| thr_errors.lock().unwrap().push(msg.to_string()))
            .finalize()
            .unwrap();

        assert!(matches!(cli.start(), Err(Error::ConnectionError)));
        assert_eq!(vec![MSG_BROKER_NOT_SET.to_string()], *errors.lock().unwrap());
    }

    #[test]
    #[serial]
    fn test_credentials_reach_the_broker() {
        let broker = LoopbackBroker::new();
        broker.require_credentials("user", "secret");
        let lib = library(&broker);
        let cli = Client::builder(&lib, "cli").finalize().unwrap();

        cli.set_broker("test.broker", 1883).unwrap();
        assert!(matches!(cli.start(), Err(Error::ConnectionError)));

        cli.set_credentials("user", "secret").unwrap();
        cli.set_keep_alive(Duration::from_secs(20)).unwrap();
        cli.set_clean_session(true).unwrap();
        cli.start().unwrap();
        assert!(broker.is_connected("cli"));
    }

    #[test]
    #[serial]
    fn test_messages_and_consumer() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let thr_seen = Arc::clone(&seen);

        let cli = Client::builder(&lib, "cli")
            .on_message(move |msg| thr_seen.lock().unwrap().push(msg.to_message()))
            .finalize()
            .unwrap();
        let rx = cli.start_consuming();

        cli.connect("test.broker", 1883).unwrap();
        let sub = cli.subscribe("data/#", QoS::AtLeastOnce).unwrap();
        cli.publish_bytes("data/1", b"one", QoS::AtLeastOnce, false).unwrap();

        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!("data/1", msg.topic());
        assert_eq!(b"one", msg.payload());
        assert!(wait_for(|| seen.lock().unwrap().len() == 1));

        broker.drop_connection("cli");
        assert_eq!(None, rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(wait_for(|| cli.state() == SessionState::Reconnecting));

        broker.restore_connection("cli");
        assert!(wait_for(|| cli.is_connected()));

        cli.unsubscribe(sub).unwrap();
        cli.stop_consuming();
    }

    #[test]
    #[serial]
    fn test_stream() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let cli = Client::builder(&lib, "cli").finalize().unwrap();
        let strm = cli.get_stream(8);

        cli.connect("test.broker", 1883).unwrap();
        cli.subscribe("s", QoS::AtMostOnce).unwrap();
        cli.publish_bytes("s", b"streamed", QoS::AtMostOnce, false).unwrap();

        let msg = futures::executor::block_on(strm.recv()).unwrap().unwrap();
        assert_eq!("streamed", msg.payload_str());
    }

    #[test]
    #[serial]
    fn test_full_stream_drops_messages() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let count = Arc::new(AtomicUsize::new(0));
        let thr_count = Arc::clone(&count);

        let cli = Client::builder(&lib, "cli")
            .on_message(move |_| {
                thr_count.fetch_add(1, Ordering::SeqCst);
            })
            .finalize()
            .unwrap();
        let strm = cli.get_stream(1);

        cli.connect("test.broker", 1883).unwrap();
        cli.subscribe("s", QoS::AtMostOnce).unwrap();
        for i in 0..3 {
            let payload = format!("msg{}", i);
            cli.publish_bytes("s", payload.as_bytes(), QoS::AtMostOnce, false).unwrap();
        }

        // The closure still sees every message.
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 3));

        let msg = strm.try_recv().unwrap().unwrap();
        assert_eq!("msg0", msg.payload_str());
        assert!(strm.try_recv().is_err());
    }

    #[test]
    #[serial]
    fn test_stop_from_own_callback() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let slot: Arc<Mutex<Option<Arc<Client>>>> = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = channel::unbounded();

        let thr_slot = Arc::clone(&slot);
        let cli = Arc::new(
            Client::builder(&lib, "cli")
                .on_message(move |_| {
                    thread::sleep(Duration::from_millis(200));
                    let me = thr_slot.lock().unwrap().clone();
                    if let Some(me) = me {
                        let _ = done_tx.send(me.stop().is_ok());
                    }
                })
                .on_state_change(|_| ())
                .finalize()
                .unwrap(),
        );
        *slot.lock().unwrap() = Some(Arc::clone(&cli));

        cli.connect("test.broker", 1883).unwrap();
        cli.subscribe("t", QoS::AtMostOnce).unwrap();
        cli.publish_bytes("t", b"x", QoS::AtMostOnce, false).unwrap();

        // Another thread replaces a callback while the first one runs.
        thread::sleep(Duration::from_millis(50));
        let setter_cli = Arc::clone(&cli);
        let setter = thread::spawn(move || setter_cli.set_error_callback(|_, _| ()));

        assert_eq!(Ok(true), done_rx.recv_timeout(Duration::from_secs(5)));
        setter.join().unwrap();
        assert_eq!(SessionState::Disconnected, cli.state());

        slot.lock().unwrap().take();
    }

    #[test]
    #[serial]
    fn test_drop_client_from_own_callback() {
        struct Canary(Arc<AtomicBool>);

        impl Drop for Canary {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let freed = Arc::new(AtomicBool::new(false));
        let canary = Canary(Arc::clone(&freed));
        let thr_freed = Arc::clone(&freed);
        let slot: Arc<Mutex<Option<Client>>> = Arc::new(Mutex::new(None));
        let thr_slot = Arc::clone(&slot);
        let (done_tx, done_rx) = channel::unbounded();

        let cli = Client::builder(&lib, "cli")
            .on_message(move |_| {
                let _canary = &canary;
                let me = thr_slot.lock().unwrap().take();
                drop(me);
                let _ = done_tx.send(thr_freed.load(Ordering::SeqCst));
            })
            .finalize()
            .unwrap();
        cli.connect("test.broker", 1883).unwrap();
        cli.subscribe("t", QoS::AtMostOnce).unwrap();
        *slot.lock().unwrap() = Some(cli);

        let publ = Client::builder(&lib, "pub").finalize().unwrap();
        publ.connect("test.broker", 1883).unwrap();
        publ.publish_bytes("t", b"x", QoS::AtMostOnce, false).unwrap();

        // The closure outlives the client while it runs, then goes with it.
        assert_eq!(Ok(false), done_rx.recv_timeout(Duration::from_secs(5)));
        assert!(wait_for(|| freed.load(Ordering::SeqCst)));
        assert_eq!(1, bridge::mqtt_session_count());
    }

    #[test]
    #[serial]
    fn test_replace_callbacks_and_panics() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let cli = Client::builder(&lib, "cli")
            .on_state_change(|_| panic!("state callback panicked"))
            .finalize()
            .unwrap();

        // A panicking callback doesn't take down the call.
        cli.connect("test.broker", 1883).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let thr_count = Arc::clone(&count);
        cli.set_state_callback(move |_| {
            thr_count.fetch_add(1, Ordering::SeqCst);
        });
        cli.stop().unwrap();
        assert_eq!(1, count.load(Ordering::SeqCst));

        cli.clear_callbacks();
        cli.start().unwrap();
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    #[serial]
    fn test_no_callbacks_after_drop() {
        let broker = LoopbackBroker::new();
        let lib = library(&broker);
        let count = Arc::new(AtomicUsize::new(0));
        let thr_count = Arc::clone(&count);

        let sub = Client::builder(&lib, "sub")
            .on_message(move |_| {
                thr_count.fetch_add(1, Ordering::SeqCst);
            })
            .finalize()
            .unwrap();
        sub.connect("localhost", 1883).unwrap();
        sub.subscribe("load", QoS::AtMostOnce).unwrap();

        let publ = Arc::new(Client::builder(&lib, "pub").finalize().unwrap());
        publ.connect("localhost", 1883).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let thr_running = Arc::clone(&running);
        let thr_publ = Arc::clone(&publ);
        let publisher = thread::spawn(move || {
            while thr_running.load(Ordering::SeqCst) {
                let _ = thr_publ.publish_bytes("load", b"x", QoS::AtMostOnce, false);
            }
        });

        assert!(wait_for(|| count.load(Ordering::SeqCst) > 10));
        drop(sub);
        let n = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(n, count.load(Ordering::SeqCst));

        // Only the test's reference to the closure's counter is left.
        assert_eq!(1, Arc::strong_count(&count));

        running.store(false, Ordering::SeqCst);
        publisher.join().unwrap();
    }
}
