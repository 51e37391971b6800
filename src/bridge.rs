// bridge.rs
//
// The flat C interface to sessions.
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

//! The C interface.
//!
//! Everything in the domain model is reachable from C through this
//! module:
//!
//! - Sessions are named by opaque integer handles. A handle is an index
//!   into a process-wide registry, never an address, so a destroyed or
//!   made-up handle is detected and rejected with `-1` (or the
//!   Disconnected state for state queries).
//! - Messages cross as a fixed-layout [`MqttMessageData`] that is only
//!   valid for the length of the callback.
//! - The session and message handler traits are replaced by three C
//!   function pointers sharing one user context pointer. The registry owns
//!   the adapters that forward into them, and frees them only when the
//!   session is destroyed.
//! - Failures are integer return codes, never unwinding. A panic inside
//!   the library is caught at the boundary and reported as a failure.
//!
//! All functions are safe to call from any thread.

use crate::{
    engine::{default_engine_factory, EngineFactory},
    errors::{MQTT_FAILURE, MQTT_SUCCESS},
    factory::{ApiFactory, InitOptions},
    message::MessageView,
    session::{MessageHandler, Session, SessionHandler},
    types::{Parameter, QoS, SessionState},
};
use libc::{c_char, c_int, c_void, size_t};
use std::{
    collections::HashMap,
    ffi::{CStr, CString},
    panic::{self, AssertUnwindSafe},
    slice,
    sync::{Arc, Mutex},
};

/// An opaque handle to a session.
pub type SessionHandle = u64;

/// The handle that never names a session.
pub const MQTT_NULL_SESSION: SessionHandle = 0;

/// A message, as passed to the message callback.
///
/// The pointers are only valid for the duration of the callback.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MqttMessageData {
    /// The topic, as a NUL-terminated string
    pub topic: *const c_char,
    /// The payload bytes
    pub payload: *const u8,
    /// The number of payload bytes
    pub payload_length: size_t,
    /// The QoS ordinal, 0-2
    pub qos: i32,
    /// Non-zero if the message was retained
    pub retained: i32,
    /// The message identifier
    pub message_id: i64,
}

/// Called for each message that arrives.
pub type MessageCallback =
    Option<unsafe extern "C" fn(message: *const MqttMessageData, user_context: *mut c_void)>;

/// Called for each change of session state.
pub type StateCallback = Option<unsafe extern "C" fn(new_state: c_int, user_context: *mut c_void)>;

/// Called for each error, with a NUL-terminated message.
pub type ErrorCallback =
    Option<unsafe extern "C" fn(error_code: c_int, message: *const c_char, user_context: *mut c_void)>;

// The caller's context pointer. It is only ever handed back to the
// caller's own callbacks, which must be prepared to be called from any
// thread.
#[derive(Debug, Clone, Copy)]
struct UserContext(*mut c_void);

unsafe impl Send for UserContext {}
unsafe impl Sync for UserContext {}

// Forwards session events to the C state and error callbacks.
struct SessionCallbackAdapter {
    state_cb: StateCallback,
    error_cb: ErrorCallback,
    context: UserContext,
}

impl SessionHandler for SessionCallbackAdapter {
    fn on_state_change(&self, state: SessionState) {
        if let Some(cb) = self.state_cb {
            unsafe { cb(state.ordinal(), self.context.0) };
        }
    }

    fn on_error(&self, code: i32, msg: &str) {
        if let Some(cb) = self.error_cb {
            let cmsg = CString::new(msg.replace('\0', "")).unwrap_or_default();
            unsafe { cb(code, cmsg.as_ptr(), self.context.0) };
        }
    }
}

// Forwards messages to the C message callback.
struct MessageCallbackAdapter {
    cb: unsafe extern "C" fn(*const MqttMessageData, *mut c_void),
    context: UserContext,
}

impl MessageHandler for MessageCallbackAdapter {
    fn on_message(&self, msg: &MessageView<'_>) {
        let topic = match CString::new(msg.topic()) {
            Ok(topic) => topic,
            Err(_) => {
                warn!("Dropping a message whose topic can't cross the C boundary");
                return;
            }
        };

        let data = MqttMessageData {
            topic: topic.as_ptr(),
            payload: msg.payload().as_ptr(),
            payload_length: msg.payload().len(),
            qos: i32::from(msg.qos()),
            retained: msg.is_retained() as i32,
            message_id: msg.message_id(),
        };

        trace!("Passing message {} on '{}' to C", data.message_id, msg.topic());
        unsafe { (self.cb)(&data, self.context.0) };
    }
}

// A live session with everything allocated on its behalf.
struct SessionRecord {
    session: Session,
    // The adapters are kept here so that they outlive the session's use
    // of them.
    _session_handler: Arc<SessionCallbackAdapter>,
    _message_handler: Option<Arc<MessageCallbackAdapter>>,
}

// The process-wide state behind the C interface.
struct Registry {
    factory: Option<ApiFactory>,
    init_count: usize,
    engines: Option<Arc<dyn EngineFactory>>,
    sessions: HashMap<SessionHandle, Arc<SessionRecord>>,
    next_handle: SessionHandle,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        factory: None,
        init_count: 0,
        engines: None,
        sessions: HashMap::new(),
        next_handle: 1,
    });
}

/// Selects the engine used by sessions created after the next first-time
/// call to [`mqtt_initialize`].
///
/// Without this, the engine compiled into the library is used.
pub fn install_engine_factory(engines: Arc<dyn EngineFactory>) {
    lock!(REGISTRY).engines = Some(engines);
}

// Runs the body of an entry point, turning a panic into a failure.
fn boundary<T, F>(what: &str, failed: T, f: F) -> T
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("Panic caught at the C boundary in {}", what);
        failed
    })
}

fn lookup(handle: SessionHandle) -> Option<Arc<SessionRecord>> {
    if handle == MQTT_NULL_SESSION {
        return None;
    }
    let rec = lock!(REGISTRY).sessions.get(&handle).cloned();
    if rec.is_none() {
        warn!("Invalid session handle: {}", handle);
    }
    rec
}

// Runs the closure on the session, without holding the registry lock.
fn with_session<T, F>(what: &str, handle: SessionHandle, failed: T, f: F) -> T
where
    T: Copy,
    F: FnOnce(&Session) -> T,
{
    boundary(what, failed, || match lookup(handle) {
        Some(rec) => f(&rec.session),
        None => failed,
    })
}

// Gets a required string argument.
unsafe fn str_arg<'a>(p: *const c_char, what: &str) -> Option<&'a str> {
    if p.is_null() {
        warn!("NULL {} passed to the C interface", what);
        return None;
    }
    match CStr::from_ptr(p).to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            warn!("The {} is not valid UTF-8", what);
            None
        }
    }
}

// Gets an optional string argument, where NULL means empty.
unsafe fn opt_str_arg<'a>(p: *const c_char, what: &str) -> Option<&'a str> {
    if p.is_null() {
        Some("")
    }
    else {
        str_arg(p, what)
    }
}

fn status(ok: bool) -> c_int {
    if ok {
        MQTT_SUCCESS
    }
    else {
        MQTT_FAILURE
    }
}

/////////////////////////////////////////////////////////////////////////////
// Configuration

/// Sets an integer parameter.
///
/// Returns -1 for a bad handle or parameter ordinal. A boolean parameter is
/// ignored, leaving the configuration unchanged, and returns 0.
#[no_mangle]
pub extern "C" fn mqtt_set_int_parameter(session: SessionHandle, param: c_int, value: i32) -> c_int {
    with_session("mqtt_set_int_parameter", session, MQTT_FAILURE, |sess| {
        match Parameter::from_ordinal(param) {
            Some(param) => {
                sess.config().set_int(param, value);
                MQTT_SUCCESS
            }
            None => {
                warn!("Unknown parameter ordinal: {}", param);
                MQTT_FAILURE
            }
        }
    })
}

/// Sets a boolean parameter, where any non-zero value is true.
///
/// Returns -1 for a bad handle or parameter ordinal. An integer parameter
/// is ignored, leaving the configuration unchanged, and returns 0.
#[no_mangle]
pub extern "C" fn mqtt_set_bool_parameter(session: SessionHandle, param: c_int, value: c_int) -> c_int {
    with_session("mqtt_set_bool_parameter", session, MQTT_FAILURE, |sess| {
        match Parameter::from_ordinal(param) {
            Some(param) => {
                sess.config().set_bool(param, value != 0);
                MQTT_SUCCESS
            }
            None => {
                warn!("Unknown parameter ordinal: {}", param);
                MQTT_FAILURE
            }
        }
    })
}

/// Sets the broker host and port.
///
/// # Safety
/// `url` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mqtt_set_broker(session: SessionHandle, url: *const c_char, port: u16) -> c_int {
    with_session("mqtt_set_broker", session, MQTT_FAILURE, |sess| {
        match str_arg(url, "broker URL") {
            Some(url) => {
                sess.config().set_broker(url, port);
                MQTT_SUCCESS
            }
            None => MQTT_FAILURE,
        }
    })
}

/// Sets the user name and password. A NULL password is empty.
///
/// # Safety
/// The strings must be NULL or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mqtt_set_credentials(
    session: SessionHandle,
    username: *const c_char,
    password: *const c_char,
) -> c_int {
    with_session("mqtt_set_credentials", session, MQTT_FAILURE, |sess| {
        match (str_arg(username, "user name"), opt_str_arg(password, "password")) {
            (Some(user), Some(pass)) => {
                sess.config().set_credentials(user, pass);
                MQTT_SUCCESS
            }
            _ => MQTT_FAILURE,
        }
    })
}

/// Sets the TLS certificate files, and turns TLS on.
/// A NULL path is empty.
///
/// # Safety
/// The strings must be NULL or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mqtt_set_tls_certificates(
    session: SessionHandle,
    ca_file: *const c_char,
    cert_file: *const c_char,
    key_file: *const c_char,
) -> c_int {
    with_session("mqtt_set_tls_certificates", session, MQTT_FAILURE, |sess| {
        match (
            opt_str_arg(ca_file, "CA file"),
            opt_str_arg(cert_file, "certificate file"),
            opt_str_arg(key_file, "key file"),
        ) {
            (Some(ca), Some(cert), Some(key)) => {
                sess.config().set_tls_certificates(ca, cert, key);
                MQTT_SUCCESS
            }
            _ => MQTT_FAILURE,
        }
    })
}

/////////////////////////////////////////////////////////////////////////////
// Lifecycle

/// Initializes the library.
///
/// This is reference counted: only the first call does the work, and each
/// call should be matched by a call to [`mqtt_uninitialize`]. Any of the
/// strings may be NULL.
///
/// Returns 0 on success, or the engine's failure code.
///
/// # Safety
/// The strings must be NULL or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mqtt_initialize(
    app_name: *const c_char,
    app_version: *const c_char,
    debug: c_int,
    log_file: *const c_char,
) -> c_int {
    boundary("mqtt_initialize", MQTT_FAILURE, || {
        let mut reg = lock!(REGISTRY);
        if reg.init_count > 0 {
            reg.init_count += 1;
            return MQTT_SUCCESS;
        }

        let (name, version, log_file) = match (
            opt_str_arg(app_name, "application name"),
            opt_str_arg(app_version, "application version"),
            opt_str_arg(log_file, "log file"),
        ) {
            (Some(n), Some(v), Some(f)) => (n, v, f),
            _ => return MQTT_FAILURE,
        };

        let dflt = InitOptions::default();
        let mut opts = InitOptions::new(
            if name.is_empty() { dflt.app_name() } else { name },
            if version.is_empty() { dflt.app_version() } else { version },
        )
        .debug(debug != 0);

        if !log_file.is_empty() {
            opts = opts.log_file(log_file);
        }

        let engines = reg.engines.clone().unwrap_or_else(default_engine_factory);

        match ApiFactory::initialize(opts, engines) {
            Ok(factory) => {
                reg.factory = Some(factory);
                reg.init_count = 1;
                MQTT_SUCCESS
            }
            Err(rc) => {
                warn!("MQTT library initialization failed: {}", rc);
                rc
            }
        }
    })
}

/// Releases one reference to the library.
///
/// The last one releases the library itself. Sessions that still exist
/// keep working until they are destroyed, but no new ones can be created.
/// Calling this when not initialized does nothing.
#[no_mangle]
pub extern "C" fn mqtt_uninitialize() -> c_int {
    boundary("mqtt_uninitialize", MQTT_FAILURE, || {
        let mut reg = lock!(REGISTRY);
        match reg.init_count {
            0 => (),
            1 => {
                reg.init_count = 0;
                reg.factory = None;
                debug!("MQTT library uninitialized");
            }
            _ => reg.init_count -= 1,
        }
        MQTT_SUCCESS
    })
}

/// Creates a session.
///
/// Any of the callbacks may be NULL. They are invoked on the engine's
/// thread with `user_context` as the last argument.
///
/// Returns the handle of the new session, or 0 if the library is not
/// initialized or the client ID is not valid.
///
/// # Safety
/// `client_id` must be NULL or a valid NUL-terminated string.
/// `user_context` must remain valid, and the callbacks callable from any
/// thread, until the session is destroyed.
#[no_mangle]
pub unsafe extern "C" fn mqtt_create_session(
    client_id: *const c_char,
    message_cb: MessageCallback,
    state_cb: StateCallback,
    error_cb: ErrorCallback,
    user_context: *mut c_void,
) -> SessionHandle {
    boundary("mqtt_create_session", MQTT_NULL_SESSION, || {
        let client_id = match str_arg(client_id, "client ID") {
            Some(id) => id,
            None => return MQTT_NULL_SESSION,
        };

        let mut reg = lock!(REGISTRY);
        let factory = match reg.factory.as_ref() {
            Some(factory) => factory,
            None => {
                warn!("Session '{}' requested before initialization", client_id);
                return MQTT_NULL_SESSION;
            }
        };

        let context = UserContext(user_context);
        let session_handler = Arc::new(SessionCallbackAdapter {
            state_cb,
            error_cb,
            context,
        });
        let session = factory.create_session(client_id, session_handler.clone());

        let message_handler = message_cb.map(|cb| Arc::new(MessageCallbackAdapter { cb, context }));
        if let Some(handler) = message_handler.as_ref() {
            session.set_message_handler(Some(handler.clone()));
        }

        let handle = reg.next_handle;
        reg.next_handle += 1;
        reg.sessions.insert(
            handle,
            Arc::new(SessionRecord {
                session,
                _session_handler: session_handler,
                _message_handler: message_handler,
            }),
        );

        debug!("Created session handle {} for '{}'", handle, client_id);
        handle
    })
}

/// Destroys a session.
///
/// The session is stopped, and then its callbacks are released. No
/// callback is running or will run for the session once this returns,
/// except when it is called from within one of the session's own
/// callbacks. The handle is invalid afterwards.
#[no_mangle]
pub extern "C" fn mqtt_destroy_session(session: SessionHandle) {
    boundary("mqtt_destroy_session", (), || {
        let rec = match lock!(REGISTRY).sessions.remove(&session) {
            Some(rec) => rec,
            None => return,
        };

        let factory = rec.session.factory().clone();
        factory.destroy_session(rec.session.clone());
        debug!("Destroyed session handle {}", session);
    })
}

/// Gets the number of live sessions.
#[no_mangle]
pub extern "C" fn mqtt_session_count() -> size_t {
    lock!(REGISTRY).sessions.len()
}

/////////////////////////////////////////////////////////////////////////////
// Control

/// Gets the state ordinal of the session.
///
/// A bad handle reports Disconnected.
#[no_mangle]
pub extern "C" fn mqtt_session_get_state(session: SessionHandle) -> c_int {
    let disconnected = SessionState::Disconnected.ordinal();
    with_session("mqtt_session_get_state", session, disconnected, |sess| sess.state().ordinal())
}

/// Connects the session, blocking until the attempt completes.
///
/// Returns 0 on success, or -1 on failure, the reason for which is given
/// to the error callback.
#[no_mangle]
pub extern "C" fn mqtt_session_start(session: SessionHandle) -> c_int {
    with_session("mqtt_session_start", session, MQTT_FAILURE, |sess| status(sess.start()))
}

/// Disconnects the session. Stopping a stopped session does nothing.
#[no_mangle]
pub extern "C" fn mqtt_session_stop(session: SessionHandle) -> c_int {
    with_session("mqtt_session_stop", session, MQTT_FAILURE, |sess| status(sess.stop()))
}

/////////////////////////////////////////////////////////////////////////////
// Messaging

/// Subscribes to a topic filter.
///
/// Returns the subscription handle, or -1 on failure.
///
/// # Safety
/// `topic` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mqtt_subscribe(session: SessionHandle, topic: *const c_char, qos: c_int) -> i64 {
    with_session("mqtt_subscribe", session, -1, |sess| {
        let topic = match str_arg(topic, "topic") {
            Some(topic) => topic,
            None => return -1,
        };
        match QoS::from_ordinal(qos) {
            Some(qos) => sess.subscribe(topic, qos),
            None => {
                warn!("Invalid QoS: {}", qos);
                -1
            }
        }
    })
}

/// Removes a subscription by its handle.
#[no_mangle]
pub extern "C" fn mqtt_unsubscribe(session: SessionHandle, handle: i64) -> c_int {
    with_session("mqtt_unsubscribe", session, MQTT_FAILURE, |sess| status(sess.unsubscribe(handle)))
}

/// Publishes a message.
///
/// Returns the message id, or -1 on failure.
///
/// # Safety
/// `topic` must be NULL or a valid NUL-terminated string, and `payload`
/// must point to `length` readable bytes. It may be NULL if `length` is 0.
#[no_mangle]
pub unsafe extern "C" fn mqtt_publish(
    session: SessionHandle,
    topic: *const c_char,
    payload: *const u8,
    length: size_t,
    qos: c_int,
    retain: c_int,
) -> i64 {
    with_session("mqtt_publish", session, -1, |sess| {
        let topic = match str_arg(topic, "topic") {
            Some(topic) => topic,
            None => return -1,
        };

        let payload = if length == 0 {
            &[][..]
        }
        else if payload.is_null() {
            warn!("NULL payload with a length of {}", length);
            return -1;
        }
        else {
            slice::from_raw_parts(payload, length)
        };

        match QoS::from_ordinal(qos) {
            Some(qos) => sess.publish(topic, payload, qos, retain != 0),
            None => {
                warn!("Invalid QoS: {}", qos);
                -1
            }
        }
    })
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::MSG_PUBLISH_FAILED,
        loopback::{LoopbackBroker, Operation},
    };
    use serial_test::serial;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<c_int>>,
        errors: Mutex<Vec<(c_int, String)>>,
        messages: Mutex<Vec<(String, Vec<u8>, i32)>>,
        count: AtomicUsize,
    }

    unsafe extern "C" fn on_message(msg: *const MqttMessageData, ctx: *mut c_void) {
        let rec = &*(ctx as *const Recorder);
        let msg = &*msg;
        let topic = CStr::from_ptr(msg.topic).to_string_lossy().into_owned();
        let payload = slice::from_raw_parts(msg.payload, msg.payload_length).to_vec();
        lock!(rec.messages).push((topic, payload, msg.qos));
        rec.count.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn on_state(state: c_int, ctx: *mut c_void) {
        let rec = &*(ctx as *const Recorder);
        lock!(rec.states).push(state);
    }

    unsafe extern "C" fn on_error(code: c_int, msg: *const c_char, ctx: *mut c_void) {
        let rec = &*(ctx as *const Recorder);
        let msg = CStr::from_ptr(msg).to_string_lossy().into_owned();
        lock!(rec.errors).push((code, msg));
    }

    // Holds one library reference for the length of a test.
    struct Init;

    impl Init {
        fn new(broker: &LoopbackBroker) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            install_engine_factory(broker.engine_factory());
            let rc = unsafe { mqtt_initialize(ptr(b"test\0"), ptr(b"1.0\0"), 0, std::ptr::null()) };
            assert_eq!(0, rc);
            Init
        }
    }

    impl Drop for Init {
        fn drop(&mut self) {
            mqtt_uninitialize();
        }
    }

    fn ptr(s: &[u8]) -> *const c_char {
        s.as_ptr() as *const c_char
    }

    fn create(id: &[u8], rec: &Arc<Recorder>) -> SessionHandle {
        let ctx = Arc::as_ptr(rec) as *mut c_void;
        unsafe { mqtt_create_session(ptr(id), Some(on_message), Some(on_state), Some(on_error), ctx) }
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
        let rec = Arc::new(Recorder::default());
        assert_eq!(MQTT_NULL_SESSION, create(b"cli\0", &rec));
    }

    #[test]
    #[serial]
    fn test_init_is_counted() {
        let broker = LoopbackBroker::new();
        let rec = Arc::new(Recorder::default());
        {
            let _outer = Init::new(&broker);
            {
                let _inner = Init::new(&broker);
            }
            let h = create(b"cli\0", &rec);
            assert_ne!(MQTT_NULL_SESSION, h);
            mqtt_destroy_session(h);
        }
        assert_eq!(MQTT_NULL_SESSION, create(b"cli\0", &rec));
        assert_eq!(0, mqtt_uninitialize());
    }

    #[test]
    #[serial]
    fn test_invalid_handles() {
        assert_eq!(-1, mqtt_set_int_parameter(MQTT_NULL_SESSION, 0, 1));
        assert_eq!(-1, mqtt_session_start(MQTT_NULL_SESSION));
        assert_eq!(-1, mqtt_session_stop(12345));
        assert_eq!(-1, mqtt_unsubscribe(12345, 1));
        assert_eq!(0, mqtt_session_get_state(12345));
        assert_eq!(-1, unsafe { mqtt_subscribe(12345, ptr(b"t\0"), 0) });
        assert_eq!(-1, unsafe { mqtt_publish(12345, ptr(b"t\0"), std::ptr::null(), 0, 0, 0) });
        mqtt_destroy_session(MQTT_NULL_SESSION);
    }

    #[test]
    #[serial]
    fn test_never_started_session() {
        let broker = LoopbackBroker::new();
        let _init = Init::new(&broker);
        let rec = Arc::new(Recorder::default());
        let h = create(b"idle\0", &rec);

        assert_eq!(0, mqtt_session_get_state(h));
        assert_eq!(0, mqtt_session_stop(h));
        assert!(lock!(rec.states).is_empty());

        mqtt_destroy_session(h);
        assert_eq!(-1, mqtt_session_stop(h));
    }

    #[test]
    #[serial]
    fn test_parameters() {
        let broker = LoopbackBroker::new();
        let _init = Init::new(&broker);
        let rec = Arc::new(Recorder::default());
        let h = create(b"cli\0", &rec);
        let sess = lookup(h).unwrap().session.clone();

        assert_eq!(-1, mqtt_set_int_parameter(h, 7, 1));
        assert_eq!(-1, mqtt_set_bool_parameter(h, -1, 1));

        let orig = sess.config().clone();
        assert_eq!(0, mqtt_set_int_parameter(h, Parameter::CleanSession as c_int, 0));
        assert_eq!(0, mqtt_set_bool_parameter(h, Parameter::KeepAliveInterval as c_int, 1));
        assert_eq!(orig, *sess.config());

        assert_eq!(0, mqtt_set_int_parameter(h, Parameter::KeepAliveInterval as c_int, 15));
        assert_eq!(0, mqtt_set_bool_parameter(h, Parameter::TlsEnabled as c_int, 0));
        assert_eq!(15, sess.config().keep_alive_interval());

        let rc = unsafe { mqtt_set_tls_certificates(h, ptr(b"ca.pem\0"), ptr(b"c.pem\0"), ptr(b"k.pem\0")) };
        assert_eq!(0, rc);
        assert!(sess.config().tls_enabled());

        assert_eq!(-1, unsafe { mqtt_set_broker(h, std::ptr::null(), 1883) });
        assert_eq!(-1, unsafe { mqtt_set_credentials(h, std::ptr::null(), ptr(b"pw\0")) });
        assert_eq!(0, unsafe { mqtt_set_credentials(h, ptr(b"user\0"), std::ptr::null()) });
        assert_eq!("user", sess.config().user_name());

        mqtt_destroy_session(h);
    }

    #[test]
    #[serial]
    fn test_end_to_end() {
        let broker = LoopbackBroker::new();
        let _init = Init::new(&broker);
        let rec = Arc::new(Recorder::default());
        let h = create(b"cli\0", &rec);

        assert_eq!(0, unsafe { mqtt_set_broker(h, ptr(b"test.broker\0"), 1883) });
        assert_eq!(0, mqtt_session_start(h));
        assert_eq!(vec![1, 2], *lock!(rec.states));
        assert_eq!(2, mqtt_session_get_state(h));

        let sub = unsafe { mqtt_subscribe(h, ptr(b"t/#\0"), 1) };
        assert_eq!(1, sub);
        assert_eq!(-1, unsafe { mqtt_subscribe(h, ptr(b"t/#\0"), 3) });

        let payload = b"hello";
        let id = unsafe { mqtt_publish(h, ptr(b"t/1\0"), payload.as_ptr(), payload.len(), 1, 0) };
        assert!(id > 0);
        assert!(wait_for(|| !lock!(rec.messages).is_empty()));
        assert_eq!(("t/1".to_string(), b"hello".to_vec(), 1), lock!(rec.messages)[0]);

        broker.fail_next(Operation::Publish, -2);
        let rc = unsafe { mqtt_publish(h, ptr(b"t/1\0"), payload.as_ptr(), payload.len(), 1, 0) };
        assert_eq!(-1, rc);
        assert_eq!(vec![(-2, MSG_PUBLISH_FAILED.to_string())], *lock!(rec.errors));

        assert_eq!(-1, unsafe { mqtt_publish(h, ptr(b"t/1\0"), std::ptr::null(), 4, 1, 0) });

        assert_eq!(0, mqtt_unsubscribe(h, sub));
        assert_eq!(-1, mqtt_unsubscribe(h, sub));
        assert_eq!(1, lock!(rec.errors).len());

        assert_eq!(0, mqtt_session_stop(h));
        assert_eq!(vec![1, 2, 0], *lock!(rec.states));

        mqtt_destroy_session(h);
        assert_eq!(0, mqtt_session_count());
    }

    #[test]
    #[serial]
    fn test_no_callbacks_after_destroy() {
        let broker = LoopbackBroker::new();
        let _init = Init::new(&broker);

        let rec = Arc::new(Recorder::default());
        let sub = create(b"sub\0", &rec);
        unsafe { mqtt_set_broker(sub, ptr(b"localhost\0"), 1883) };
        assert_eq!(0, mqtt_session_start(sub));
        assert_eq!(1, unsafe { mqtt_subscribe(sub, ptr(b"load\0"), 0) });

        let quiet = Arc::new(Recorder::default());
        let publ = create(b"pub\0", &quiet);
        unsafe { mqtt_set_broker(publ, ptr(b"localhost\0"), 1883) };
        assert_eq!(0, mqtt_session_start(publ));

        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let thr_running = Arc::clone(&running);
        let publisher = thread::spawn(move || {
            while thr_running.load(Ordering::SeqCst) {
                unsafe { mqtt_publish(publ, ptr(b"load\0"), ptr(b"x\0") as *const u8, 1, 0, 0) };
            }
        });

        assert!(wait_for(|| rec.count.load(Ordering::SeqCst) > 10));
        mqtt_destroy_session(sub);
        let n = rec.count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(n, rec.count.load(Ordering::SeqCst));

        running.store(false, Ordering::SeqCst);
        publisher.join().unwrap();
        mqtt_destroy_session(publ);
    }
}
