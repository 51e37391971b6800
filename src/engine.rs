// engine.rs
//
// The contract for the native engine that owns the network connection.
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

//! The engine contract.
//!
//! An engine is the collaborator that actually speaks MQTT: it owns the
//! socket, the protocol state, and whatever retry timers it has. The
//! session only ever sees it through these traits.
//!
//! Every engine operation reports failure as a raw, engine-specific
//! integer code. Zero is never used for failure.
//!
//! Events are delivered on a thread owned by the engine. The buffers of an
//! inbound message belong to the engine and are released as soon as the
//! `message_arrived` call returns.

use crate::{
    errors::RC_ENGINE_UNAVAILABLE,
    factory::InitOptions,
    message::MessageView,
    types::QoS,
};
use std::{
    result,
    sync::{Arc, Weak},
    time::Duration,
};

/// The result of an engine operation: an engine failure code on error.
pub type EngineResult<T = ()> = result::Result<T, i32>;

/// The options for creating an engine client.
///
/// Client state is never persisted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// The address of the broker, as `tcp://host:port` or `ssl://host:port`
    pub server_uri: String,
    /// The MQTT client identifier
    pub client_id: String,
    /// The maximum number of messages buffered while offline
    pub max_buffered_messages: i32,
}

/// A user name and password for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The user name
    pub user_name: String,
    /// The password, which may be empty
    pub password: String,
}

/// The certificate files for a TLS connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsFiles {
    /// The file of trusted CA certificates
    pub trust_store: String,
    /// The client certificate
    pub key_store: String,
    /// The client private key
    pub private_key: String,
}

/// The options for connecting an engine client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// The keep alive interval
    pub keep_alive_interval: Duration,
    /// Whether the broker should discard prior session state
    pub clean_session: bool,
    /// How long to wait for the connection to complete
    pub connect_timeout: Duration,
    /// The interval between automatic reconnect and resend attempts
    pub retry_interval: Duration,
    /// The maximum number of in-flight messages
    pub max_inflight: i32,
    /// Whether each publish must complete before the next one starts
    pub reliable: bool,
    /// The user name and password, if any
    pub credentials: Option<Credentials>,
    /// The TLS certificate files, if TLS is on
    pub tls: Option<TlsFiles>,
}

/// The events that an engine reports back to its owner.
///
/// These are invoked directly on the engine's delivery thread.
pub trait EngineEvents: Send + Sync {
    /// The connection to the broker was lost.
    fn connection_lost(&self, cause: Option<&str>);

    /// A message arrived. The view is only valid for this call.
    fn message_arrived(&self, msg: &MessageView<'_>);

    /// The engine started an automatic reconnect attempt.
    fn reconnecting(&self) {}

    /// An automatic reconnect attempt succeeded.
    fn reconnected(&self) {}
}

/// A client of the native engine.
pub trait Engine: Send + Sync {
    /// Registers the receiver for connection and message events.
    ///
    /// The engine keeps only a weak reference, and stops delivering events
    /// once the receiver is gone.
    fn set_callbacks(&self, events: Weak<dyn EngineEvents>);

    /// Connects to the broker, blocking until the attempt completes.
    fn connect(&self, opts: &ConnectOptions) -> EngineResult;

    /// Disconnects, allowing up to `timeout` for in-flight work.
    fn disconnect(&self, timeout: Duration) -> EngineResult;

    /// Subscribes to a topic filter.
    fn subscribe(&self, topic: &str, qos: QoS) -> EngineResult;

    /// Unsubscribes from a topic filter.
    fn unsubscribe(&self, topic: &str) -> EngineResult;

    /// Publishes a message tagged with the caller's message id.
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retained: bool, id: i64)
        -> EngineResult;

    /// Releases the client.
    ///
    /// When this returns, no further events will be delivered, unless it
    /// was called from the delivery thread itself.
    fn destroy(&self);
}

/// Something that can create engine clients.
pub trait EngineFactory: Send + Sync {
    /// Prepares the engine for use. Called once per library initialization.
    fn init(&self, _opts: &InitOptions) -> EngineResult {
        Ok(())
    }

    /// Creates a new, unconnected engine client.
    fn create(&self, opts: &CreateOptions) -> EngineResult<Arc<dyn Engine>>;
}

/// The engine factory used when none has been installed.
///
/// Creating a client always fails, so starting a session reports
/// [`RC_ENGINE_UNAVAILABLE`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableEngineFactory;

impl EngineFactory for UnavailableEngineFactory {
    fn create(&self, opts: &CreateOptions) -> EngineResult<Arc<dyn Engine>> {
        warn!("No MQTT engine is available to connect to {}", opts.server_uri);
        Err(RC_ENGINE_UNAVAILABLE)
    }
}

/// Gets the engine factory for the engine compiled into the library.
pub fn default_engine_factory() -> Arc<dyn EngineFactory> {
    #[cfg(feature = "paho")]
    {
        Arc::new(crate::paho_engine::PahoEngineFactory::new())
    }
    #[cfg(not(feature = "paho"))]
    {
        Arc::new(UnavailableEngineFactory)
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_factory() {
        let opts = CreateOptions {
            server_uri: "tcp://localhost:1883".into(),
            client_id: "cli".into(),
            max_buffered_messages: 100,
        };
        let res = UnavailableEngineFactory.create(&opts);
        assert_eq!(Some(RC_ENGINE_UNAVAILABLE), res.err());
        assert!(UnavailableEngineFactory.init(&InitOptions::default()).is_ok());
    }
}
