// connection_config.rs
//
// The connection configuration of a session.
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

//! Connection configuration for a session.
//!
//! The configuration belongs to its session and is only changed through
//! the setters here, each of which returns the configuration so that calls
//! can be chained:
//!
//! ```
//! use polar_mqtt::{ConnectionConfig, Parameter};
//!
//! let mut cfg = ConnectionConfig::default();
//! cfg.set_broker("localhost", 1883)
//!     .set_int(Parameter::KeepAliveInterval, 20)
//!     .set_bool(Parameter::CleanSession, false);
//! assert_eq!(cfg.server_uri(), "tcp://localhost:1883");
//! ```

use crate::{
    engine::{ConnectOptions, CreateOptions, Credentials, TlsFiles},
    types::{Parameter, ParameterKind},
};
use std::time::Duration;

/// The default broker port for MQTT
pub const DFLT_PORT: u16 = 1883;

/// The settings used to connect a session to its broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    broker: String,
    port: u16,
    user_name: String,
    password: String,
    ca_file: String,
    cert_file: String,
    key_file: String,
    keep_alive_interval: i32,
    clean_session: bool,
    connection_timeout: i32,
    max_inflight: i32,
    max_queued_messages: i32,
    reconnect_delay: i32,
    tls_enabled: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: DFLT_PORT,
            user_name: String::new(),
            password: String::new(),
            ca_file: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            keep_alive_interval: 60,
            clean_session: true,
            connection_timeout: 30,
            max_inflight: 10,
            max_queued_messages: 100,
            reconnect_delay: 5,
            tls_enabled: false,
        }
    }
}

impl ConnectionConfig {
    /// Creates a configuration with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an integer parameter.
    ///
    /// A boolean parameter passed here is ignored, leaving the
    /// configuration unchanged. This is not treated as an error.
    pub fn set_int(&mut self, param: Parameter, value: i32) -> &mut Self {
        use Parameter::*;
        match param {
            KeepAliveInterval => self.keep_alive_interval = value,
            ConnectionTimeout => self.connection_timeout = value,
            MaxInflight => self.max_inflight = value,
            MaxQueuedMessages => self.max_queued_messages = value,
            ReconnectDelay => self.reconnect_delay = value,
            CleanSession | TlsEnabled => {
                debug!("Ignoring {:?} given to the integer setter", param);
            }
        }
        self
    }

    /// Sets a boolean parameter.
    ///
    /// An integer parameter passed here is ignored, leaving the
    /// configuration unchanged. This is not treated as an error.
    pub fn set_bool(&mut self, param: Parameter, value: bool) -> &mut Self {
        match param {
            Parameter::CleanSession => self.clean_session = value,
            Parameter::TlsEnabled => self.tls_enabled = value,
            _ => {
                debug_assert_eq!(param.kind(), ParameterKind::Int);
                debug!("Ignoring {:?} given to the boolean setter", param);
            }
        }
        self
    }

    /// Sets the broker host and port.
    pub fn set_broker<S: Into<String>>(&mut self, host: S, port: u16) -> &mut Self {
        self.broker = host.into();
        self.port = port;
        self
    }

    /// Sets the user name and password.
    ///
    /// An empty user name means no credentials are sent.
    pub fn set_credentials<U, P>(&mut self, user_name: U, password: P) -> &mut Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.user_name = user_name.into();
        self.password = password.into();
        self
    }

    /// Sets the TLS certificate files. This always turns TLS on.
    pub fn set_tls_certificates<A, C, K>(&mut self, ca_file: A, cert_file: C, key_file: K) -> &mut Self
    where
        A: Into<String>,
        C: Into<String>,
        K: Into<String>,
    {
        self.ca_file = ca_file.into();
        self.cert_file = cert_file.into();
        self.key_file = key_file.into();
        self.tls_enabled = true;
        self
    }

    /// Gets the broker host.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Gets the broker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gets the user name, which is empty if none was set.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Gets the keep alive interval, in seconds.
    pub fn keep_alive_interval(&self) -> i32 {
        self.keep_alive_interval
    }

    /// Gets the clean session flag.
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Gets the connection timeout, in seconds.
    pub fn connection_timeout(&self) -> i32 {
        self.connection_timeout
    }

    /// Gets the maximum number of in-flight messages.
    pub fn max_inflight(&self) -> i32 {
        self.max_inflight
    }

    /// Gets the maximum number of messages queued while offline.
    pub fn max_queued_messages(&self) -> i32 {
        self.max_queued_messages
    }

    /// Gets the delay between reconnect attempts, in seconds.
    pub fn reconnect_delay(&self) -> i32 {
        self.reconnect_delay
    }

    /// Determines if TLS is turned on.
    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    /// Gets the CA, certificate, and key files.
    pub fn tls_files(&self) -> (&str, &str, &str) {
        (&self.ca_file, &self.cert_file, &self.key_file)
    }

    /// Determines if the configuration names a broker.
    pub fn has_broker(&self) -> bool {
        !self.broker.trim().is_empty()
    }

    /// Gets the URI for the broker, like `tcp://localhost:1883`.
    ///
    /// The scheme is `ssl` when TLS is on.
    pub fn server_uri(&self) -> String {
        let scheme = if self.tls_enabled { "ssl" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.broker, self.port)
    }

    /// Gets the engine options to create a client for this configuration.
    pub fn create_options(&self, client_id: &str) -> CreateOptions {
        CreateOptions {
            server_uri: self.server_uri(),
            client_id: client_id.to_string(),
            max_buffered_messages: self.max_queued_messages,
        }
    }

    /// Gets the engine options to connect with this configuration.
    pub fn connect_options(&self) -> ConnectOptions {
        let credentials = if self.user_name.is_empty() {
            None
        }
        else {
            Some(Credentials {
                user_name: self.user_name.clone(),
                password: self.password.clone(),
            })
        };

        let tls = if self.tls_enabled {
            Some(TlsFiles {
                trust_store: self.ca_file.clone(),
                key_store: self.cert_file.clone(),
                private_key: self.key_file.clone(),
            })
        }
        else {
            None
        };

        ConnectOptions {
            keep_alive_interval: secs(self.keep_alive_interval),
            clean_session: self.clean_session,
            connect_timeout: secs(self.connection_timeout),
            retry_interval: secs(self.reconnect_delay),
            max_inflight: self.max_inflight,
            reliable: true,
            credentials,
            tls,
        }
    }
}

// Negative values from the C side clamp to zero.
fn secs(n: i32) -> Duration {
    Duration::from_secs(n.max(0) as u64)
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////
