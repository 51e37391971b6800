// lib.rs
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

//! A session-oriented MQTT client, in three layers.
//!
//! - The domain model: a [`Session`] per client, created through an
//!   [`ApiFactory`], reporting to [`SessionHandler`] and [`MessageHandler`]
//!   implementations. The network work is done by an [`Engine`].
//!
//! - The flat C interface in [`bridge`]: sessions are named by opaque
//!   integer handles, and the handlers become plain C callbacks with a
//!   user context pointer.
//!
//! - The safe client: [`Library`] and [`Client`] use the C interface the
//!   way any foreign caller would, and turn it back into Rust closures
//!   and `Result`s.
//!
//! Two engines are provided. The [`LoopbackBroker`] runs a broker inside
//! the process, which is useful for tests. With the `paho` feature, the
//! Paho C library connects to real brokers and becomes the default.

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

mod macros;

pub use crate::{
    client::{Client, ClientBuilder, Library},
    connection_config::ConnectionConfig,
    engine::{
        default_engine_factory, ConnectOptions, CreateOptions, Credentials, Engine, EngineEvents,
        EngineFactory, EngineResult, TlsFiles,
    },
    errors::{Error, Result},
    factory::{ApiFactory, InitOptions},
    loopback::{LoopbackBroker, Operation},
    message::{Message, MessageBuilder, MessageView},
    session::{MessageHandler, Session, SessionHandler},
    topic_matcher::TopicMatcher,
    types::{Parameter, ParameterKind, QoS, SessionState},
};

pub mod bridge;
pub mod client;
pub mod connection_config;
pub mod engine;
pub mod errors;
pub mod factory;
pub mod loopback;
pub mod message;
pub mod session;
pub mod topic_matcher;
pub mod types;

#[cfg(feature = "paho")]
mod c_trace;

#[cfg(feature = "paho")]
pub mod paho_engine;

#[cfg(feature = "paho")]
pub use crate::paho_engine::PahoEngineFactory;

#[cfg(feature = "paho")]
pub use crate::c_trace::PAHO_C_LOG_TARGET;
