// factory.rs
//
// Library initialization and the factory for sessions.
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

//! The API factory.
//!
//! An [`ApiFactory`] is proof that the library was initialized. It is a
//! cheap, cloneable, reference-counted token: every session holds a clone,
//! so the initialized state lives for as long as anything still needs it,
//! and is torn down when the last clone is dropped.

use crate::{
    engine::{EngineFactory, EngineResult},
    session::{Session, SessionHandler},
};
use std::{fmt, path::PathBuf, sync::Arc};

/// The options for initializing the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    app_name: String,
    app_version: String,
    debug: bool,
    log_file: Option<PathBuf>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            app_name: String::from("PolarMqtt"),
            app_version: String::from(env!("CARGO_PKG_VERSION")),
            debug: false,
            log_file: None,
        }
    }
}

impl InitOptions {
    /// Creates options for the named application.
    pub fn new<N, V>(app_name: N, app_version: V) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            ..Self::default()
        }
    }

    /// Turns debug output on or off.
    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    /// Sets a file for the engine's trace output.
    pub fn log_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Gets the application name.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Gets the application version.
    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    /// Whether debug output was requested.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Gets the engine trace file, if any.
    pub fn log_file_path(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }
}

/////////////////////////////////////////////////////////////////////////////

struct FactoryInner {
    opts: InitOptions,
    engines: Arc<dyn EngineFactory>,
}

impl Drop for FactoryInner {
    fn drop(&mut self) {
        debug!("Shutting down MQTT API for '{}'", self.opts.app_name);
    }
}

/// The initialized library, and the way to create sessions.
#[derive(Clone)]
pub struct ApiFactory {
    inner: Arc<FactoryInner>,
}

impl ApiFactory {
    /// Initializes the library to create sessions on the given engine.
    ///
    /// This fails with the engine's code if the engine can not be
    /// initialized.
    pub fn initialize(opts: InitOptions, engines: Arc<dyn EngineFactory>) -> EngineResult<Self> {
        debug!(
            "Initializing MQTT API for '{}' v{}",
            opts.app_name, opts.app_version
        );

        if opts.debug && log::max_level() < log::LevelFilter::Debug {
            log::set_max_level(log::LevelFilter::Debug);
        }

        engines.init(&opts)?;

        Ok(Self {
            inner: Arc::new(FactoryInner { opts, engines }),
        })
    }

    /// Gets the options the library was initialized with.
    pub fn options(&self) -> &InitOptions {
        &self.inner.opts
    }

    /// Gets the engine factory used for new sessions.
    pub fn engines(&self) -> &Arc<dyn EngineFactory> {
        &self.inner.engines
    }

    /// The number of live references to the initialized library,
    /// including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Creates a new, disconnected session.
    pub fn create_session(&self, client_id: &str, handler: Arc<dyn SessionHandler>) -> Session {
        let sess = Session::new(self.clone(), client_id);
        sess.set_session_handler(Some(handler));
        sess
    }

    /// Destroys a session, stopping it first.
    pub fn destroy_session(&self, session: Session) {
        session.stop();
        session.detach_handlers();
        debug!("Destroyed session '{}'", session.client_id());
    }
}

impl fmt::Debug for ApiFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiFactory")
            .field("opts", &self.inner.opts)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////
