// c_trace.rs
//
// Routes the Paho C library trace into the Rust log facade.
//
// This file is part of the Polar MQTT bridge library.
//

/*******************************************************************************
 * Copyright (c) 2023 Frank Pagliughi <fpagliughi@mindspring.com>
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

//! Trace output from the Paho C library.
//!
//! The C library has more trace levels than `log`, so they are folded
//! together. Everything goes out under the `paho_mqtt_c` target, which
//! can be filtered like any other module.

use crate::factory::InitOptions;
use paho_mqtt_sys as ffi;
use std::{ffi::CStr, os::raw::c_char, sync::Once};

/// The log target for the C library trace
pub const PAHO_C_LOG_TARGET: &str = "paho_mqtt_c";

/// The environment variable the C library reads for a trace file.
const C_TRACE_FILE_VAR: &str = "MQTT_C_CLIENT_TRACE";

static INSTALL: Once = Once::new();

// Called from the C library for each trace line.
unsafe extern "C" fn on_c_trace(lvl: ffi::MQTTASYNC_TRACE_LEVELS, msg: *mut c_char) {
    if msg.is_null() {
        return;
    }
    if let Ok(msg) = CStr::from_ptr(msg).to_str() {
        log!(target: PAHO_C_LOG_TARGET, level_from_c(lvl), "{}", msg);
    }
}

/// Converts a C trace level to the closest log level.
pub fn level_from_c(level: ffi::MQTTASYNC_TRACE_LEVELS) -> log::Level {
    match level {
        ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_FATAL
        | ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_SEVERE => log::Level::Error,
        ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_ERROR => log::Level::Warn,
        ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_PROTOCOL => log::Level::Info,
        ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_MINIMUM
        | ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_MEDIUM => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

/// Converts a log level to the most verbose C trace level within it.
pub fn level_into_c(level: log::Level) -> ffi::MQTTASYNC_TRACE_LEVELS {
    match level {
        log::Level::Error => ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_SEVERE,
        log::Level::Warn => ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_ERROR,
        log::Level::Info => ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_PROTOCOL,
        log::Level::Debug => ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_MEDIUM,
        log::Level::Trace => ffi::MQTTASYNC_TRACE_LEVELS_MQTTASYNC_TRACE_MAXIMUM,
    }
}

// The most verbose level enabled for the C target, if any.
fn enabled_level() -> Option<log::Level> {
    use log::Level::*;
    [Trace, Debug, Info, Warn, Error]
        .into_iter()
        .find(|lvl| log_enabled!(target: PAHO_C_LOG_TARGET, *lvl))
}

/// Hooks the C library trace into the logger.
///
/// The callback is only installed once per process. The trace file, if
/// any, must be set before the first client is created.
pub fn install(opts: &InitOptions) {
    if let Some(path) = opts.log_file_path() {
        std::env::set_var(C_TRACE_FILE_VAR, path);
    }

    INSTALL.call_once(|| unsafe {
        ffi::MQTTAsync_setTraceCallback(Some(on_c_trace));
    });

    let level = if opts.is_debug() {
        Some(log::Level::Debug.max(enabled_level().unwrap_or(log::Level::Debug)))
    }
    else {
        enabled_level()
    };

    if let Some(level) = level {
        debug!("Setting Paho C trace level from {:?}", level);
        unsafe { ffi::MQTTAsync_setTraceLevel(level_into_c(level)) };
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_round_trip_to_the_same_log_level() {
        use log::Level::*;
        for lvl in [Error, Warn, Info, Debug, Trace] {
            assert_eq!(lvl, level_from_c(level_into_c(lvl)));
        }
    }
}
