// types.rs
//
// Miscellaneous small types shared by every layer of the library.
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

//! MQTT support types
//!
//! Each enumeration here has a fixed ordinal that is also its value on
//! the C boundary, so the conversions to and from `i32` are the wire
//! contract of the flattened API.

use std::fmt;

/// Quality of Service Zero: At most once
pub const QOS_0: i32 = 0;

/// Quality of Service One: At least once
pub const QOS_1: i32 = 1;

/// Quality of Service Two: Exactly Once
pub const QOS_2: i32 = 2;

/// The quality of service for message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce = QOS_0,
    /// Acknowledged delivery, possibly duplicated
    AtLeastOnce = QOS_1,
    /// Assured, single delivery
    ExactlyOnce = QOS_2,
}

impl QoS {
    /// Converts a C ordinal into a QoS, if it is in range.
    pub fn from_ordinal(qos: i32) -> Option<Self> {
        use QoS::*;
        match qos {
            QOS_0 => Some(AtMostOnce),
            QOS_1 => Some(AtLeastOnce),
            QOS_2 => Some(ExactlyOnce),
            _ => None,
        }
    }
}

impl From<QoS> for i32 {
    fn from(qos: QoS) -> Self {
        qos as i32
    }
}

/////////////////////////////////////////////////////////////////////////////

/// The connection state of a session.
///
/// A session starts and ends its life `Disconnected`. The session itself
/// is the single source of truth for this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum SessionState {
    /// No client connection exists
    #[default]
    Disconnected = 0,
    /// A connect is in progress
    Connecting = 1,
    /// Connected to the broker
    Connected = 2,
    /// The connection was lost and the engine is retrying
    Reconnecting = 3,
}

impl SessionState {
    /// Gets the C ordinal for the state.
    pub fn ordinal(self) -> i32 {
        self as i32
    }
}

impl From<i32> for SessionState {
    /// Any unknown ordinal is treated as `Disconnected`.
    fn from(state: i32) -> Self {
        use SessionState::*;
        match state {
            1 => Connecting,
            2 => Connected,
            3 => Reconnecting,
            _ => Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SessionState::*;
        let s = match *self {
            Disconnected => "Disconnected",
            Connecting => "Connecting",
            Connected => "Connected",
            Reconnecting => "Reconnecting",
        };
        write!(f, "{}", s)
    }
}

/////////////////////////////////////////////////////////////////////////////

/// A connection parameter that can be set by code.
///
/// Integer and boolean parameters share a single enumeration, so each one
/// also has a [`ParameterKind`] that decides which setter applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Parameter {
    /// Keep alive interval, in seconds
    KeepAliveInterval = 0,
    /// Clean session flag
    CleanSession = 1,
    /// Connection timeout, in seconds
    ConnectionTimeout = 2,
    /// Maximum number of in-flight messages
    MaxInflight = 3,
    /// Maximum number of messages queued while offline
    MaxQueuedMessages = 4,
    /// Delay between reconnect attempts, in seconds
    ReconnectDelay = 5,
    /// Whether to use TLS
    TlsEnabled = 6,
}

/// The value type a [`Parameter`] takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// Set through the integer setter
    Int,
    /// Set through the boolean setter
    Bool,
}

impl Parameter {
    /// Converts a C ordinal into a parameter, if it is in range.
    pub fn from_ordinal(param: i32) -> Option<Self> {
        use Parameter::*;
        match param {
            0 => Some(KeepAliveInterval),
            1 => Some(CleanSession),
            2 => Some(ConnectionTimeout),
            3 => Some(MaxInflight),
            4 => Some(MaxQueuedMessages),
            5 => Some(ReconnectDelay),
            6 => Some(TlsEnabled),
            _ => None,
        }
    }

    /// Gets the kind of value this parameter takes.
    pub fn kind(self) -> ParameterKind {
        use Parameter::*;
        match self {
            CleanSession | TlsEnabled => ParameterKind::Bool,
            _ => ParameterKind::Int,
        }
    }
}

impl From<Parameter> for i32 {
    fn from(param: Parameter) -> Self {
        param as i32
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////
