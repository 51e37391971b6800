// errors.rs
//
// Error and Result types for the Polar MQTT bridge library.
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

use std::{ffi::NulError, result};
use thiserror::Error;

// ----- Return codes of the flattened C API -----

/// The C call succeeded.
pub const MQTT_SUCCESS: i32 = 0;

/// The C call failed, or was given an invalid handle or argument.
pub const MQTT_FAILURE: i32 = -1;

// ----- Codes delivered to the error notification -----
// Engine failure codes are passed through unchanged. These are the codes
// that the session itself originates.

/// The connection to the broker was lost.
pub const RC_CONNECTION_LOST: i32 = -1;

/// An operation was attempted with no engine client (session not started).
pub const RC_DISCONNECTED: i32 = -3;

/// The session configuration can not be used to connect.
pub const RC_BAD_CONFIG: i32 = -20;

/// No engine is available to create a client.
pub const RC_ENGINE_UNAVAILABLE: i32 = -30;

// ----- Messages delivered to the error notification -----

/// The engine could not create a client.
pub const MSG_CREATE_FAILED: &str = "Failed to create client";
/// The broker was never configured.
pub const MSG_BROKER_NOT_SET: &str = "Broker URL not set";
/// The engine connect call failed.
pub const MSG_CONNECT_FAILED: &str = "Connection failed";
/// The engine subscribe call failed.
pub const MSG_SUBSCRIBE_FAILED: &str = "Subscribe failed";
/// The engine unsubscribe call failed.
pub const MSG_UNSUBSCRIBE_FAILED: &str = "Unsubscribe failed";
/// The engine publish call failed.
pub const MSG_PUBLISH_FAILED: &str = "Publish failed";
/// The connection was lost, and the engine gave no cause.
pub const MSG_CONNECTION_LOST: &str = "Connection lost";

/// The errors from a client operation.
///
/// Only the safe binding produces these. Every failing return code from
/// the C layer maps onto exactly one of them, depending on the call that
/// produced it.
#[derive(Error, Debug)]
pub enum Error {
    /// The library was not initialized, or a session could not be created.
    #[error("MQTT initialization failed")]
    InitializationError,
    /// The broker host was empty or rejected.
    #[error("Invalid broker URL")]
    InvalidBrokerUrl,
    /// The user name was empty or the credentials were rejected.
    #[error("Invalid credentials")]
    InvalidCredentials,
    /// The session could not connect to the broker.
    #[error("Connection failed")]
    ConnectionError,
    /// A subscribe request failed.
    #[error("Subscription failed")]
    SubscriptionError,
    /// An unsubscribe request failed, or the subscription handle is unknown.
    #[error("Unsubscribe failed")]
    UnsubscriptionError,
    /// A publish request failed.
    #[error("Publication failed")]
    PublicationError,
    /// The topic was empty.
    #[error("Invalid topic")]
    InvalidTopic,
    /// The session handle was rejected by the C layer.
    #[error("Invalid session handle")]
    InvalidSession,
    /// A string can not cross the C boundary because it contains a NUL.
    #[error("String contains null byte: {0}")]
    Nul(#[from] NulError),
}

/// The result type for client operations.
pub type Result<T> = result::Result<T, Error>;

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_error_from_nul() {
        let err: Error = CString::new("ab\0cd").unwrap_err().into();
        assert!(matches!(err, Error::Nul(_)));
        assert!(err.to_string().starts_with("String contains null byte"));
    }

    #[test]
    fn test_failure_codes_are_distinct() {
        assert_ne!(MQTT_SUCCESS, MQTT_FAILURE);
        assert_ne!(RC_DISCONNECTED, RC_BAD_CONFIG);
        assert_ne!(RC_BAD_CONFIG, RC_ENGINE_UNAVAILABLE);
    }
}
