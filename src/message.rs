// message.rs
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

//! Messages, in owned and borrowed form.
//!
//! Outbound messages are owned by the application. Inbound messages are
//! owned by the engine, and are only lent to the application for the
//! duration of a callback through a [`MessageView`]. Anything needed after
//! the callback returns must be copied out, for example with
//! [`MessageView::to_owned`].

use crate::types::QoS;
use std::{borrow::Cow, fmt};

/// A `Message` represents all the information passed in an MQTT PUBLISH
/// packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retained: bool,
    message_id: i64,
}

impl Message {
    /// Creates a new message with the default QoS (at most once).
    ///
    /// # Arguments
    ///
    /// * `topic` The topic on which the message is published.
    /// * `payload` The binary payload of the message
    pub fn new<T, V>(topic: T, payload: V) -> Self
    where
        T: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Creates a new message that will be retained by the broker.
    pub fn new_retained<T, V>(topic: T, payload: V, qos: QoS) -> Self
    where
        T: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self::new(topic, payload).with_qos(qos).with_retain(true)
    }

    /// Sets the quality of service for the message.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Sets the retained flag for the message.
    pub fn with_retain(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Gets the topic for the message.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Gets the payload of the message.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Gets the payload as a string, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Returns the Quality of Service (QoS) for the message.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Gets the 'retained' flag for the message.
    pub fn is_retained(&self) -> bool {
        self.retained
    }

    /// Gets the message identifier.
    ///
    /// This is zero for a message that was never sent or received.
    pub fn message_id(&self) -> i64 {
        self.message_id
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.topic, self.payload_str())
    }
}

/////////////////////////////////////////////////////////////////////////////

/// A borrowed view of an inbound message.
///
/// The topic and payload point into buffers that belong to the engine, so
/// a view can not outlive the callback that it was handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageView<'a> {
    topic: &'a str,
    payload: &'a [u8],
    qos: QoS,
    retained: bool,
    message_id: i64,
}

impl<'a> MessageView<'a> {
    /// Creates a view over borrowed message parts.
    pub fn new(topic: &'a str, payload: &'a [u8], qos: QoS, retained: bool, message_id: i64) -> Self {
        Self {
            topic,
            payload,
            qos,
            retained,
            message_id,
        }
    }

    /// Copies the view into an owned message.
    pub fn to_message(&self) -> Message {
        Message {
            topic: self.topic.to_string(),
            payload: self.payload.to_vec(),
            qos: self.qos,
            retained: self.retained,
            message_id: self.message_id,
        }
    }

    /// Gets the topic for the message.
    pub fn topic(&self) -> &'a str {
        self.topic
    }

    /// Gets the payload of the message.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Gets the payload as a string, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.payload)
    }

    /// Returns the Quality of Service (QoS) for the message.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Gets the 'retained' flag for the message.
    pub fn is_retained(&self) -> bool {
        self.retained
    }

    /// Gets the message identifier assigned by the engine.
    pub fn message_id(&self) -> i64 {
        self.message_id
    }
}

impl fmt::Display for MessageView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.topic, self.payload_str())
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Builder
/////////////////////////////////////////////////////////////////////////////

/// Builder to create a new Message
#[derive(Debug, Default)]
pub struct MessageBuilder {
    msg: Message,
}

impl MessageBuilder {
    /// Create a new message builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the topic for the message
    pub fn topic<T: Into<String>>(mut self, topic: T) -> Self {
        self.msg.topic = topic.into();
        self
    }

    /// Sets the payload for the message
    pub fn payload<V: Into<Vec<u8>>>(mut self, payload: V) -> Self {
        self.msg.payload = payload.into();
        self
    }

    /// Sets the Quality of Service for the message.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.msg.qos = qos;
        self
    }

    /// Sets whether or not the published message should be retained by the
    /// broker.
    pub fn retained(mut self, retained: bool) -> Self {
        self.msg.retained = retained;
        self
    }

    /// Finalize the builder to create the message.
    pub fn finalize(self) -> Message {
        self.msg
    }
}

/////////////////////////////////////////////////////////////////////////////
//                              Unit Tests
/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "test";
    const PAYLOAD: &[u8] = b"Hello world";

    #[test]
    fn test_new() {
        let msg = Message::new(TOPIC, PAYLOAD);

        assert_eq!(TOPIC, msg.topic());
        assert_eq!(PAYLOAD, msg.payload());
        assert_eq!(QoS::AtMostOnce, msg.qos());
        assert!(!msg.is_retained());
        assert_eq!(0, msg.message_id());
    }

    #[test]
    fn test_new_retained() {
        let msg = Message::new_retained(TOPIC, PAYLOAD, QoS::ExactlyOnce);
        assert_eq!(QoS::ExactlyOnce, msg.qos());
        assert!(msg.is_retained());
    }

    #[test]
    fn test_builder() {
        let msg = MessageBuilder::new()
            .topic(TOPIC)
            .payload(PAYLOAD)
            .qos(QoS::AtLeastOnce)
            .retained(true)
            .finalize();

        assert_eq!(TOPIC, msg.topic());
        assert_eq!("Hello world", msg.payload_str());
        assert_eq!(QoS::AtLeastOnce, msg.qos());
        assert!(msg.is_retained());
    }

    #[test]
    fn test_view_to_message() {
        let topic = String::from("some/topic");
        let payload = vec![1u8, 2, 3];

        let owned = {
            let view = MessageView::new(&topic, &payload, QoS::AtLeastOnce, true, 7);
            assert_eq!("some/topic", view.topic());
            view.to_message()
        };
        drop(topic);
        drop(payload);

        assert_eq!("some/topic", owned.topic());
        assert_eq!(&[1, 2, 3], owned.payload());
        assert_eq!(QoS::AtLeastOnce, owned.qos());
        assert!(owned.is_retained());
        assert_eq!(7, owned.message_id());
    }

    #[test]
    fn test_view_display() {
        let view = MessageView::new("some/topic", b"on", QoS::AtMostOnce, false, 1);
        assert_eq!("some/topic: on", view.to_string());
        assert_eq!(view.to_string(), view.to_message().to_string());

        // Views are plain copies of the borrowed parts
        let copy = view;
        assert_eq!(view, copy);
    }
}
