//! MQTT broker client for the bridge.
//!
//! Wraps a [`rumqttc::AsyncClient`] and its event loop in a client with the
//! contract the integration relies on: a last-will registered at
//! construction, retained publishes, connect/disconnect callbacks, and a
//! connected flag that is only true once the connect callback path has run.

pub mod client;

pub use client::{MqttClient, MqttError};
