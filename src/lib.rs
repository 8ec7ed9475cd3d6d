//! # Field Gateway Library
//!
//! Collect tag reads from LoRa field scanners and deliver them to the cloud.
//!
//! This library provides the core functionality of the gateway: receiving
//! packets from the radio bridge, spooling timestamped records durably, and
//! uploading them per source with retry, backoff and a circuit breaker.

pub mod config;
pub mod error;
pub mod ingest;
pub mod radio;
pub mod record;
pub mod storage;
pub mod upload;
