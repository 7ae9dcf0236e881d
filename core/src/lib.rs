// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Server-side core of an end-to-end encrypted, zero-knowledge
//! backend-as-a-service: the connection core and the database core (§1).
//!
//! The server never observes plaintext user data or user keys; this crate
//! stores and orders opaque ciphertext and brokers real-time
//! synchronization across connections.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod directory;
pub mod dispatcher;
pub mod errors;
pub mod identifiers;
pub mod rate_limiter;
pub mod registry;
pub mod store;
pub mod txlog;

pub use connection::{Core, ConnectionCore, ConnectionState};
