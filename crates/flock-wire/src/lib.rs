// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire layer of the flock toolkit.
//!
//! A cluster exchanges exactly one JSON-encoded [`Message`] per TCP
//! connection; the receiver reads to EOF, so no length prefix is needed.
//! The [`Dispatcher`] accepts inbound connections and hands validated
//! messages to the node engine through a bounded channel, while the
//! [`Transport`] trait abstracts the outbound side so protocol code can run
//! over real TCP ([`TcpTransport`]) or an in-process [`MemoryHub`].

pub mod dispatcher;
pub mod error;
pub mod message;
pub mod shutdown;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use error::WireError;
pub use message::{Message, MessageType};
pub use shutdown::ShutdownSignal;
pub use transport::{MemoryHub, TcpTransport, Transport};
