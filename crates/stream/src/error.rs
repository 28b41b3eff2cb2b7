// SPDX-License-Identifier: Apache-2.0

//! Errors for the stream crate.

use crate::payload::HandlerId;

/// Errors raised by stream clients.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A non-blocking poll found no matching reply. Callers sleep and retry;
    /// this is the only recoverable error in the stream layer.
    #[error("No message matching the pattern is ready")]
    NoMessage,

    /// A payload was addressed to a handler with no route.
    #[error("No route to handler `{handler}`")]
    UnknownHandler {
        /// The unroutable handler.
        handler: HandlerId,
    },

    /// The peer side of the stream has gone away.
    #[error("Stream closed: {context}")]
    Closed {
        /// Which side went away.
        context: String,
    },
}
