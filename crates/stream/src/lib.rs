// SPDX-License-Identifier: Apache-2.0

//! The request/reply stream between the master and its workers.
//!
//! Every interaction with the fleet goes through named-handler payloads over
//! a reliable channel. A three-phase handshake (SYN reply, ACK, final reply)
//! wraps every post so that any set of workers co-addressed by the master in
//! the same order executes the requests in that order. This is what makes
//! collective operations (parameter reallocation, cross-topology data
//! transfer) deadlock-free without any coordination between workers.
//!
//! The concrete network transport is an external collaborator; this crate
//! defines the contract ([`RequestClient`]) plus an in-process transport
//! ([`local::LocalStream`]) used by tests and simulations.

pub mod client;
pub mod error;
pub mod local;
pub mod payload;

pub use client::{POLL_INTERVAL, RequestClient, awaitable_response, gather_replies, request_all, round_trip};
pub use error::Error;
pub use payload::{
    DataTransferSpec, HandleKind, HandlerId, HookCall, OffloadSpec, ParamReallocSpec, Payload,
    PayloadData, ProducerMapping, ReplyPattern, RequestId,
};
