// SPDX-License-Identifier: Apache-2.0

//! In-process stream transport.
//!
//! Master and workers run as `!Send` tasks on one current-thread runtime;
//! routing, inboxes and the reply queue live behind a shared `Rc`. Workers
//! drive their half of the handshake through [`WorkerEndpoint::accept`]: a
//! SYN goes out as soon as a request is dequeued, and requests are released
//! for execution in ACK order, which is exactly the ordering contract the
//! wire protocol promises.

use crate::error::Error;
use crate::payload::{HandleKind, HandlerId, Payload, PayloadData, ReplyPattern, RequestId};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tokio::sync::mpsc;
use trainflow_config::WorkerId;

struct Inner {
    routing: HashMap<HandlerId, WorkerId>,
    inboxes: HashMap<WorkerId, mpsc::UnboundedSender<Payload>>,
    reply_rx: mpsc::UnboundedReceiver<Payload>,
    pending: VecDeque<Payload>,
}

/// The master's end of an in-process stream.
#[derive(Clone)]
pub struct LocalStream {
    inner: Rc<RefCell<Inner>>,
}

/// A worker's end of an in-process stream.
pub struct WorkerEndpoint {
    worker: WorkerId,
    inbox: mpsc::UnboundedReceiver<Payload>,
    replies: mpsc::UnboundedSender<Payload>,
    pending_acks: HashMap<RequestId, Payload>,
    ready: VecDeque<Payload>,
}

impl LocalStream {
    /// Builds a stream for the given handler→worker routing table, returning
    /// the master client and one endpoint per worker id.
    #[must_use]
    pub fn new(routing: HashMap<HandlerId, WorkerId>) -> (Self, HashMap<WorkerId, WorkerEndpoint>) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut inboxes = HashMap::new();
        let mut endpoints = HashMap::new();
        for &worker in routing.values() {
            if inboxes.contains_key(&worker) {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = inboxes.insert(worker, tx);
            let _ = endpoints.insert(
                worker,
                WorkerEndpoint {
                    worker,
                    inbox: rx,
                    replies: reply_tx.clone(),
                    pending_acks: HashMap::new(),
                    ready: VecDeque::new(),
                },
            );
        }
        (
            Self {
                inner: Rc::new(RefCell::new(Inner {
                    routing,
                    inboxes,
                    reply_rx,
                    pending: VecDeque::new(),
                })),
            },
            endpoints,
        )
    }
}

impl super::client::RequestClient for LocalStream {
    fn post(&self, payload: Payload) -> Result<RequestId, Error> {
        let inner = self.inner.borrow();
        let worker = *inner
            .routing
            .get(&payload.handler)
            .ok_or_else(|| Error::UnknownHandler {
                handler: payload.handler.clone(),
            })?;
        let request_id = payload.request_id;
        let inbox = inner.inboxes.get(&worker).ok_or_else(|| Error::Closed {
            context: format!("worker {worker} has no inbox"),
        })?;
        inbox.send(payload).map_err(|_| Error::Closed {
            context: format!("worker {worker} hung up"),
        })?;
        Ok(request_id)
    }

    fn poll(&self, pattern: Option<&ReplyPattern>) -> Result<Payload, Error> {
        let mut inner = self.inner.borrow_mut();
        while let Ok(reply) = inner.reply_rx.try_recv() {
            inner.pending.push_back(reply);
        }
        let position = match pattern {
            None => {
                if inner.pending.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            Some(pattern) => inner
                .pending
                .iter()
                .position(|p| pattern.matches(&p.request_id)),
        };
        position
            .and_then(|i| inner.pending.remove(i))
            .ok_or(Error::NoMessage)
    }
}

impl WorkerEndpoint {
    /// The worker id this endpoint belongs to.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Receives the next request released for execution.
    ///
    /// Dequeued requests are SYN-acknowledged immediately and parked until
    /// the master's ACK arrives; requests are returned in ACK order.
    pub async fn accept(&mut self) -> Result<Payload, Error> {
        loop {
            if let Some(request) = self.ready.pop_front() {
                return Ok(request);
            }
            let message = self.inbox.recv().await.ok_or_else(|| Error::Closed {
                context: "master hung up".to_owned(),
            })?;
            if message.handle_name == HandleKind::Ack {
                if let Some(request) = self.pending_acks.remove(&message.request_id) {
                    self.ready.push_back(request);
                }
                continue;
            }
            self.send_reply(Payload::reply(
                message.handler.clone(),
                message.syn_reply_id,
                PayloadData::Empty,
            ))?;
            let _ = self.pending_acks.insert(message.ack_reply_id, message);
        }
    }

    /// Sends the final reply for `request`.
    pub fn reply(&self, request: &Payload, data: PayloadData) -> Result<(), Error> {
        self.send_reply(Payload::reply(request.handler.clone(), request.request_id, data))
    }

    fn send_reply(&self, reply: Payload) -> Result<(), Error> {
        self.replies.send(reply).map_err(|_| Error::Closed {
            context: "master hung up".to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RequestClient, request_all, round_trip};
    use std::collections::HashMap;
    use std::future::Future;

    fn two_worker_stream() -> (LocalStream, HashMap<WorkerId, WorkerEndpoint>) {
        let routing = HashMap::from([(HandlerId::Data(0), 0), (HandlerId::Data(1), 1)]);
        LocalStream::new(routing)
    }

    fn run_local<F: Future>(fut: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        rt.block_on(local.run_until(fut))
    }

    #[test]
    fn empty_poll_is_no_message() {
        let (stream, _endpoints) = two_worker_stream();
        assert!(matches!(stream.poll(None), Err(Error::NoMessage)));
    }

    #[test]
    fn unknown_handler_rejected() {
        let (stream, _endpoints) = two_worker_stream();
        let p = Payload::new(HandlerId::Data(7), HandleKind::Fetch, PayloadData::Empty);
        assert!(matches!(
            stream.post(p),
            Err(Error::UnknownHandler { .. })
        ));
    }

    #[test]
    fn round_trip_through_echo_worker() {
        run_local(async {
            let routing = HashMap::from([(HandlerId::Data(0), 0)]);
            let (stream, mut endpoints) = LocalStream::new(routing);
            let mut endpoint = endpoints.remove(&0).expect("worker 0");

            let worker = tokio::task::spawn_local(async move {
                let request = endpoint.accept().await.expect("request");
                endpoint
                    .reply(&request, PayloadData::Indices(vec![1, 2, 3]))
                    .expect("reply");
            });

            let replies = round_trip(
                &stream,
                vec![Payload::new(
                    HandlerId::Data(0),
                    HandleKind::Store,
                    PayloadData::Empty,
                )],
            )
            .await
            .expect("round trip");
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].data, PayloadData::Indices(vec![1, 2, 3]));
            worker.await.expect("worker task");
        });
    }

    #[test]
    fn handshake_preserves_post_order_on_every_worker() {
        run_local(async {
            let (stream, endpoints) = two_worker_stream();
            let log: Rc<RefCell<Vec<(WorkerId, HandleKind)>>> = Rc::new(RefCell::new(Vec::new()));

            let mut worker_tasks = Vec::new();
            for (_, mut endpoint) in endpoints {
                let log = log.clone();
                worker_tasks.push(tokio::task::spawn_local(async move {
                    for _ in 0..2 {
                        let request = endpoint.accept().await.expect("request");
                        log.borrow_mut()
                            .push((endpoint.worker_id(), request.handle_name));
                        endpoint.reply(&request, PayloadData::Empty).expect("reply");
                    }
                }));
            }

            // Two collective groups, one per handle kind, in a fixed order.
            for kind in [HandleKind::Evaluate, HandleKind::ClearDataCache] {
                let group = vec![
                    Payload::new(HandlerId::Data(0), kind, PayloadData::Empty),
                    Payload::new(HandlerId::Data(1), kind, PayloadData::Empty),
                ];
                let _ = request_all(&stream, group).await.expect("handshake");
            }

            for task in worker_tasks {
                task.await.expect("worker task");
            }

            // Both workers must have executed the groups in the same order.
            let log = log.borrow();
            for worker in [0, 1] {
                let order: Vec<HandleKind> = log
                    .iter()
                    .filter(|(w, _)| *w == worker)
                    .map(|(_, k)| *k)
                    .collect();
                assert_eq!(order, vec![HandleKind::Evaluate, HandleKind::ClearDataCache]);
            }
        });
    }
}
