//! Call channel.
//!
//! A single-slot rendezvous between the filesystem driver threads and the host. At most one
//! request is outstanding at any time: a caller places its request into the slot, blocks until
//! the host posts a response, takes the response and frees the slot for the next caller. Every
//! transition happens under one lock and is announced on one condition variable, so a response
//! can never be observed half-written and callers serialize on the slot in lock order.
//!
//! Slot transitions: empty → (request placed, `NotReady`) → (`Success` | `Undefined` |
//! `SignalError`) → empty.

use log::{debug, warn};
use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::reply::Response;
use crate::request::{Kind, Request};
use crate::responder::Responder;


#[derive(Debug, Default)]
struct Slot {
    /// Outstanding request, `None` when the channel is idle.
    request: Option<Request>,
    /// Response to the outstanding request. Only meaningful while `request` is set.
    response: Response,
    /// Set once the channel is closed; no request is accepted or answered after that.
    closed: bool,
}

impl Slot {
    fn pending(&self) -> Option<&Request> {
        match self.request {
            Some(ref request) if self.response.is_not_ready() && !self.closed => Some(request),
            _ => None,
        }
    }
}


/// Single-slot call channel shared by the operation adapters and the host.
#[derive(Debug, Default)]
pub struct CallChannel {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl CallChannel {
    /// Create an idle, open channel.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, slot: MutexGuard<'a, Slot>) -> MutexGuard<'a, Slot> {
        self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a request and block until the host answers it.
    ///
    /// If another request is outstanding, waits for it to complete first. Returns
    /// `Response::NotReady` only if the channel is closed before an answer was posted.
    pub fn submit(&self, request: Request) -> Response {
        let mut slot = self.lock();
        while slot.request.is_some() && !slot.closed {
            slot = self.wait(slot);
        }
        if slot.closed {
            debug!("Call channel closed, not relaying {}", request);
            return Response::NotReady;
        }

        debug!("{}", request);
        slot.request = Some(request);
        slot.response = Response::NotReady;
        self.cond.notify_all();

        // Wakeups may be spurious or meant for other waiters, always recheck
        while slot.response.is_not_ready() && !slot.closed {
            slot = self.wait(slot);
        }

        let response = mem::take(&mut slot.response);
        slot.request = None;
        self.cond.notify_all();
        response
    }

    /// Returns the kind of the request waiting for an answer, if any.
    pub fn waiting(&self) -> Option<Kind> {
        self.lock().pending().map(Request::kind)
    }

    /// Answer the waiting request, if any, with the response computed by `f`.
    ///
    /// `f` runs while the channel is locked. Returns false if no request was waiting.
    pub fn respond_with<F: FnOnce(&Request) -> Response>(&self, f: F) -> bool {
        let mut slot = self.lock();
        let response = match slot.pending() {
            Some(request) => f(request),
            None => return false,
        };
        self.post(&mut slot, response);
        true
    }

    /// Answer the waiting request, if any, by dispatching it to `responder`. Never blocks on
    /// the host side; this is one tick of a cooperative host loop.
    pub fn try_serve<R: Responder + ?Sized>(&self, responder: &mut R) -> bool {
        self.respond_with(|request| request.dispatch(&mut *responder))
    }

    /// Wait up to `timeout` for a request and answer it by dispatching it to `responder`.
    ///
    /// Returns true if a request was answered, false on timeout or if the channel is closed.
    pub fn serve_timeout<R: Responder + ?Sized>(&self, responder: &mut R, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            let response = slot.pending().map(|request| request.dispatch(&mut *responder));
            if let Some(response) = response {
                self.post(&mut slot, response);
                return true;
            }
            if slot.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    fn post(&self, slot: &mut Slot, response: Response) {
        let response = match response {
            // Posting "not ready" would leave the caller blocked forever
            Response::NotReady => {
                warn!("Host posted no answer, treating the operation as undefined");
                Response::Undefined
            }
            response => response,
        };
        slot.response = response;
        self.cond.notify_all();
    }

    /// Close the channel.
    ///
    /// A caller blocked in `submit` wakes up with `Response::NotReady`, later calls to `submit`
    /// return it immediately and the host side stops seeing requests. Closing twice is a no-op.
    pub fn close(&self) {
        let mut slot = self.lock();
        if !slot.closed {
            debug!("Closing call channel");
            slot.closed = true;
            self.cond.notify_all();
        }
    }

    /// Returns true once the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
