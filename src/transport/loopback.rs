// Loopback Transport - In-process channel to a local responder
//
// Every request and response is encoded and decoded exactly as on the wire.
// Faults can be injected per request kind, and every request is logged, so
// tests can interrupt a session at a chosen point and inspect what a retry
// asks for.

use crate::sync::{Request, Response, SyncResponder};
use crate::transport::{PeerChannel, TransportError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Matcher = Box<dyn Fn(&Request) -> bool + Send + Sync>;

struct Fault {
    matches: Matcher,
    remaining: usize,
}

/// Channel that hands requests straight to a [`SyncResponder`]
pub struct LoopbackChannel {
    responder: Arc<SyncResponder>,
    faults: Mutex<Vec<Fault>>,
    log: Mutex<Vec<Request>>,
    delay_ms: u64,
}

impl LoopbackChannel {
    pub fn new(responder: Arc<SyncResponder>) -> Self {
        Self {
            responder,
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            delay_ms: 0,
        }
    }

    /// Add a delay before every response
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Fail the next `times` requests accepted by `matches`
    pub fn fail_matching<F>(&self, times: usize, matches: F)
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Fault {
                matches: Box::new(matches),
                remaining: times,
            });
    }

    /// Fail the next `times` requests of any kind
    pub fn fail_next(&self, times: usize) {
        self.fail_matching(times, |_| true);
    }

    /// Every request received so far, in order (failed ones included)
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn take_fault(&self, request: &Request) -> bool {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let hit = faults
            .iter_mut()
            .find(|f| f.remaining > 0 && (f.matches)(request));
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PeerChannel for LoopbackChannel {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }

        if self.take_fault(&request) {
            return Err(TransportError::Injected(request.kind().to_string()));
        }

        let decoded = Request::from_bytes(&request.to_bytes()?)?;
        let response = self.responder.handle(decoded);
        Ok(Response::from_bytes(&response.to_bytes()?)?)
    }

    fn describe(&self) -> String {
        format!("loopback://{}", self.responder.replica().instance_id())
    }
}
