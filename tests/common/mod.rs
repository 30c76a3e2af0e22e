//! Scripted in-memory transports for driving the pipeline

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use eapi_client::{
    transport::{Endpoint, Transport, TransportError, TransportFactory},
    CallEvent, CommandPipeline, ConnectionManager, EventSink, PoolConfig, RetryPolicy,
};
use eapi_shared::state_machine::{TransportEvent, TransportLifecycle, TransportState};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Responder = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// What the fake device does with the next request
pub enum Step {
    /// Answer with a JSON body built from the parsed request
    Reply(Responder),
    /// Answer with raw bytes
    Raw(&'static [u8]),
    Timeout,
    Io,
    Unauthorized,
    /// Never answer
    Hang,
}

/// One result per command, each naming its command and position
pub fn echo() -> Step {
    Step::Reply(Box::new(|request| {
        let results: Vec<Value> = request["params"]["cmds"]
            .as_array()
            .map(|cmds| {
                cmds.iter()
                    .enumerate()
                    .map(|(i, cmd)| json!({"position": i, "cmd": cmd}))
                    .collect()
            })
            .unwrap_or_default();
        json!({"jsonrpc": "2.0", "id": request["id"], "result": results})
    }))
}

pub fn result(results: Value) -> Step {
    Step::Reply(Box::new(move |request| {
        json!({"jsonrpc": "2.0", "id": request["id"], "result": results})
    }))
}

pub fn error(code: i64, message: &'static str, data: Value) -> Step {
    Step::Reply(Box::new(move |request| {
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": code, "message": message, "data": data}
        })
    }))
}

pub fn rejected(code: i64, message: &'static str) -> Step {
    Step::Reply(Box::new(move |request| {
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": code, "message": message}
        })
    }))
}

pub fn wrong_id() -> Step {
    Step::Reply(Box::new(|_| json!({"jsonrpc": "2.0", "id": "someone-else", "result": [{}]})))
}

/// Shared script and counters for every transport a factory builds
#[derive(Default)]
pub struct Script {
    steps: Mutex<VecDeque<Step>>,
    refuse_connects: AtomicUsize,
    pub connects: AtomicUsize,
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,
    requests: Mutex<Vec<Value>>,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    /// Fail the next `count` connect attempts
    pub fn refuse_connects(self: &Arc<Self>, count: usize) -> Arc<Self> {
        self.refuse_connects.store(count, Ordering::SeqCst);
        self.clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Parsed request bodies in arrival order
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    fn next_step(&self) -> Option<Step> {
        self.steps.lock().pop_front()
    }
}

pub struct ScriptedTransport {
    script: Arc<Script>,
    lifecycle: TransportLifecycle,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .script
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }
        self.lifecycle.process_event(TransportEvent::Connect);
        Ok(())
    }

    async fn send(&mut self, request: &[u8]) -> Result<Bytes, TransportError> {
        if !self.lifecycle.can_send() {
            return Err(TransportError::NotConnected);
        }
        self.script.sends.fetch_add(1, Ordering::SeqCst);
        let parsed: Value = serde_json::from_slice(request).unwrap();
        self.script.requests.lock().push(parsed.clone());

        match self.script.next_step() {
            Some(Step::Reply(respond)) => Ok(Bytes::from(serde_json::to_vec(&respond(&parsed)).unwrap())),
            Some(Step::Raw(body)) => Ok(Bytes::from_static(body)),
            Some(Step::Timeout) => {
                self.lifecycle.process_event(TransportEvent::Fault);
                Err(TransportError::Timeout(Duration::from_secs(60)))
            }
            Some(Step::Io) | None => {
                self.lifecycle.process_event(TransportEvent::Fault);
                Err(TransportError::Io("connection reset by peer".into()))
            }
            Some(Step::Unauthorized) => Err(TransportError::Unauthorized {
                status: 401,
                reason: "Unauthorized".into(),
            }),
            Some(Step::Hang) => futures::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        self.lifecycle.process_event(TransportEvent::Close);
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn name(&self) -> &'static str {
        "Scripted"
    }
}

pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl TransportFactory for ScriptedFactory {
    fn build(&self, _endpoint: &Endpoint) -> Box<dyn Transport> {
        Box::new(ScriptedTransport {
            script: self.script.clone(),
            lifecycle: TransportLifecycle::new(),
        })
    }
}

/// Captures every call event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CallEvent::AttemptFailed {
                    retry_in: Some(delay),
                    ..
                } => Some(delay),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &CallEvent) {
        self.events.lock().push(event.clone());
    }
}

pub struct Harness {
    pub pipeline: CommandPipeline,
    pub manager: Arc<ConnectionManager>,
    pub sink: Arc<RecordingSink>,
    pub endpoint: Endpoint,
}

pub fn create_harness(script: &Arc<Script>, retry: RetryPolicy) -> Harness {
    create_harness_with_pool(script, retry, PoolConfig::default())
}

pub fn create_harness_with_pool(script: &Arc<Script>, retry: RetryPolicy, pool: PoolConfig) -> Harness {
    let factory = Arc::new(ScriptedFactory {
        script: script.clone(),
    });
    let manager = Arc::new(ConnectionManager::new(pool, factory));
    let sink = Arc::new(RecordingSink::default());
    let pipeline = CommandPipeline::new(manager.clone(), retry).with_sink(sink.clone());
    Harness {
        pipeline,
        manager,
        sink,
        endpoint: Endpoint::https("veos1"),
    }
}
