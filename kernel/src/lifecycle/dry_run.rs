// Dry-Run Collaborators
//
// In-process execution engine and topic client. They track which plans
// were started and which topics exist without processing any data.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{EngineError, ExecutionEngine, QueryHandle, TopicClient, TopicError};
use crate::log::Command;
use crate::state::QueryId;

#[derive(Debug, Default)]
pub struct DryRunEngine {
    failing_sinks: Mutex<BTreeSet<String>>,
    ignore_stop: AtomicBool,
    started: Mutex<Vec<QueryId>>,
}

impl DryRunEngine {
    /// Make every future build for `sink` fail.
    pub fn fail_sink(&self, sink: impl Into<String>) {
        self.failing_sinks.lock().insert(sink.into());
    }

    /// Handles built afterwards never acknowledge stop requests.
    pub fn ignore_stop_requests(&self, ignore: bool) {
        self.ignore_stop.store(ignore, Ordering::Relaxed);
    }

    /// Every query id started so far, in start order.
    pub fn started(&self) -> Vec<QueryId> {
        self.started.lock().clone()
    }
}

impl ExecutionEngine for DryRunEngine {
    fn build_and_start(
        &self,
        command: &Command,
        query_id: QueryId,
    ) -> Result<Box<dyn QueryHandle>, EngineError> {
        if self.failing_sinks.lock().contains(&command.target_id) {
            return Err(EngineError::Build {
                query_id,
                reason: format!("no plan for sink `{}`", command.target_id),
            });
        }
        self.started.lock().push(query_id);
        Ok(Box::new(DryRunHandle {
            running: Arc::new((Mutex::new(true), Condvar::new())),
            ignore_stop: self.ignore_stop.load(Ordering::Relaxed),
        }))
    }
}

struct DryRunHandle {
    running: Arc<(Mutex<bool>, Condvar)>,
    ignore_stop: bool,
}

impl DryRunHandle {
    fn set_stopped(&self) {
        let (lock, cvar) = &*self.running;
        *lock.lock() = false;
        cvar.notify_all();
    }
}

impl QueryHandle for DryRunHandle {
    fn request_stop(&mut self) {
        if !self.ignore_stop {
            self.set_stopped();
        }
    }

    fn await_stopped(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let (lock, cvar) = &*self.running;
        let mut running = lock.lock();
        while *running {
            match deadline {
                Some(deadline) => {
                    if cvar.wait_until(&mut running, deadline).timed_out() {
                        return !*running;
                    }
                }
                None => cvar.wait(&mut running),
            }
        }
        true
    }

    fn force_stop(&mut self) {
        self.set_stopped();
    }

    fn is_running(&self) -> bool {
        *self.running.0.lock()
    }
}

#[derive(Debug)]
pub struct InMemoryTopicClient {
    topics: Mutex<BTreeMap<String, u32>>,
    available: AtomicBool,
}

impl Default for InMemoryTopicClient {
    fn default() -> Self {
        Self {
            topics: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryTopicClient {
    /// While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn partitions(&self, topic: &str) -> Option<u32> {
        self.topics.lock().get(topic).copied()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    fn check_available(&self) -> Result<(), TopicError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TopicError::Unavailable("broker unreachable".into()))
        }
    }
}

impl TopicClient for InMemoryTopicClient {
    fn topic_exists(&self, topic: &str) -> Result<bool, TopicError> {
        self.check_available()?;
        Ok(self.topics.lock().contains_key(topic))
    }

    fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TopicError> {
        self.check_available()?;
        let mut topics = self.topics.lock();
        match topics.get(topic) {
            Some(existing) if *existing != partitions => Err(TopicError::Rejected {
                topic: topic.to_string(),
                reason: format!("exists with {existing} partitions"),
            }),
            _ => {
                topics.insert(topic.to_string(), partitions);
                Ok(())
            }
        }
    }

    fn delete_topic(&self, topic: &str) -> Result<(), TopicError> {
        self.check_available()?;
        self.topics.lock().remove(topic);
        Ok(())
    }
}
