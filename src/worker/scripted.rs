//! Scripted worker driver for tests and dry runs.
//!
//! Replies are queued per prompt; the last reply of a queue repeats. Prompts
//! without a script get the default reply, which echoes the prompt back.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::time::Duration;
//! use sheetrelay::task::TaskMode;
//! use sheetrelay::worker::{ScriptedDriver, ScriptedReply, SessionConfig, WorkerDriver, WorkerRequest};
//!
//! let driver = ScriptedDriver::new().on_prompt("hello", [ScriptedReply::answer("hi")]);
//! let handle = driver
//!     .start(&SessionConfig { worker_type: "echo".into(), slot: 0 })
//!     .await
//!     .unwrap();
//! let request = WorkerRequest { task_id: "g1:C5".into(), prompt: "hello".into(), mode: TaskMode::Normal };
//! let response = driver.execute(&handle, &request, Duration::from_secs(1)).await.unwrap();
//! assert_eq!(response.payload, "hi");
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::worker::{
    DriverError, SessionConfig, SessionHandle, WorkerDriver, WorkerRequest, WorkerResponse,
};

/// One canned reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Answer `"{worker_type}: {prompt}"`.
    Echo,
    /// Succeed with this payload.
    Answer(String),
    /// Answer with `success = false` and this reason.
    Reject(String),
    /// Fail with this driver error.
    Error(DriverError),
    /// Never answer.
    Hang,
}

impl ScriptedReply {
    /// Shorthand for [`ScriptedReply::Answer`].
    pub fn answer(payload: impl Into<String>) -> Self {
        Self::Answer(payload.into())
    }
}

/// In-process driver with scripted behaviour and call counters.
#[derive(Debug)]
pub struct ScriptedDriver {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    default_reply: ScriptedReply,
    ready_after: Option<usize>,
    latency: Duration,
    live: Mutex<HashSet<Uuid>>,
    probes_by_session: Mutex<HashMap<Uuid, usize>>,
    requests: Mutex<Vec<(usize, WorkerRequest)>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    probes: AtomicUsize,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_reply: ScriptedReply::Echo,
            ready_after: Some(0),
            latency: Duration::ZERO,
            live: Mutex::new(HashSet::new()),
            probes_by_session: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }
}

impl ScriptedDriver {
    /// A driver whose sessions are ready at once and echo every prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `replies` for `prompt`; the last one repeats.
    pub fn on_prompt(self, prompt: impl Into<String>, replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        self.scripts
            .lock()
            .insert(prompt.into(), replies.into_iter().collect());
        self
    }

    /// Reply used for prompts without a script.
    pub fn with_default(mut self, reply: ScriptedReply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Sessions fail their first `failed_probes` readiness probes.
    pub fn ready_after(mut self, failed_probes: usize) -> Self {
        self.ready_after = Some(failed_probes);
        self
    }

    /// Sessions never become ready.
    pub fn never_ready(mut self) -> Self {
        self.ready_after = None;
        self
    }

    /// Every execution takes this long before replying.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sessions started so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Sessions stopped so far.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Readiness probes so far.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.live.lock().len()
    }

    /// Every request executed, with the slot that served it.
    pub fn requests(&self) -> Vec<(usize, WorkerRequest)> {
        self.requests.lock().clone()
    }

    fn next_reply(&self, prompt: &str) -> ScriptedReply {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(prompt) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(ScriptedReply::Echo),
            Some(queue) => queue.front().cloned().unwrap_or(ScriptedReply::Echo),
            None => self.default_reply.clone(),
        }
    }
}

#[async_trait]
impl WorkerDriver for ScriptedDriver {
    async fn start(&self, config: &SessionConfig) -> Result<SessionHandle, DriverError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let handle = SessionHandle::new(config);
        self.live.lock().insert(handle.id);
        Ok(handle)
    }

    async fn probe_ready(&self, handle: &SessionHandle) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if !self.live.lock().contains(&handle.id) {
            return false;
        }
        let mut seen = self.probes_by_session.lock();
        let count = seen.entry(handle.id).or_insert(0);
        *count += 1;
        matches!(self.ready_after, Some(n) if *count > n)
    }

    async fn execute(
        &self,
        handle: &SessionHandle,
        request: &WorkerRequest,
        _timeout: Duration,
    ) -> Result<WorkerResponse, DriverError> {
        if !self.live.lock().contains(&handle.id) {
            return Err(DriverError::Closed(format!("session {} is not running", handle.id)));
        }
        self.requests.lock().push((handle.slot, request.clone()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.next_reply(&request.prompt) {
            ScriptedReply::Echo => Ok(WorkerResponse {
                success: true,
                payload: format!("{}: {}", handle.worker_type, request.prompt),
            }),
            ScriptedReply::Answer(payload) => Ok(WorkerResponse {
                success: true,
                payload,
            }),
            ScriptedReply::Reject(payload) => Ok(WorkerResponse {
                success: false,
                payload,
            }),
            ScriptedReply::Error(e) => Err(e),
            ScriptedReply::Hang => std::future::pending().await,
        }
    }

    async fn stop(&self, handle: &SessionHandle) {
        if self.live.lock().remove(&handle.id) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskMode;

    fn request(prompt: &str) -> WorkerRequest {
        WorkerRequest {
            task_id: "g1:C5".into(),
            prompt: prompt.into(),
            mode: TaskMode::Normal,
        }
    }

    async fn session(driver: &ScriptedDriver) -> SessionHandle {
        driver
            .start(&SessionConfig {
                worker_type: "w".into(),
                slot: 1,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn scripted_queue_pops_then_repeats_last() {
        let driver = ScriptedDriver::new().on_prompt(
            "p",
            [
                ScriptedReply::Error(DriverError::NotListening("boot".into())),
                ScriptedReply::answer("done"),
            ],
        );
        let handle = session(&driver).await;
        let timeout = Duration::from_secs(1);
        assert!(driver.execute(&handle, &request("p"), timeout).await.is_err());
        assert_eq!(driver.execute(&handle, &request("p"), timeout).await.unwrap().payload, "done");
        assert_eq!(driver.execute(&handle, &request("p"), timeout).await.unwrap().payload, "done");
        assert_eq!(driver.execute(&handle, &request("q"), timeout).await.unwrap().payload, "w: q");
        assert_eq!(driver.requests().len(), 4);
        assert_eq!(driver.requests()[0].0, 1);
    }

    #[tokio::test]
    async fn stopped_sessions_are_closed() {
        let driver = ScriptedDriver::new();
        let handle = session(&driver).await;
        assert!(driver.probe_ready(&handle).await);
        driver.stop(&handle).await;
        driver.stop(&handle).await;
        assert_eq!(driver.stops(), 1);
        assert!(!driver.probe_ready(&handle).await);
        assert!(matches!(
            driver.execute(&handle, &request("p"), Duration::from_secs(1)).await,
            Err(DriverError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn readiness_is_counted_per_session() {
        let driver = ScriptedDriver::new().ready_after(1);
        let handle = session(&driver).await;
        assert!(!driver.probe_ready(&handle).await);
        assert!(driver.probe_ready(&handle).await);
        let other = session(&driver).await;
        assert!(!driver.probe_ready(&other).await);
    }
}
