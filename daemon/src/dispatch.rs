// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Execution contexts for listener callbacks.
//!
//! Callbacks are posted, never invoked inline, so a slow listener cannot
//! block the poster or anyone holding the poster's locks.

use log::{info, warn};
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

pub type Task = Box<dyn FnOnce() + Send>;

pub trait Executor: Send + Sync {
    fn post(&self, task: Task);
}

/// Runs tasks in order on a dedicated named thread.
///
/// The thread exits once the executor is dropped.
pub struct ThreadExecutor {
    tx: Mutex<Sender<Task>>,
}

impl ThreadExecutor {
    pub fn new(name: &str) -> anyhow::Result<Arc<ThreadExecutor>> {
        let (tx, rx) = channel::<Task>();
        let thread_name = name.to_string();
        thread::Builder::new().name(thread_name.clone()).spawn(move || {
            while let Ok(task) = rx.recv() {
                task();
            }
            info!("{thread_name} executor stopped");
        })?;
        Ok(Arc::new(ThreadExecutor { tx: Mutex::new(tx) }))
    }
}

impl Executor for ThreadExecutor {
    fn post(&self, task: Task) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.send(task).is_err() {
            warn!("executor thread is gone, dropping task");
        }
    }
}

/// Holds tasks until `run_pending` is called.
#[derive(Default)]
pub struct QueuedExecutor {
    tasks: Mutex<VecDeque<Task>>,
}

impl QueuedExecutor {
    pub fn new() -> Arc<QueuedExecutor> {
        Arc::new(QueuedExecutor::default())
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Runs tasks until the queue is empty, including tasks posted by the
    /// tasks themselves. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Executor for QueuedExecutor {
    fn post(&self, task: Task) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_thread_executor_runs_in_order() {
        let executor = ThreadExecutor::new("test-executor").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            executor.post(Box::new(move || {
                assert_eq!(thread::current().name(), Some("test-executor"));
                tx.send(i).unwrap();
            }));
        }
        let got: Vec<i32> =
            (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_queued_executor_defers_until_run() {
        let executor = QueuedExecutor::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hits_clone = hits.clone();
        let inner = executor.clone();
        executor.post(Box::new(move || {
            hits_clone.lock().unwrap().push("outer");
            let hits_inner = hits_clone.clone();
            inner.post(Box::new(move || hits_inner.lock().unwrap().push("inner")));
        }));
        assert_eq!(executor.pending(), 1);
        assert!(hits.lock().unwrap().is_empty());
        assert_eq!(executor.run_pending(), 2);
        assert_eq!(*hits.lock().unwrap(), vec!["outer", "inner"]);
        assert_eq!(executor.run_pending(), 0);
    }
}
