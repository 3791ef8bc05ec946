// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! A running task attempt and the callbacks that fire when it ends.

use std::fmt;

use log::debug;
use parking_lot::Mutex;

type CompletionListener = Box<dyn FnOnce() + Send>;

struct ListenerState {
    completed: bool,
    listeners: Vec<CompletionListener>,
}

/// One attempt of the task that processes a single partition.
///
/// Completion listeners run exactly once: when the attempt is marked
/// completed, or when it is dropped without having been marked (the task
/// was aborted or cancelled). A listener added after completion runs
/// immediately on the calling thread.
pub struct TaskAttempt {
    task_attempt_id: i64,
    partition: usize,
    state: Mutex<ListenerState>,
}

impl TaskAttempt {
    pub fn new(task_attempt_id: i64, partition: usize) -> Self {
        Self {
            task_attempt_id,
            partition,
            state: Mutex::new(ListenerState {
                completed: false,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn task_attempt_id(&self) -> i64 {
        self.task_attempt_id
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn add_completion_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.completed {
            drop(state);
            listener();
        } else {
            state.listeners.push(Box::new(listener));
        }
    }

    /// Marks the attempt as finished and runs the registered listeners, most
    /// recently added first. Later calls are no-ops.
    pub fn mark_completed(&self) {
        let listeners = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            std::mem::take(&mut state.listeners)
        };
        debug!(
            "Task attempt {} (partition {}) completed, running {} listener(s)",
            self.task_attempt_id,
            self.partition,
            listeners.len()
        );
        for listener in listeners.into_iter().rev() {
            listener();
        }
    }
}

impl Drop for TaskAttempt {
    fn drop(&mut self) {
        self.mark_completed();
    }
}

impl fmt::Debug for TaskAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskAttempt")
            .field("task_attempt_id", &self.task_attempt_id)
            .field("partition", &self.partition)
            .field("completed", &state.completed)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listeners_run_once_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let task = TaskAttempt::new(7, 0);
        for i in 0..3 {
            let order = Arc::clone(&order);
            task.add_completion_listener(move || order.lock().push(i));
        }
        task.mark_completed();
        task.mark_completed();
        drop(task);
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn dropping_an_unfinished_attempt_fires_listeners() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let task = TaskAttempt::new(1, 3);
            let calls = Arc::clone(&calls);
            task.add_completion_listener(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = TaskAttempt::new(1, 0);
        task.mark_completed();
        let c = Arc::clone(&calls);
        task.add_completion_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(task.is_completed());
    }
}
