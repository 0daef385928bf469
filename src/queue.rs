use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::model::{JudgeRequest, SubmissionId};
use crate::scheduler::JudgeState;

/// A submission waiting for, or held by, a worker
pub(crate) struct JudgeTicket {
    pub request: JudgeRequest,
    pub state: Arc<watch::Sender<JudgeState>>,
    pub cancel: CancellationToken,
}

/// FIFO of submissions waiting for a free worker
pub(crate) struct JobQueue {
    queue: Mutex<VecDeque<JudgeTicket>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, ticket: JudgeTicket) {
        self.queue.lock().push_back(ticket);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> JudgeTicket {
        loop {
            if let Some(ticket) = self.queue.lock().pop_front() {
                return ticket;
            }
            self.notify.notified().await;
        }
    }

    /// Takes a ticket out of the queue before any worker picked it up
    pub fn remove(&self, id: SubmissionId) -> Option<JudgeTicket> {
        let mut queue = self.queue.lock();
        let position = queue
            .iter()
            .position(|t| t.request.submission_id == id)?;
        queue.remove(position)
    }

    pub fn drain(&self) -> Vec<JudgeTicket> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
