//! Per-client ordering of outbound frames.

use std::collections::{HashMap, HashSet, VecDeque};

use super::OutboundFrame;
use crate::protocol::RequestId;

/// Releases frames in the order their requests were issued.
///
/// Frames of the oldest unfinished request pass straight through; frames of
/// younger requests wait until every older request has sent its terminal
/// frame (or been forgotten). Uncorrelated frames and frames for ids that were
/// never issued are released immediately.
#[derive(Debug, Default)]
pub struct OrderedOutbox {
    order: VecDeque<RequestId>,
    buffered: HashMap<RequestId, Vec<OutboundFrame>>,
    finished: HashSet<RequestId>,
}

impl OrderedOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the client issued `id`. Ids already pending are ignored.
    pub fn issue(&mut self, id: RequestId) {
        if !self.order.contains(&id) {
            self.order.push_back(id);
        }
    }

    /// Queue a frame and return everything now ready to go, in order.
    pub fn push(&mut self, frame: OutboundFrame) -> Vec<OutboundFrame> {
        let Some(id) = frame.correlation.clone() else {
            return vec![frame];
        };
        if !self.order.contains(&id) {
            return vec![frame];
        }
        if frame.terminal {
            self.finished.insert(id.clone());
        }
        self.buffered.entry(id).or_default().push(frame);
        self.release()
    }

    /// Drop a request that will never answer (cancelled) and return whatever
    /// that unblocks.
    pub fn forget(&mut self, id: &RequestId) -> Vec<OutboundFrame> {
        self.order.retain(|pending| pending != id);
        self.buffered.remove(id);
        self.finished.remove(id);
        self.release()
    }

    /// Requests issued and not yet finished.
    pub fn pending(&self) -> usize {
        self.order.len()
    }

    fn release(&mut self) -> Vec<OutboundFrame> {
        let mut ready = Vec::new();
        while let Some(head) = self.order.front().cloned() {
            if let Some(frames) = self.buffered.remove(&head) {
                ready.extend(frames);
            }
            if !self.finished.remove(&head) {
                break;
            }
            self.order.pop_front();
        }
        ready
    }
}
