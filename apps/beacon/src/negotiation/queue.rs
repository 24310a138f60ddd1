use std::collections::VecDeque;

use signal_transport::Candidate;

/// FIFO buffer for locally discovered candidates that cannot be sent yet
/// (no peer attached, or a send failed). Discovery order is relay order.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    items: VecDeque<Candidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.items.push_back(candidate);
    }

    /// Put a candidate back at the head after a failed send so the next
    /// flush retries it before anything younger.
    pub fn requeue(&mut self, candidate: Candidate) {
        self.items.push_front(candidate);
    }

    pub fn pop(&mut self) -> Option<Candidate> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tag: &str) -> Candidate {
        Candidate::new(format!("candidate:{tag}"))
    }

    #[test]
    fn drains_in_discovery_order() {
        let mut queue = CandidateQueue::new();
        queue.push(candidate("a"));
        queue.push(candidate("b"));
        queue.push(candidate("c"));

        let drained: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|c| c.candidate)
            .collect();
        assert_eq!(drained, vec!["candidate:a", "candidate:b", "candidate:c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_puts_candidate_back_at_the_head() {
        let mut queue = CandidateQueue::new();
        queue.push(candidate("a"));
        queue.push(candidate("b"));

        let first = queue.pop().unwrap();
        queue.requeue(first);
        assert_eq!(queue.pop().unwrap().candidate, "candidate:a");
        assert_eq!(queue.pop().unwrap().candidate, "candidate:b");
    }

    #[test]
    fn clear_empties_the_queue() {
        let mut queue = CandidateQueue::new();
        queue.push(candidate("a"));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}
