use crate::{Handle, Queue, ReceivedMessage, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// In-process FIFO queue with real visibility and lane semantics, for tests
/// and local runs. Per lane, only the head message is deliverable, and only
/// while it is visible; explicit dedup ids collapse duplicate sends.
pub struct MemoryQueue {
    state: Mutex<State>,
    default_visibility: Duration,
}

struct State {
    next_id: u64,
    messages: Vec<Message>,
    dedup_seen: HashSet<String>,
}

struct Message {
    id: u64,
    body: String,
    group_id: String,
    visible_at: Instant,
    receive_count: u32,
    handle: Option<Handle>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility(Duration::from_secs(30))
    }

    pub fn with_visibility(default_visibility: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                messages: Vec::new(),
                dedup_seen: HashSet::new(),
            }),
            default_visibility,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive counts observed so far, per message still on the queue.
    pub fn receive_counts(&self) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .map(|m| m.receive_count)
            .collect()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, body: String, group_id: &str, dedup_id: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(dedup_id) = dedup_id {
            if !state.dedup_seen.insert(dedup_id.to_string()) {
                return Ok(()); // Collapsed by the dedup window.
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state.messages.push(Message {
            id,
            body,
            group_id: group_id.to_string(),
            visible_at: Instant::now(),
            receive_count: 0,
            handle: None,
        });
        Ok(())
    }

    async fn receive(&self, max: usize, _wait: Duration) -> Result<Vec<ReceivedMessage>> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        // The deliverable set: per group, the oldest message, iff visible.
        let mut group_heads: HashMap<String, usize> = HashMap::new();
        for (index, message) in state.messages.iter().enumerate() {
            group_heads.entry(message.group_id.clone()).or_insert(index);
        }
        let mut head_indices: Vec<usize> = group_heads.into_values().collect();
        head_indices.sort();

        let mut received = Vec::new();
        for index in head_indices {
            if received.len() == max {
                break;
            }
            let visibility = self.default_visibility;
            let message = &mut state.messages[index];
            if message.visible_at > now {
                continue;
            }
            message.visible_at = now + visibility;
            message.receive_count += 1;
            let handle = Handle(format!("handle-{}-{}", message.id, message.receive_count));
            message.handle = Some(handle.clone());
            received.push(ReceivedMessage {
                body: message.body.clone(),
                handle,
            });
        }
        Ok(received)
    }

    async fn delete(&self, handle: &Handle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .retain(|m| m.handle.as_ref() != Some(handle));
        Ok(())
    }

    async fn change_visibility(&self, handle: &Handle, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state
            .messages
            .iter_mut()
            .find(|m| m.handle.as_ref() == Some(handle))
        {
            message.visible_at = Instant::now() + timeout;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{lanes, SalesforceObject};

    #[tokio::test(start_paused = true)]
    async fn per_lane_fifo_ordering() {
        let queue = MemoryQueue::new();
        queue.send("a1".into(), "lane-a", None).await.unwrap();
        queue.send("a2".into(), "lane-a", None).await.unwrap();
        queue.send("b1".into(), "lane-b", None).await.unwrap();

        // One receive yields at most one message per lane: the heads.
        let batch = queue.receive(10, Duration::ZERO).await.unwrap();
        let bodies: Vec<_> = batch.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["a1", "b1"]);

        // a2 is blocked until a1 is acknowledged.
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
        queue.delete(&batch[0].handle).await.unwrap();

        let batch = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch[0].body, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_collapses_duplicate_sends() {
        let queue = MemoryQueue::new();
        let lane = lanes::salesforce_cdc_lane("t1", SalesforceObject::Account, "001");
        let dedup = lanes::salesforce_cdc_dedup_id("t1", "Account_001_9");

        // Two HA listener replicas send the same commit.
        queue.send("evt".into(), &lane, Some(&dedup)).await.unwrap();
        queue.send("evt".into(), &lane, Some(&dedup)).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_extension_delays_redelivery() {
        let queue = MemoryQueue::with_visibility(Duration::from_secs(30));
        queue.send("job".into(), "lane", None).await.unwrap();

        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        queue
            .change_visibility(&batch[0].handle, Duration::from_secs(45))
            .await
            .unwrap();

        // Not redelivered before the extended window elapses.
        tokio::time::sleep(Duration::from_secs(44)).await;
        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(batch[0].body, "job");
        assert_eq!(queue.receive_counts(), vec![2]);
    }
}
