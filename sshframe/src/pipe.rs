// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An internal pub/sub bus. `Protocol` owns four named topics
//! (`network_channels`, `network_outbounds`, `network_open`,
//! `network_close`) that the acceptor, channel managers, and proxy broker
//! publish into and subscribe from, per spec.md §2's data-flow diagram.
//! Replaces the source's `flux` push sockets (spec §9's "Pipe / push
//! socket" redesign note): a guarded subscriber list, `publish` iterates
//! and sends, `clear_listeners` swaps the list out atomically.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// A single-producer-many-consumer topic. Values are cloned to every live
/// subscriber; subscribers that have dropped their receiver are pruned on
/// the next publish.
pub struct Topic<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Topic<T> {
    pub fn new() -> Self {
        Topic { subscribers: Mutex::new(Vec::new()) }
    }

    /// Registers a new subscriber, returning the receiving half of an
    /// unbounded channel fed by `publish`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("topic lock poisoned").push(tx);
        rx
    }

    /// Publishes `value` to every live subscriber, in registration order,
    /// pruning any whose receiver has been dropped.
    pub fn publish(&self, value: T) {
        let mut subscribers = self.subscribers.lock().expect("topic lock poisoned");
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Atomically replaces the subscriber list with an empty one,
    /// detaching every current subscriber. Used when a protocol switches
    /// from local to proxy mode and needs to hand the topic over to a
    /// different channel manager.
    pub fn clear_listeners(&self) {
        *self.subscribers.lock().expect("topic lock poisoned") = Vec::new();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("topic lock poisoned").len()
    }
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[tokio::test]
    #[timeout(5000)]
    async fn publish_reaches_all_subscribers_in_order() {
        let topic: Topic<u32> = Topic::new();
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();

        topic.publish(1);
        topic.publish(2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn clear_listeners_detaches_existing_subscribers() {
        let topic: Topic<u32> = Topic::new();
        let mut rx = topic.subscribe();
        topic.clear_listeners();
        topic.publish(7);

        assert_eq!(rx.recv().await, None);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let topic: Topic<u32> = Topic::new();
        let rx = topic.subscribe();
        drop(rx);
        assert_eq!(topic.subscriber_count(), 1);
        topic.publish(1);
        assert_eq!(topic.subscriber_count(), 0);
    }
}
