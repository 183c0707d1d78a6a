// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory queue of wake-ups ordered by wall clock time.
//!
//! The queue itself is not durable. Its owner re-registers every pending timer from storage
//! when it starts.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use waypoint_types::time::MillisSinceEpoch;

#[derive(Debug)]
pub struct Timer<T> {
    wake_up_time: MillisSinceEpoch,
    payload: T,
}

impl<T> Timer<T> {
    pub fn wake_up_time(&self) -> MillisSinceEpoch {
        self.wake_up_time
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_inner(self) -> T {
        self.payload
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wake_up_time.cmp(&other.wake_up_time)
    }
}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Timer<T> {}

#[derive(Debug)]
pub struct TimerQueue<T>(BinaryHeap<Reverse<Timer<T>>>);

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self(BinaryHeap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn sleep_until(&mut self, wake_up_time: MillisSinceEpoch, payload: T) {
        self.0.push(Reverse(Timer {
            wake_up_time,
            payload,
        }))
    }

    /// Wake-up time of the earliest timer.
    pub fn next_wake_up_time(&self) -> Option<MillisSinceEpoch> {
        self.0.peek().map(|Reverse(timer)| timer.wake_up_time)
    }

    /// Drops all the timers whose payload doesn't satisfy `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.0.retain(|Reverse(timer)| keep(&timer.payload));
    }

    /// Resolves with the earliest timer once it is due. Pending forever on an empty queue,
    /// so it can sit in a `select!` next to other event sources.
    ///
    /// Cancel safe: a timer is only removed from the queue when it is returned.
    pub async fn await_timer(&mut self) -> Timer<T> {
        loop {
            let Some(wake_up_time) = self.next_wake_up_time() else {
                return futures::future::pending().await;
            };

            let remaining = wake_up_time.remaining();
            if !remaining.is_zero() {
                tokio::time::sleep(remaining).await;
            }

            if let Some(Reverse(timer)) = self.0.pop() {
                return timer;
            }
        }
    }
}

impl<T> FromIterator<(MillisSinceEpoch, T)> for TimerQueue<T> {
    fn from_iter<IT: IntoIterator<Item = (MillisSinceEpoch, T)>>(iter: IT) -> Self {
        let mut tq = TimerQueue::new();
        for (time, payload) in iter {
            tq.sleep_until(time, payload);
        }
        tq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_simple_timer() {
        let mut timer_queue = TimerQueue::new();

        let now = Instant::now();

        let sleep_duration = Duration::from_millis(5);
        timer_queue.sleep_until(MillisSinceEpoch::after(sleep_duration), 1);

        let result = timer_queue.await_timer().await;

        assert_eq!(result.into_inner(), 1);
        // millisecond resolution of the wake-up time
        assert!(now.elapsed() >= sleep_duration - Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_timer_ordering() {
        let mut timer_queue: TimerQueue<i32> = [
            (MillisSinceEpoch::after(Duration::from_secs(3600)), 1),
            (MillisSinceEpoch::after(Duration::from_millis(1)), 2),
        ]
        .into_iter()
        .collect();

        let result = timer_queue.await_timer().await;

        assert_eq!(result.into_inner(), 2);
        assert_eq!(timer_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_past_timers_fire_in_order() {
        let mut timer_queue: TimerQueue<i32> = [
            (MillisSinceEpoch::new(2), 2),
            (MillisSinceEpoch::new(1), 1),
        ]
        .into_iter()
        .collect();

        assert_eq!(timer_queue.await_timer().await.into_inner(), 1);
        assert_eq!(timer_queue.await_timer().await.into_inner(), 2);
        assert!(timer_queue.is_empty());
    }

    #[tokio::test]
    async fn test_retain_drops_timers() {
        let mut timer_queue: TimerQueue<i32> = [
            (MillisSinceEpoch::new(1), 1),
            (MillisSinceEpoch::new(2), 2),
            (MillisSinceEpoch::new(3), 3),
        ]
        .into_iter()
        .collect();

        timer_queue.retain(|payload| *payload != 1);

        assert_eq!(timer_queue.next_wake_up_time(), Some(MillisSinceEpoch::new(2)));
        assert_eq!(timer_queue.await_timer().await.into_inner(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue_is_pending() {
        let mut timer_queue: TimerQueue<i32> = TimerQueue::new();

        let result =
            tokio::time::timeout(Duration::from_millis(10), timer_queue.await_timer()).await;

        assert!(result.is_err());
    }
}
