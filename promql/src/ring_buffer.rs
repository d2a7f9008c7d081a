//! Sliding-window buffers for range vector evaluation.
//!
//! A [`RingBuffer`] holds the samples of one series that fall inside the
//! current window. The backing array has a power-of-two capacity and is only
//! grown (through the memory tracker) when it is full; discarding samples from
//! the front just moves the head index.

use crate::error::EvalResult;
use crate::memory::MemoryConsumptionTracker;
use crate::model::{FPoint, HPoint};
use crate::types::{TrackedElement, get_vec, put_vec};

const MIN_CAPACITY: usize = 8;

/// A point with a timestamp, for window arithmetic.
pub trait Timestamped {
    fn t(&self) -> i64;
}

impl Timestamped for FPoint {
    fn t(&self) -> i64 {
        self.t
    }
}

impl Timestamped for HPoint {
    fn t(&self) -> i64 {
        self.t
    }
}

/// Slots `[0, points.len())` are initialised. Live elements are the `size`
/// slots starting at `head`, wrapping at `points.capacity()`. Either the
/// array is full (`len == capacity`) or no live element wraps, so the next
/// free slot is `len` itself.
pub(crate) struct RingBuffer<T> {
    points: Vec<T>,
    head: usize,
    size: usize,
}

impl<T: TrackedElement + Timestamped> RingBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            points: Vec::new(),
            head: 0,
            size: 0,
        }
    }

    fn slot(&self, i: usize) -> usize {
        (self.head + i) & (self.points.capacity() - 1)
    }

    pub(crate) fn get(&self, i: usize) -> Option<&T> {
        (i < self.size).then(|| &self.points[self.slot(i)])
    }

    pub(crate) fn first(&self) -> Option<&T> {
        self.get(0)
    }

    /// Appends a point, which must not be older than the current last point.
    pub(crate) fn append(&mut self, point: T, tracker: &mut MemoryConsumptionTracker) -> EvalResult<()> {
        if self.size == self.points.capacity() {
            self.grow(tracker)?;
        }
        let idx = self.slot(self.size);
        if idx < self.points.len() {
            self.points[idx] = point;
        } else {
            self.points.push(point);
        }
        self.size += 1;
        Ok(())
    }

    fn grow(&mut self, tracker: &mut MemoryConsumptionTracker) -> EvalResult<()> {
        let capacity = (self.points.capacity() * 2).max(MIN_CAPACITY);
        let grown: Vec<T> = get_vec(capacity, tracker)?;
        debug_assert!(grown.capacity().is_power_of_two());
        let mut old = std::mem::take(&mut self.points);
        old.rotate_left(self.head);
        let mut grown = grown;
        grown.extend(old.drain(..self.size));
        put_vec(old, tracker);
        self.points = grown;
        self.head = 0;
        Ok(())
    }

    /// Drops every point with `t <= t_max` from the front.
    pub(crate) fn discard_points_at_or_before(&mut self, t_max: i64) {
        while let Some(first) = self.first() {
            if first.t() > t_max {
                break;
            }
            self.head = self.slot(1);
            self.size -= 1;
        }
        if self.size == 0 {
            self.reset();
        }
    }

    /// Forgets every point but keeps the backing array for reuse.
    pub(crate) fn reset(&mut self) {
        self.points.clear();
        self.head = 0;
        self.size = 0;
    }

    /// A view of the points with `t <= t_max`.
    pub(crate) fn view_until(&self, t_max: i64) -> RingBufferView<'_, T> {
        let mut size = self.size;
        while size > 0 && self.get(size - 1).is_some_and(|p| p.t() > t_max) {
            size -= 1;
        }
        RingBufferView { buffer: self, size }
    }

    pub(crate) fn close(&mut self, tracker: &mut MemoryConsumptionTracker) {
        put_vec(std::mem::take(&mut self.points), tracker);
        self.head = 0;
        self.size = 0;
    }
}

/// A read-only prefix of a [`RingBuffer`].
pub struct RingBufferView<'a, T> {
    buffer: &'a RingBuffer<T>,
    size: usize,
}

impl<T> Clone for RingBufferView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RingBufferView<'_, T> {}

impl<'a, T: TrackedElement + Timestamped + 'a> RingBufferView<'a, T> {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn get(&self, i: usize) -> Option<&'a T> {
        if i < self.size { self.buffer.get(i) } else { None }
    }

    pub fn first(&self) -> Option<&'a T> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&'a T> {
        self.size.checked_sub(1).and_then(|i| self.get(i))
    }

    /// The last two points, oldest first.
    pub fn last_two(&self) -> Option<(&'a T, &'a T)> {
        if self.size < 2 {
            return None;
        }
        Some((self.get(self.size - 2)?, self.get(self.size - 1)?))
    }

    pub fn iter(self) -> impl Iterator<Item = &'a T> + 'a {
        (0..self.size).filter_map(move |i| self.buffer.get(i))
    }
}

impl<'a> RingBufferView<'a, FPoint> {
    pub fn values(self) -> impl Iterator<Item = f64> + 'a {
        self.iter().map(|p| p.f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn points(buffer: &RingBuffer<FPoint>) -> Vec<i64> {
        buffer.view_until(i64::MAX).iter().map(|p| p.t).collect()
    }

    #[test]
    fn should_append_and_discard_across_wraparound() {
        // given
        let mut tracker = MemoryConsumptionTracker::unlimited();
        let mut buffer = RingBuffer::new();
        for t in 0..8 {
            buffer.append(FPoint::new(t, t as f64), &mut tracker).unwrap();
        }

        // when: free the head and wrap new points around the end
        buffer.discard_points_at_or_before(4);
        for t in 8..11 {
            buffer.append(FPoint::new(t, t as f64), &mut tracker).unwrap();
        }

        // then
        assert_eq!(points(&buffer), vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(buffer.first().map(|p| p.t), Some(5));
        assert_eq!(buffer.view_until(i64::MAX).last().map(|p| p.t), Some(10));
        buffer.close(&mut tracker);
        assert_eq!(tracker.current_bytes(), 0);
    }

    #[test]
    fn should_grow_through_tracker_when_full() {
        // given
        let mut tracker = MemoryConsumptionTracker::unlimited();
        let mut buffer = RingBuffer::new();
        for t in 0..6 {
            buffer.append(FPoint::new(t, 0.0), &mut tracker).unwrap();
        }
        buffer.discard_points_at_or_before(2);

        // when: more points than the initial capacity, while wrapped
        for t in 6..20 {
            buffer.append(FPoint::new(t, 0.0), &mut tracker).unwrap();
        }

        // then
        assert_eq!(points(&buffer), (3..20).collect::<Vec<_>>());
        assert_eq!(tracker.current_bytes(), 32 * std::mem::size_of::<FPoint>() as u64);
        buffer.close(&mut tracker);
        assert_eq!(tracker.current_bytes(), 0);
    }

    #[test]
    fn should_fail_growth_over_memory_limit() {
        let mut tracker = MemoryConsumptionTracker::new(8 * std::mem::size_of::<FPoint>() as u64);
        let mut buffer = RingBuffer::new();
        for t in 0..8 {
            buffer.append(FPoint::new(t, 0.0), &mut tracker).unwrap();
        }

        assert!(buffer.append(FPoint::new(8, 0.0), &mut tracker).is_err());
        assert_eq!(buffer.view_until(i64::MAX).len(), 8);
        buffer.close(&mut tracker);
        assert_eq!(tracker.current_bytes(), 0);
    }

    #[test]
    fn should_restrict_view_to_points_at_or_before() {
        let mut tracker = MemoryConsumptionTracker::unlimited();
        let mut buffer = RingBuffer::new();
        for t in [10, 20, 30] {
            buffer.append(FPoint::new(t, 0.0), &mut tracker).unwrap();
        }

        let view = buffer.view_until(25);

        assert_eq!(view.len(), 2);
        assert_eq!(view.last().map(|p| p.t), Some(20));
        assert_eq!(view.last_two().map(|(a, b)| (a.t, b.t)), Some((10, 20)));
        buffer.close(&mut tracker);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append,
        Discard(i64),
    }

    proptest! {
        #[test]
        fn should_behave_like_a_deque(ops in prop::collection::vec(
            prop_oneof![Just(Op::Append), (0i64..5).prop_map(Op::Discard)], 1..200)
        ) {
            let mut tracker = MemoryConsumptionTracker::unlimited();
            let mut buffer = RingBuffer::new();
            let mut model: VecDeque<i64> = VecDeque::new();
            let mut next_t = 0i64;

            for op in ops {
                match op {
                    Op::Append => {
                        buffer.append(FPoint::new(next_t, next_t as f64), &mut tracker).unwrap();
                        model.push_back(next_t);
                        next_t += 1;
                    }
                    Op::Discard(back) => {
                        let cutoff = next_t - 1 - back;
                        buffer.discard_points_at_or_before(cutoff);
                        while model.front().is_some_and(|&t| t <= cutoff) {
                            model.pop_front();
                        }
                    }
                }
                prop_assert_eq!(points(&buffer), model.iter().copied().collect::<Vec<_>>());
            }
            buffer.close(&mut tracker);
            prop_assert_eq!(tracker.current_bytes(), 0);
        }
    }
}
