//! Five-lane probabilistic priority queue.
//!
//! Lane 0 is the most important. After every pop a counter `i` advances and
//! the next lane is the least important non-empty lane whose period divides
//! `i`. With every lane loaded this yields roughly 50/37.5/9.4/2.3/0.8 percent
//! of pops for lanes 0 through 4, and every lane drains eventually.
//!
//! Not synchronized: the owner serializes access.

use std::collections::VecDeque;

use crate::error::{RejectError, Result};

pub const LANES: usize = 5;

/// Lane `l` is eligible when `i % LANE_PERIOD[l] == 0`.
const LANE_PERIOD: [u64; LANES] = [1, 2, 8, 32, 128];

#[derive(Debug)]
pub struct MultiPriorityQueue<T> {
    lanes: [VecDeque<T>; LANES],
    current: usize,
    len: usize,
    i: u64,
}

impl<T> Default for MultiPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MultiPriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: Default::default(),
            current: 0,
            len: 0,
            i: 0,
        }
    }

    /// Push `v` at `pri` (0..=4).
    pub fn push(&mut self, v: T, pri: u8) -> Result<()> {
        let lane = pri as usize;
        if lane >= LANES {
            return Err(RejectError::Priority(pri).into());
        }
        self.lanes[lane].push_back(v);
        if self.len == 0 {
            self.i = 0;
            self.current = lane;
        }
        self.len += 1;
        Ok(())
    }

    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.lanes[self.current].front()
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let v = self.lanes[self.current].pop_front()?;
        self.len -= 1;
        if self.len != 0 {
            self.advance();
        }
        Some(v)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove every item, most important lane first.
    pub fn drain(&mut self) -> Vec<T> {
        let all: Vec<T> = self.lanes.iter_mut().flat_map(|l| l.drain(..)).collect();
        self.len = 0;
        self.i = 0;
        self.current = 0;
        all
    }

    // Terminates because some lane is non-empty and lane periods are finite.
    fn advance(&mut self) {
        loop {
            self.i = self.i.wrapping_add(1);
            for lane in (0..LANES).rev() {
                if !self.lanes[lane].is_empty() && self.i % LANE_PERIOD[lane] == 0 {
                    self.current = lane;
                    return;
                }
            }
        }
    }
}
