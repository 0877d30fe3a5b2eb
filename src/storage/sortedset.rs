//! Sorted Set Value
//!
//! A member -> score map kept in lockstep with a [`SkipList`] ordered by
//! `(score, member)`. The map answers point lookups; the list answers rank
//! and range queries. Every mutation updates both sides before returning.

use super::skiplist::{Element, ScoreBorder, SkipList};
use bytes::Bytes;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    list: SkipList,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Sets the score of `member`. Returns true only if the member is new.
    pub fn add(&mut self, member: Bytes, score: f64) -> bool {
        match self.scores.get_mut(&member) {
            Some(current) => {
                if *current != score {
                    self.list.remove(&member, *current);
                    *current = score;
                    self.list.insert(member, score);
                }
                false
            }
            None => {
                self.scores.insert(member.clone(), score);
                self.list.insert(member, score);
                true
            }
        }
    }

    /// Adds `delta` to the member's score (0 if absent), returning the new
    /// score.
    pub fn incr_by(&mut self, member: Bytes, delta: f64) -> f64 {
        let score = self.scores.get(&member).copied().unwrap_or(0.0) + delta;
        self.add(member, score);
        score
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.list.remove(member, score);
                true
            }
            None => false,
        }
    }

    /// 0-based rank of `member`; with `desc`, rank 0 is the highest score.
    pub fn rank(&self, member: &[u8], desc: bool) -> Option<usize> {
        let score = self.scores.get(member)?;
        let rank = self.list.get_rank(member, *score);
        if rank == 0 {
            return None;
        }
        Some(if desc { self.len() - rank } else { rank - 1 })
    }

    /// Element at 0-based `rank`.
    pub fn get_by_rank(&self, rank: usize, desc: bool) -> Option<&Element> {
        if rank >= self.len() {
            return None;
        }
        let position = if desc { self.len() - rank } else { rank + 1 };
        self.list.get_by_rank(position)
    }

    /// Elements with 0-based ranks `start..=stop`.
    pub fn range_by_rank(&self, start: usize, stop: usize, desc: bool) -> Vec<Element> {
        self.list.range_by_rank(start, stop, desc)
    }

    pub fn range_by_score(
        &self,
        min: &ScoreBorder,
        max: &ScoreBorder,
        offset: usize,
        limit: Option<usize>,
        desc: bool,
    ) -> Vec<Element> {
        self.list.range_by_score(min, max, offset, limit, desc)
    }

    pub fn count(&self, min: &ScoreBorder, max: &ScoreBorder) -> usize {
        self.list.count(min, max)
    }

    /// Removes elements with 0-based ranks `start..=stop`.
    pub fn remove_range_by_rank(&mut self, start: usize, stop: usize) -> usize {
        if start > stop || start >= self.len() {
            return 0;
        }
        let removed = self.list.remove_range_by_rank(start + 1, stop + 2);
        for element in &removed {
            self.scores.remove(&element.member);
        }
        removed.len()
    }

    pub fn remove_range_by_score(&mut self, min: &ScoreBorder, max: &ScoreBorder) -> usize {
        let removed = self.list.remove_range_by_score(min, max, None);
        for element in &removed {
            self.scores.remove(&element.member);
        }
        removed.len()
    }

    /// Ascending `(member, score)` iteration.
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.list.iter()
    }
}

impl Clone for SortedSet {
    fn clone(&self) -> Self {
        let mut copy = SortedSet::new();
        for element in self.iter() {
            copy.add(element.member.clone(), element.score);
        }
        copy
    }
}
