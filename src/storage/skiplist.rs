//! Arena Skip List
//!
//! The ordered index behind sorted sets. Nodes live in a `Vec` and link to
//! each other by index; `NIL` stands for "no node" and slot 0 is the
//! header. Freed slots are recycled through a free list.
//!
//! ```text
//!   level 2   H ───────────────(3)──────────────► c ──────► NIL
//!   level 1   H ──(1)──► a ────(2)────► b ─(1)──► c ──────► NIL
//!   level 0   H ──(1)──► a ─(1)──► x ─(1)──► b ─(1)──► c ─► NIL
//!                        ◄─────────◄─────────◄─────────◄  backward
//! ```
//!
//! Every forward link records its span: the number of level-0 steps it
//! skips. Summing spans along a descent gives a node's 1-based rank.
//! Nodes are ordered by `(score asc, member asc)`.

use bytes::Bytes;
use rand::Rng;
use std::cmp::Ordering;

/// Maximum node height.
pub const MAX_LEVEL: usize = 16;

/// Probability of promoting a node one more level.
const LEVEL_PROBABILITY: f64 = 0.25;

const NIL: usize = usize::MAX;
const HEAD: usize = 0;

/// A `(member, score)` pair as stored in the list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub member: Bytes,
    pub score: f64,
}

impl Element {
    pub fn new(member: impl Into<Bytes>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// Total order used by the list.
#[inline]
fn compare(score: f64, member: &[u8], other_score: f64, other_member: &[u8]) -> Ordering {
    score
        .partial_cmp(&other_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| member.cmp(other_member))
}

/// One end of a score interval, as in `ZRANGEBYSCORE key (1 +inf`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBorder {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBorder {
    pub const NEG_INF: ScoreBorder = ScoreBorder {
        value: f64::NEG_INFINITY,
        exclusive: false,
    };

    pub const POS_INF: ScoreBorder = ScoreBorder {
        value: f64::INFINITY,
        exclusive: false,
    };

    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            exclusive: false,
        }
    }

    pub fn exclusive(value: f64) -> Self {
        Self {
            value,
            exclusive: true,
        }
    }

    /// Parses `-inf`, `+inf`, `inf`, `<float>` or `(<float>`.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let (exclusive, number) = match text.strip_prefix('(') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let value = match number.to_ascii_lowercase().as_str() {
            "-inf" => f64::NEG_INFINITY,
            "+inf" | "inf" => f64::INFINITY,
            other => other.parse::<f64>().ok().filter(|v| !v.is_nan())?,
        };
        Some(Self { value, exclusive })
    }

    /// True if `score` lies on the allowed side of this border used as a
    /// lower bound.
    #[inline]
    pub fn admits_above(&self, score: f64) -> bool {
        if self.exclusive {
            score > self.value
        } else {
            score >= self.value
        }
    }

    /// True if `score` lies on the allowed side of this border used as an
    /// upper bound.
    #[inline]
    pub fn admits_below(&self, score: f64) -> bool {
        if self.exclusive {
            score < self.value
        } else {
            score <= self.value
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Level {
    forward: usize,
    span: usize,
}

#[derive(Debug)]
struct Node {
    element: Element,
    backward: usize,
    levels: Vec<Level>,
}

/// Skip list over `(score, member)` pairs.
#[derive(Debug)]
pub struct SkipList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    tail: usize,
    length: usize,
    level: usize,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    pub fn new() -> Self {
        let header = Node {
            element: Element::default(),
            backward: NIL,
            levels: vec![Level { forward: NIL, span: 0 }; MAX_LEVEL],
        };
        Self {
            nodes: vec![header],
            free: Vec::new(),
            tail: NIL,
            length: 0,
            level: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn random_level() -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.gen_bool(LEVEL_PROBABILITY) {
            level += 1;
        }
        level
    }

    #[inline]
    fn forward(&self, node: usize, level: usize) -> usize {
        self.nodes[node].levels[level].forward
    }

    #[inline]
    fn span(&self, node: usize, level: usize) -> usize {
        self.nodes[node].levels[level].span
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> Element {
        let node = &mut self.nodes[slot];
        node.levels = Vec::new();
        node.backward = NIL;
        self.free.push(slot);
        std::mem::take(&mut node.element)
    }

    /// True if the node at `next` sorts strictly before `(score, member)`.
    #[inline]
    fn precedes(&self, next: usize, score: f64, member: &[u8]) -> bool {
        let element = &self.nodes[next].element;
        compare(element.score, &element.member, score, member) == Ordering::Less
    }

    /// Inserts a new element. The caller guarantees `member` is not present.
    pub fn insert(&mut self, member: Bytes, score: f64) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];

        let mut x = HEAD;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let next = self.forward(x, i);
                if next != NIL && self.precedes(next, score, &member) {
                    rank[i] += self.span(x, i);
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let level = Self::random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = HEAD;
                self.nodes[HEAD].levels[i].span = self.length;
            }
            self.level = level;
        }

        let node = self.alloc(Node {
            element: Element { member, score },
            backward: NIL,
            levels: vec![Level { forward: NIL, span: 0 }; level],
        });

        for i in 0..level {
            let prev = update[i];
            let skipped = rank[0] - rank[i];
            self.nodes[node].levels[i] = Level {
                forward: self.forward(prev, i),
                span: self.span(prev, i) - skipped,
            };
            self.nodes[prev].levels[i] = Level {
                forward: node,
                span: skipped + 1,
            };
        }
        for i in level..self.level {
            self.nodes[update[i]].levels[i].span += 1;
        }

        self.nodes[node].backward = if update[0] == HEAD { NIL } else { update[0] };
        let next = self.forward(node, 0);
        if next != NIL {
            self.nodes[next].backward = node;
        } else {
            self.tail = node;
        }
        self.length += 1;
    }

    /// Unlinks `node`, given its predecessor at every level.
    fn unlink(&mut self, node: usize, update: &[usize; MAX_LEVEL]) -> Element {
        for i in 0..self.level {
            let prev = update[i];
            if self.forward(prev, i) == node {
                let Level { forward, span } = self.nodes[node].levels[i];
                self.nodes[prev].levels[i] = Level {
                    forward,
                    span: self.span(prev, i) + span - 1,
                };
            } else {
                self.nodes[prev].levels[i].span -= 1;
            }
        }

        let next = self.forward(node, 0);
        let backward = self.nodes[node].backward;
        if next != NIL {
            self.nodes[next].backward = backward;
        } else {
            self.tail = backward;
        }
        while self.level > 1 && self.forward(HEAD, self.level - 1) == NIL {
            self.level -= 1;
        }
        self.length -= 1;
        self.release(node)
    }

    /// Removes `(member, score)`. Returns false if it was not present.
    pub fn remove(&mut self, member: &[u8], score: f64) -> bool {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let next = self.forward(x, i);
                if next != NIL && self.precedes(next, score, member) {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let candidate = self.forward(x, 0);
        if candidate == NIL {
            return false;
        }
        let element = &self.nodes[candidate].element;
        if element.score != score || element.member.as_ref() != member {
            return false;
        }
        self.unlink(candidate, &update);
        true
    }

    /// 1-based rank of `(member, score)`, or 0 if absent.
    pub fn get_rank(&self, member: &[u8], score: f64) -> usize {
        let mut rank = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let next = self.forward(x, i);
                if next == NIL {
                    break;
                }
                let element = &self.nodes[next].element;
                if compare(element.score, &element.member, score, member) == Ordering::Greater {
                    break;
                }
                rank += self.span(x, i);
                x = next;
            }
            if x != HEAD && self.nodes[x].element.member.as_ref() == member {
                return rank;
            }
        }
        0
    }

    /// Node at 1-based `rank`.
    fn node_by_rank(&self, rank: usize) -> Option<usize> {
        if rank == 0 || rank > self.length {
            return None;
        }
        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let next = self.forward(x, i);
                if next != NIL && traversed + self.span(x, i) <= rank {
                    traversed += self.span(x, i);
                    x = next;
                } else {
                    break;
                }
            }
            if traversed == rank {
                return Some(x);
            }
        }
        None
    }

    /// Element at 1-based `rank`.
    pub fn get_by_rank(&self, rank: usize) -> Option<&Element> {
        self.node_by_rank(rank).map(|node| &self.nodes[node].element)
    }

    /// Returns true if some element lies within `[min, max]`.
    pub fn has_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> bool {
        if min.value > max.value || (min.value == max.value && (min.exclusive || max.exclusive)) {
            return false;
        }
        if self.tail == NIL || !min.admits_above(self.nodes[self.tail].element.score) {
            return false;
        }
        let first = self.forward(HEAD, 0);
        first != NIL && max.admits_below(self.nodes[first].element.score)
    }

    fn first_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let next = self.forward(x, i);
                if next != NIL && !min.admits_above(self.nodes[next].element.score) {
                    x = next;
                } else {
                    break;
                }
            }
        }
        let first = self.forward(x, 0);
        (first != NIL && max.admits_below(self.nodes[first].element.score)).then_some(first)
    }

    fn last_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let next = self.forward(x, i);
                if next != NIL && max.admits_below(self.nodes[next].element.score) {
                    x = next;
                } else {
                    break;
                }
            }
        }
        (x != HEAD && min.admits_above(self.nodes[x].element.score)).then_some(x)
    }

    /// Walks from `start` in the given direction, yielding up to `limit`
    /// elements while `keep` accepts them.
    fn walk(
        &self,
        start: Option<usize>,
        desc: bool,
        limit: usize,
        keep: impl Fn(&Element) -> bool,
    ) -> Vec<Element> {
        let mut out = Vec::new();
        let mut x = start.unwrap_or(NIL);
        while x != NIL && out.len() < limit {
            let node = &self.nodes[x];
            if !keep(&node.element) {
                break;
            }
            out.push(node.element.clone());
            x = if desc { node.backward } else { node.levels[0].forward };
        }
        out
    }

    /// Elements with 0-based ranks in `[start, stop]` inclusive.
    ///
    /// With `desc`, rank 0 is the highest score.
    pub fn range_by_rank(&self, start: usize, stop: usize, desc: bool) -> Vec<Element> {
        if start > stop || start >= self.length {
            return Vec::new();
        }
        let stop = stop.min(self.length - 1);
        let first_rank = if desc { self.length - start } else { start + 1 };
        self.walk(self.node_by_rank(first_rank), desc, stop - start + 1, |_| true)
    }

    /// Elements with scores inside `[min, max]`, skipping `offset` and
    /// returning at most `limit` (`None` for no limit).
    pub fn range_by_score(
        &self,
        min: &ScoreBorder,
        max: &ScoreBorder,
        offset: usize,
        limit: Option<usize>,
        desc: bool,
    ) -> Vec<Element> {
        let start = if desc {
            self.last_in_range(min, max)
        } else {
            self.first_in_range(min, max)
        };
        let mut x = start.unwrap_or(NIL);
        for _ in 0..offset {
            if x == NIL {
                return Vec::new();
            }
            let node = &self.nodes[x];
            x = if desc { node.backward } else { node.levels[0].forward };
        }
        let in_range = |element: &Element| {
            if desc {
                min.admits_above(element.score)
            } else {
                max.admits_below(element.score)
            }
        };
        self.walk(
            (x != NIL).then_some(x),
            desc,
            limit.unwrap_or(usize::MAX),
            in_range,
        )
    }

    /// Number of elements with scores inside `[min, max]`.
    pub fn count(&self, min: &ScoreBorder, max: &ScoreBorder) -> usize {
        let first = match self.first_in_range(min, max) {
            Some(node) => node,
            None => return 0,
        };
        let last = match self.last_in_range(min, max) {
            Some(node) => node,
            None => return 0,
        };
        let first_rank = self.rank_of_node(first);
        let last_rank = self.rank_of_node(last);
        last_rank + 1 - first_rank
    }

    fn rank_of_node(&self, node: usize) -> usize {
        let element = &self.nodes[node].element;
        self.get_rank(&element.member, element.score)
    }

    /// Removes elements with scores in `[min, max]`, at most `limit` of them.
    pub fn remove_range_by_score(
        &mut self,
        min: &ScoreBorder,
        max: &ScoreBorder,
        limit: Option<usize>,
    ) -> Vec<Element> {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let next = self.forward(x, i);
                if next != NIL && !min.admits_above(self.nodes[next].element.score) {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let limit = limit.unwrap_or(usize::MAX);
        let mut removed = Vec::new();
        let mut x = self.forward(x, 0);
        while x != NIL && removed.len() < limit && max.admits_below(self.nodes[x].element.score) {
            let next = self.forward(x, 0);
            removed.push(self.unlink(x, &update));
            x = next;
        }
        removed
    }

    /// Removes elements with 1-based ranks in `[start, stop)`.
    pub fn remove_range_by_rank(&mut self, start: usize, stop: usize) -> Vec<Element> {
        let mut update = [HEAD; MAX_LEVEL];
        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let next = self.forward(x, i);
                if next != NIL && traversed + self.span(x, i) < start {
                    traversed += self.span(x, i);
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        traversed += 1;
        let mut removed = Vec::new();
        let mut x = self.forward(x, 0);
        while x != NIL && traversed < stop {
            let next = self.forward(x, 0);
            removed.push(self.unlink(x, &update));
            traversed += 1;
            x = next;
        }
        removed
    }

    /// Iterates in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            next: self.forward(HEAD, 0),
        }
    }

    /// Checks the span invariant: the level-0 distance to every node equals
    /// the spans summed along each level.
    #[cfg(test)]
    fn check_spans(&self) {
        for i in 0..self.level {
            let mut position = 0;
            let mut x = HEAD;
            loop {
                let next = self.forward(x, i);
                if next == NIL {
                    break;
                }
                position += self.span(x, i);
                assert_eq!(
                    self.get_rank(&self.nodes[next].element.member, self.nodes[next].element.score),
                    position
                );
                x = next;
            }
        }
    }
}

/// Ascending iterator over a [`SkipList`].
pub struct Iter<'a> {
    list: &'a SkipList,
    next: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let node = &self.list.nodes[self.next];
        self.next = node.levels[0].forward;
        Some(&node.element)
    }
}
