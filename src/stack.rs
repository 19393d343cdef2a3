//! Stack module: the ordered container the decompiler pops operands from.
//!
//! Items are always pushed at the back. A LIFO stack pops from the back like an
//! ordinary operand stack; a FIFO stack pops from the front, which is how the
//! branches of a conditional are consumed in source order.

use std::collections::VecDeque;
use std::fmt;

/// Which end `pop` and `peek` take from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discipline {
    #[default]
    Lifo,
    Fifo,
}

#[derive(Clone, PartialEq)]
pub struct InstructionStack<T> {
    items: VecDeque<T>,
    discipline: Discipline,
}

impl<T: Clone> InstructionStack<T> {
    pub fn new(discipline: Discipline) -> Self {
        Self { items: VecDeque::new(), discipline }
    }

    pub fn lifo() -> Self {
        Self::new(Discipline::Lifo)
    }

    pub fn fifo() -> Self {
        Self::new(Discipline::Fifo)
    }

    pub fn from_items(discipline: Discipline, items: impl IntoIterator<Item = T>) -> Self {
        Self { items: items.into_iter().collect(), discipline }
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        match self.discipline {
            Discipline::Lifo => self.items.pop_back(),
            Discipline::Fifo => self.items.pop_front(),
        }
    }

    /// The item `pop` would return next.
    pub fn peek(&self) -> Option<&T> {
        match self.discipline {
            Discipline::Lifo => self.items.back(),
            Discipline::Fifo => self.items.front(),
        }
    }

    /// An independent snapshot; later pushes or pops on either side do not affect the other.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn reverse(&mut self) {
        self.items.make_contiguous().reverse();
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in push order, regardless of discipline.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.items.iter()
    }

    /// Pushes every item of `other` in its push order.
    pub fn append(&mut self, other: Self) {
        self.items.extend(other.items);
    }
}

impl<T: fmt::Debug> fmt::Debug for InstructionStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionStack")
            .field("discipline", &self.discipline)
            .field("items", &self.items)
            .finish()
    }
}
