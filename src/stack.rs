//! The execution stack.
//!
//! One buffer of values backs every frame. The active frame is the window
//! `[base, top)`; non-negative indices are relative to `base` and negative
//! indices count back from `top`. Moving the base never copies the suffix.
//!
//! Invariant: `base <= top <= capacity`.

use std::ops::Range;

use crate::error::{ErrorCode, OpResult};
use crate::value::Value;

#[derive(Debug)]
pub struct ExecutionStack {
    values: Vec<Value>,
    base: usize,
    capacity: usize,
    fixed: bool,
}

impl ExecutionStack {
    /// A stack that grows past `capacity` on demand.
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            base: 0,
            capacity,
            fixed: false,
        }
    }

    /// A stack that fails with "stack is full" past `capacity`.
    pub fn fixed(capacity: usize) -> Self {
        Self {
            fixed: true,
            ..Self::new(capacity)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn push(&mut self, value: Value) -> OpResult<()> {
        if self.values.len() == self.capacity {
            if self.fixed {
                return Err(ErrorCode::StackError);
            }
            self.capacity = (self.capacity * 2).max(8);
            self.values.reserve(self.capacity - self.values.len());
        }
        self.values.push(value);
        Ok(())
    }

    pub fn push_null(&mut self, count: usize) -> OpResult<()> {
        for _ in 0..count {
            self.push(Value::Null)?;
        }
        Ok(())
    }

    /// Pop the top value. Popping below the frame base is rejected.
    pub fn pop(&mut self) -> OpResult<Value> {
        if self.values.len() <= self.base {
            return Err(ErrorCode::StackError);
        }
        self.values.pop().ok_or(ErrorCode::StackError)
    }

    /// Pop `count` values, releasing them.
    pub fn pop_n(&mut self, count: usize) -> OpResult<()> {
        if self.stack_size() < count {
            return Err(ErrorCode::StackError);
        }
        let new_top = self.values.len() - count;
        self.values.truncate(new_top);
        Ok(())
    }

    /// Shrink the stack to an absolute top. The base follows if needed.
    pub fn truncate(&mut self, absolute_top: usize) {
        self.values.truncate(absolute_top);
        self.base = self.base.min(self.values.len());
    }

    pub fn get_stack_base(&self) -> usize {
        self.base
    }

    /// Move the frame window. `base` must not exceed the current top.
    pub fn set_stack_base(&mut self, base: usize) -> OpResult<()> {
        if base > self.values.len() {
            return Err(ErrorCode::StackError);
        }
        self.base = base;
        Ok(())
    }

    /// Move the base back to a caller's window, clamped to the current top.
    pub fn restore_base(&mut self, base: usize) {
        self.base = base.min(self.values.len());
    }

    pub fn get_absolute_top(&self) -> usize {
        self.values.len()
    }

    /// Values in the current frame: `top - base`.
    pub fn stack_size(&self) -> usize {
        self.values.len() - self.base
    }

    fn resolve(&self, index: isize) -> Option<usize> {
        if index >= 0 {
            let i = self.base + index as usize;
            (i < self.values.len()).then_some(i)
        } else {
            let back = index.unsigned_abs();
            (back <= self.stack_size()).then(|| self.values.len() - back)
        }
    }

    /// Frame-relative access; `-1` is the most recent push.
    pub fn get(&self, index: isize) -> OpResult<&Value> {
        self.resolve(index)
            .map(|i| &self.values[i])
            .ok_or(ErrorCode::OutOfBounds)
    }

    pub fn get_mut(&mut self, index: isize) -> OpResult<&mut Value> {
        let i = self.resolve(index).ok_or(ErrorCode::OutOfBounds)?;
        Ok(&mut self.values[i])
    }

    pub fn set(&mut self, index: isize, value: Value) -> OpResult<()> {
        let slot = self.get_mut(index)?;
        let old = std::mem::replace(slot, value);
        drop(old);
        Ok(())
    }

    pub fn top(&self) -> OpResult<&Value> {
        self.get(-1)
    }

    /// Access by absolute position, ignoring the frame window.
    pub fn absolute(&self, index: usize) -> OpResult<&Value> {
        self.values.get(index).ok_or(ErrorCode::OutOfBounds)
    }

    pub fn absolute_mut(&mut self, index: usize) -> OpResult<&mut Value> {
        self.values.get_mut(index).ok_or(ErrorCode::OutOfBounds)
    }

    /// Insert below the top `depth` values.
    pub fn insert_below(&mut self, depth: usize, value: Value) -> OpResult<()> {
        if depth > self.stack_size() {
            return Err(ErrorCode::StackError);
        }
        self.push(Value::Null)?;
        let at = self.values.len() - 1 - depth;
        self.values[at..].rotate_right(1);
        self.values[at] = value;
        Ok(())
    }

    /// View over the current frame window.
    pub fn view(&self) -> StackView<'_> {
        StackView {
            slots: &self.values[self.base..],
        }
    }

    /// View over an absolute range.
    pub fn view_range(&self, range: Range<usize>) -> OpResult<StackView<'_>> {
        self.values
            .get(range)
            .map(|slots| StackView { slots })
            .ok_or(ErrorCode::OutOfBounds)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

/// Non-owning span over stack slots.
#[derive(Debug, Clone, Copy)]
pub struct StackView<'a> {
    slots: &'a [Value],
}

impl<'a> StackView<'a> {
    pub fn new(slots: &'a [Value]) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a Value> {
        self.slots.get(index)
    }

    pub fn as_slice(&self) -> &'a [Value] {
        self.slots
    }

    pub fn iter(&self) -> std::slice::Iter<'a, Value> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: &Value) -> i64 {
        v.get_integer().unwrap()
    }

    #[test]
    fn test_push_pop_and_negative_index() {
        let mut stack = ExecutionStack::new(4);
        for i in 0..10 {
            stack.push(Value::Integer(i)).unwrap();
            assert_eq!(int(stack.get(-1).unwrap()), i);
            assert_eq!(stack.stack_size(), (i + 1) as usize);
        }
        assert_eq!(int(&stack.pop().unwrap()), 9);
        assert_eq!(int(stack.get(-1).unwrap()), 8);
        assert_eq!(int(stack.get(0).unwrap()), 0);
    }

    #[test]
    fn test_frame_window() {
        let mut stack = ExecutionStack::new(8);
        stack.push(Value::Integer(1)).unwrap();
        stack.push(Value::Integer(2)).unwrap();
        stack.set_stack_base(1).unwrap();
        assert_eq!(stack.stack_size(), 1);
        assert_eq!(int(stack.get(0).unwrap()), 2);
        stack.push(Value::Integer(3)).unwrap();
        assert_eq!(stack.get_absolute_top(), 3);
        assert_eq!(stack.view().len(), 2);
        assert_eq!(stack.get(-3).err(), Some(ErrorCode::OutOfBounds));
    }

    #[test]
    fn test_restore_base_clamps_to_top() {
        let mut stack = ExecutionStack::new(8);
        stack.push(Value::Integer(1)).unwrap();
        stack.push(Value::Integer(2)).unwrap();
        stack.restore_base(5);
        assert_eq!(stack.get_stack_base(), 2);
        stack.restore_base(1);
        assert_eq!(stack.stack_size(), 1);
    }

    #[test]
    fn test_pop_below_base_is_rejected() {
        let mut stack = ExecutionStack::new(8);
        stack.push(Value::Integer(1)).unwrap();
        stack.set_stack_base(1).unwrap();
        assert_eq!(stack.pop().err(), Some(ErrorCode::StackError));
        assert_eq!(stack.set_stack_base(5), Err(ErrorCode::StackError));
    }

    #[test]
    fn test_fixed_stack_is_full() {
        let mut stack = ExecutionStack::fixed(2);
        stack.push(Value::Null).unwrap();
        stack.push(Value::Null).unwrap();
        assert_eq!(stack.push(Value::Null), Err(ErrorCode::StackError));
        assert_eq!(stack.capacity(), 2);
    }

    #[test]
    fn test_insert_below() {
        let mut stack = ExecutionStack::new(8);
        stack.push(Value::Integer(1)).unwrap();
        stack.push(Value::Integer(2)).unwrap();
        stack.insert_below(1, Value::Integer(9)).unwrap();
        let all: Vec<i64> = stack.view().iter().map(int).collect();
        assert_eq!(all, vec![1, 9, 2]);
    }

    #[test]
    fn test_size_invariant_over_mixed_sequence() {
        let mut stack = ExecutionStack::new(2);
        let mut expected = Vec::new();
        for step in 0..50_i64 {
            if step % 3 == 2 {
                let popped = stack.pop().unwrap();
                assert_eq!(int(&popped), expected.pop().unwrap());
            } else {
                stack.push(Value::Integer(step)).unwrap();
                expected.push(step);
            }
            assert_eq!(stack.stack_size(), stack.get_absolute_top() - stack.get_stack_base());
            assert_eq!(stack.stack_size(), expected.len());
            if let Some(last) = expected.last() {
                assert_eq!(int(stack.get(-1).unwrap()), *last);
            }
        }
    }
}
