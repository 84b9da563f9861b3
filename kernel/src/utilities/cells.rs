// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Cell types for the single-threaded cooperative execution model.
//!
//! Capsules are only ever entered from one execution context at a time, so
//! interior mutability through these cells is how they mutate their own
//! fields from `&self` callbacks without locks.

use core::cell::Cell;

/// A mutable memory location that enforces borrow rules at runtime without
/// possible panics.
///
/// A `TakeCell` holds an exclusive reference that can be taken out of the
/// cell, used, and put back. It is the mechanism for loaning a buffer to a
/// lower layer: while the buffer is taken, the cell is empty and the owner
/// simply cannot touch it.
pub struct TakeCell<'a, T: 'a + ?Sized> {
    val: Cell<Option<&'a mut T>>,
}

impl<'a, T: ?Sized> TakeCell<'a, T> {
    pub const fn empty() -> TakeCell<'a, T> {
        TakeCell {
            val: Cell::new(None),
        }
    }

    /// Creates a new `TakeCell` containing `value`.
    pub fn new(value: &'a mut T) -> TakeCell<'a, T> {
        TakeCell {
            val: Cell::new(Some(value)),
        }
    }

    pub fn is_none(&self) -> bool {
        let cur = self.val.take();
        let result = cur.is_none();
        self.val.set(cur);
        result
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Takes the value out of the cell, leaving it empty.
    pub fn take(&self) -> Option<&'a mut T> {
        self.val.take()
    }

    /// Stores `val` in the cell, discarding any previous contents.
    pub fn put(&self, val: Option<&'a mut T>) {
        self.val.set(val);
    }

    /// Replaces the contents with `val`, returning what was there before.
    pub fn replace(&self, val: &'a mut T) -> Option<&'a mut T> {
        self.val.replace(Some(val))
    }

    /// Allows closure `closure` to borrow the contents of the cell, if the
    /// cell is not empty. The cell is empty for the duration of the call,
    /// which prevents reentrant borrows.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.val.take().map(|val| {
            let res = closure(val);
            self.val.set(Some(val));
            res
        })
    }

    /// Like `map`, but returns `default` if the cell is empty.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.map(closure).unwrap_or(default)
    }
}

/// A `Cell<Option<T>>` with convenience methods so callers rarely handle
/// the inner `Option` directly. The main use is storing references to
/// clients and resources that are wired up after construction.
pub struct OptionalCell<T> {
    value: Cell<Option<T>>,
}

impl<T> OptionalCell<T> {
    /// Creates an empty `OptionalCell`.
    pub const fn empty() -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(None),
        }
    }

    /// Creates a new `OptionalCell` containing `value`.
    pub const fn new(value: T) -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(Some(value)),
        }
    }

    /// Stores `value`, discarding any previous contents.
    pub fn set(&self, value: T) {
        self.value.set(Some(value));
    }

    /// Resets the cell to empty.
    pub fn clear(&self) {
        self.value.set(None);
    }

    /// Replaces the contents with `value`, returning what was there before.
    pub fn replace(&self, value: T) -> Option<T> {
        self.value.replace(Some(value))
    }

    /// Takes the value out of the cell, leaving it empty.
    pub fn take(&self) -> Option<T> {
        self.value.take()
    }

    pub fn is_none(&self) -> bool {
        let cur = self.value.take();
        let result = cur.is_none();
        self.value.set(cur);
        result
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }
}

impl<T: Copy> OptionalCell<T> {
    /// Returns a copy of the contained value, if any.
    pub fn get(&self) -> Option<T> {
        self.value.get()
    }

    /// Calls `closure` with a copy of the contained value, if any.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map(closure)
    }

    /// Returns the contained value or `default` if the cell is empty.
    pub fn unwrap_or(&self, default: T) -> T {
        self.value.get().unwrap_or(default)
    }
}

/// Arithmetic convenience methods on numeric `Cell`s, so counters read as
/// `cell.increment()` rather than `cell.set(cell.get() + 1)`.
pub trait NumericCellExt<T> {
    /// Add `val` to the stored value.
    fn add(&self, val: T);

    /// Subtract `val` from the stored value.
    fn subtract(&self, val: T);

    /// Add one to the stored value.
    fn increment(&self);

    /// Subtract one from the stored value.
    fn decrement(&self);

    /// Return the stored value, then add one to it.
    fn get_and_increment(&self) -> T;
}

impl<T> NumericCellExt<T> for Cell<T>
where
    T: Copy + core::ops::Add<Output = T> + core::ops::Sub<Output = T> + From<u8>,
{
    fn add(&self, val: T) {
        self.set(self.get() + val);
    }

    fn subtract(&self, val: T) {
        self.set(self.get() - val);
    }

    fn increment(&self) {
        self.add(T::from(1));
    }

    fn decrement(&self) {
        self.subtract(T::from(1));
    }

    fn get_and_increment(&self) -> T {
        let current = self.get();
        self.increment();
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_cell_loans_exclusively() {
        let mut buffer = [0u8; 4];
        let cell = TakeCell::new(&mut buffer);
        assert!(cell.is_some());

        let loaned = cell.take().unwrap();
        assert!(cell.is_none());
        loaned[0] = 0xAA;
        cell.put(Some(loaned));

        assert_eq!(cell.map(|buf| buf[0]), Some(0xAA));
        assert!(cell.is_some());
    }

    #[test]
    fn take_cell_map_on_empty_returns_none() {
        let cell: TakeCell<'_, [u8]> = TakeCell::empty();
        assert_eq!(cell.map(|_| ()), None);
        assert_eq!(cell.map_or(7usize, |buf| buf.len()), 7);
    }

    #[test]
    fn optional_cell_set_take() {
        let cell = OptionalCell::empty();
        assert!(cell.is_none());
        cell.set(4usize);
        assert_eq!(cell.get(), Some(4));
        assert_eq!(cell.take(), Some(4));
        assert!(cell.is_none());
    }

    #[test]
    fn numeric_cell_counts() {
        let counter: Cell<usize> = Cell::new(0);
        counter.increment();
        counter.increment();
        counter.add(3);
        assert_eq!(counter.get_and_increment(), 5);
        counter.decrement();
        assert_eq!(counter.get(), 5);
    }
}
