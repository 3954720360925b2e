// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::std::{
    marker::PhantomData,
    ptr::NonNull,
};

// An intrusive singly-linked list (FIFO queue) that owns its boxed elements.
#[derive(Debug)]
pub struct IntrusiveQueue<T: IntrusivelyQueueable> {
    // Pointer to the first element in the queue.
    front: Option<NonNull<T>>,
    // Pointer to the last element in the queue.
    back: Option<NonNull<T>>,
    // Length of the queue in elements.
    len: usize,
    // Hint to compiler that this struct "owns" a Box<T> per element.
    phantom: PhantomData<Box<T>>,
}

// Elements are owned exclusively by the queue, so it may move between threads whenever they may.
unsafe impl<T: IntrusivelyQueueable + Send> Send for IntrusiveQueue<T> {}

impl<T: IntrusivelyQueueable> IntrusiveQueue<T> {
    // Create an empty IntrusiveQueue.
    #[inline]
    pub const fn new() -> Self {
        IntrusiveQueue {
            front: None,
            back: None,
            len: 0,
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.front.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    // Pop the first element off the front of the queue.
    pub fn pop_front(&mut self) -> Option<Box<T>> {
        let front: NonNull<T> = self.front?;

        // Reclaim ownership of the element.
        let mut popped: Box<T> = unsafe { Box::from_raw(front.as_ptr()) };

        // Repoint the front pointer at the next element (or None).
        self.front = popped.get_queue_next();
        if self.front.is_none() {
            self.back = None;
        }
        popped.set_queue_next(None);

        self.len -= 1;
        Some(popped)
    }

    // Add the given element to the back of the queue.
    pub fn push_back(&mut self, mut added: Box<T>) {
        // Ensure the new element's next pointer doesn't point to anything.
        added.set_queue_next(None);

        // Ownership moves into the queue until the element is popped.
        let added: NonNull<T> = unsafe { NonNull::new_unchecked(Box::into_raw(added)) };

        match self.back {
            // Nothing currently on the queue, so the new element also becomes the front.
            None => self.front = Some(added),
            // Point the current last element's next pointer at the new element.
            Some(mut old_back) => unsafe { old_back.as_mut().set_queue_next(Some(added)) },
        }

        self.back = Some(added);
        self.len += 1;
    }

    // Move every element out, leaving this queue empty.
    pub fn take_all(&mut self) -> Self {
        ::std::mem::replace(self, Self::new())
    }
}

// Drop every element still on the queue.
impl<T: IntrusivelyQueueable> Drop for IntrusiveQueue<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

impl<T: IntrusivelyQueueable> Iterator for IntrusiveQueue<T> {
    type Item = Box<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop_front()
    }
}

impl<T: IntrusivelyQueueable> Default for IntrusiveQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub trait IntrusivelyQueueable {
    // Returns the next element in the queue.
    fn get_queue_next(&self) -> Option<NonNull<Self>>;

    // Sets the next element in the queue.
    fn set_queue_next(&mut self, element: Option<NonNull<Self>>);
}
