//! Non-blocking object pool backing the read-buffer stripes.
//!
//! Acquire and release never block beyond the uncontended mutex; when every
//! object is checked out, `try_pull` returns `None` and the caller drops the
//! work on the floor. That lossy overflow is what the ring buffer wants.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

pub(crate) struct Pool<T> {
    objects: Mutex<Vec<T>>,
}

impl<T> Pool<T> {
    pub(crate) fn new<F>(cap: usize, init: F) -> Pool<T>
    where
        F: Fn() -> T,
    {
        Pool {
            objects: Mutex::new((0..cap).map(|_| init()).collect()),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Checks an object out, or returns `None` if the pool is empty.
    pub(crate) fn try_pull(&self) -> Option<Reusable<'_, T>> {
        self.objects
            .lock()
            .pop()
            .map(|data| Reusable::new(self, data))
    }

    fn attach(&self, t: T) {
        self.objects.lock().push(t);
    }
}

/// RAII handle returning the object to its pool on drop.
pub(crate) struct Reusable<'a, T> {
    pool: &'a Pool<T>,
    data: ManuallyDrop<T>,
}

impl<'a, T> Reusable<'a, T> {
    fn new(pool: &'a Pool<T>, t: T) -> Self {
        Reusable {
            pool,
            data: ManuallyDrop::new(t),
        }
    }
}

impl<'a, T> Deref for Reusable<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<'a, T> DerefMut for Reusable<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<'a, T> Drop for Reusable<'a, T> {
    fn drop(&mut self) {
        let data = unsafe { ManuallyDrop::take(&mut self.data) };
        self.pool.attach(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_and_return() {
        let pool = Pool::new(1, Vec::<u8>::new);

        let object1 = pool.try_pull();
        let object2 = pool.try_pull();
        assert!(object1.is_some());
        assert!(object2.is_none());

        drop(object1);
        drop(object2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_object_state_survives_reuse() {
        let pool = Pool::new(1, Vec::new);
        {
            let mut object = pool.try_pull().unwrap();
            object.push(1u8);
        }
        assert_eq!(pool.try_pull().unwrap()[0], 1);
    }

    #[test]
    fn test_exhaustion_and_refill() {
        let pool = Pool::new(10, Vec::<u8>::new);
        let mut objects = Vec::new();

        for i in 0..10u8 {
            let mut object = pool.try_pull().unwrap();
            object.push(i);
            objects.push(object);
        }

        assert!(pool.try_pull().is_none());
        drop(objects);
        assert!(pool.try_pull().is_some());
        assert_eq!(pool.len(), 10);
    }
}
