/// Objects that can be parked in an [`ObjectCache`] between uses.
///
/// `reset` must return the object to its freshly-constructed state; it runs
/// every time an object is handed back, whether or not it is kept.
pub trait Reuse {
    fn reset(&mut self);
}

/// A bounded free list of boxed objects.
///
/// `get` reuses a parked object when one is available and allocates
/// otherwise. `put` resets the object and parks it unless the cache is
/// already at capacity, in which case the object is dropped.
pub struct ObjectCache<T: Reuse> {
    free: Vec<Box<T>>,
    cap: usize,
}

impl<T: Reuse> ObjectCache<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { free: Vec::new(), cap }
    }

    #[inline]
    pub fn get_with<F: FnOnce() -> T>(&mut self, make: F) -> Box<T> {
        match self.free.pop() {
            Some(obj) => obj,
            None => Box::new(make()),
        }
    }

    #[inline]
    pub fn put(&mut self, mut obj: Box<T>) {
        obj.reset();
        if self.free.len() < self.cap {
            self.free.push(obj);
        }
    }

    #[inline]
    pub fn parked(&self) -> usize {
        self.free.len()
    }
}

impl<T: Reuse + Default> ObjectCache<T> {
    #[inline]
    pub fn get(&mut self) -> Box<T> {
        self.get_with(T::default)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        data: Vec<u8>,
        resets: usize,
    }

    impl Reuse for Scratch {
        fn reset(&mut self) {
            self.data.clear();
            self.resets += 1;
        }
    }

    #[test]
    fn reuses_parked_objects() {
        let mut cache: ObjectCache<Scratch> = ObjectCache::new(4);
        let mut obj = cache.get();
        obj.data.extend_from_slice(b"abc");
        cache.put(obj);
        assert_eq!(cache.parked(), 1);

        let obj = cache.get();
        assert!(obj.data.is_empty());
        assert_eq!(obj.resets, 1);
        assert_eq!(cache.parked(), 0);
    }

    #[test]
    fn drops_past_capacity() {
        let mut cache: ObjectCache<Scratch> = ObjectCache::new(1);
        let a = cache.get();
        let b = cache.get();
        cache.put(a);
        cache.put(b);
        assert_eq!(cache.parked(), 1);
    }
}
