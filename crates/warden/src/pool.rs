use parking_lot::Mutex;

/// Objects that can be scrubbed and handed to the next borrower.
pub trait Reset: Default {
	fn reset(&mut self);
}

impl<K: std::hash::Hash + Eq, V> Reset for indexmap::IndexMap<K, V> {
	fn reset(&mut self) {
		self.clear();
	}
}

/// A freelist pool for hot per-request allocations. Entries are cleared on
/// the way back in so the pool never pins request data.
pub struct Pool<T: Reset> {
	free: Mutex<Vec<T>>,
	cap: usize,
}

impl<T: Reset> Pool<T> {
	pub fn new(cap: usize) -> Self {
		Self {
			free: Mutex::new(Vec::new()),
			cap,
		}
	}

	pub fn get(&self) -> T {
		self.free.lock().pop().unwrap_or_default()
	}

	pub fn put(&self, mut item: T) {
		item.reset();
		let mut free = self.free.lock();
		if free.len() < self.cap {
			free.push(item);
		}
	}

	#[cfg(test)]
	pub fn idle(&self) -> usize {
		self.free.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recycled_maps_come_back_empty() {
		let pool: Pool<indexmap::IndexMap<String, String>> = Pool::new(4);
		let mut m = pool.get();
		m.insert("k".to_string(), "v".to_string());
		pool.put(m);
		assert_eq!(pool.idle(), 1);
		let m = pool.get();
		assert!(m.is_empty());
		assert_eq!(pool.idle(), 0);
	}

	#[test]
	fn pool_caps_retained_entries() {
		let pool: Pool<indexmap::IndexMap<String, String>> = Pool::new(1);
		pool.put(indexmap::IndexMap::new());
		pool.put(indexmap::IndexMap::new());
		assert_eq!(pool.idle(), 1);
	}
}
