//! Bounded lock-free single-producer/single-consumer channel.
//!
//! A fixed ring with one empty sentinel slot: the producer owns `tail`, the
//! consumer owns `head`, and each side only ever loads the other's index.
//! `send` fails on a full ring and `try_recv` returns `None` on an empty
//! one; neither side blocks, spins, or allocates after construction.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Ring<T> {
	/// Next slot the consumer will read.
	head: AtomicUsize,
	/// Next slot the producer will write.
	tail: AtomicUsize,
	slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
	#[inline]
	fn wrap(&self, idx: usize) -> usize {
		let next = idx + 1;
		if next == self.slots.len() {
			0
		} else {
			next
		}
	}
}

impl<T> Drop for Ring<T> {
	fn drop(&mut self) {
		let mut head = *self.head.get_mut();
		let tail = *self.tail.get_mut();

		while head != tail {
			unsafe { (*self.slots[head].get()).assume_init_drop() };
			head = self.wrap(head);
		}
	}
}

pub struct Sender<T> {
	ring: Arc<Ring<T>>,
}

pub struct Receiver<T> {
	ring: Arc<Ring<T>>,
}

/// Create a channel holding at most `capacity` in-flight messages.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
	assert!(capacity > 0);

	let slots = (0..capacity + 1).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

	let ring = Arc::new(Ring {
		head: AtomicUsize::new(0),
		tail: AtomicUsize::new(0),
		slots,
	});

	(Sender { ring: ring.clone() }, Receiver { ring })
}

impl<T> Sender<T> {
	/// Enqueue, handing the message back if the ring is full.
	pub fn send(&self, msg: T) -> Result<(), T> {
		let ring = &*self.ring;

		let tail = ring.tail.load(Ordering::Relaxed);
		let next = ring.wrap(tail);

		if next == ring.head.load(Ordering::Acquire) {
			return Err(msg);
		}

		unsafe { (*ring.slots[tail].get()).write(msg) };
		ring.tail.store(next, Ordering::Release);
		Ok(())
	}
}

impl<T> Receiver<T> {
	/// Dequeue, or `None` if the ring is empty.
	pub fn try_recv(&self) -> Option<T> {
		let ring = &*self.ring;

		let head = ring.head.load(Ordering::Relaxed);

		if head == ring.tail.load(Ordering::Acquire) {
			return None;
		}

		let msg = unsafe { (*ring.slots[head].get()).assume_init_read() };
		ring.head.store(ring.wrap(head), Ordering::Release);
		Some(msg)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bounded() {
		let (tx, rx) = channel(2);

		assert!(tx.send(1).is_ok());
		assert!(tx.send(2).is_ok());
		assert_eq!(tx.send(3), Err(3));

		assert_eq!(rx.try_recv(), Some(1));
		assert!(tx.send(3).is_ok());
		assert_eq!(rx.try_recv(), Some(2));
		assert_eq!(rx.try_recv(), Some(3));
		assert_eq!(rx.try_recv(), None);
	}

	#[test]
	fn drops_undelivered() {
		use std::sync::atomic::{AtomicUsize, Ordering};

		static DROPS: AtomicUsize = AtomicUsize::new(0);

		#[derive(Debug)]
		struct Counted;

		impl Drop for Counted {
			fn drop(&mut self) {
				DROPS.fetch_add(1, Ordering::Relaxed);
			}
		}

		let (tx, rx) = channel(4);
		tx.send(Counted).unwrap();
		tx.send(Counted).unwrap();
		drop(rx.try_recv());
		drop((tx, rx));

		assert_eq!(DROPS.load(Ordering::Relaxed), 2);
	}

	#[test]
	fn cross_thread() {
		let (tx, rx) = channel(64);

		let producer = std::thread::spawn(move || {
			for i in 0..10_000u32 {
				let mut v = i;
				loop {
					match tx.send(v) {
						Ok(()) => break,
						Err(back) => {
							v = back;
							std::thread::yield_now();
						}
					}
				}
			}
		});

		let mut expect = 0u32;
		while expect < 10_000 {
			if let Some(v) = rx.try_recv() {
				assert_eq!(v, expect);
				expect += 1;
			} else {
				std::thread::yield_now();
			}
		}

		producer.join().unwrap();
		assert_eq!(rx.try_recv(), None);
	}
}
