//! Bounded capture store with listener fan-out
//!
//! Captures live in an index-wrapping ring: once `capacity` entries are held,
//! each insertion overwrites the oldest slot. IDs are assigned under the same
//! lock as the insertion, so the buffer is always ordered by ID. Listeners
//! are called after the lock is released, in registration order.

use crate::record::CapturedRequest;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Receives every capture once it has been recorded.
pub trait CaptureListener: Send + Sync {
  /// Called once per recorded capture, outside any recorder lock.
  fn on_capture(&self, capture: &Arc<CapturedRequest>);
}

impl<F> CaptureListener for F
where
  F: Fn(&Arc<CapturedRequest>) + Send + Sync,
{
  fn on_capture(&self, capture: &Arc<CapturedRequest>) {
    self(capture)
  }
}

struct Ring {
  slots: Vec<Option<Arc<CapturedRequest>>>,
  /// index of the oldest entry
  head: usize,
  len: usize,
  next_id: u64,
}

impl Ring {
  fn new(capacity: usize) -> Self {
    Self {
      slots: vec![None; capacity],
      head: 0,
      len: 0,
      next_id: 1,
    }
  }

  fn push(&mut self, capture: Arc<CapturedRequest>) {
    let capacity = self.slots.len();
    if self.len < capacity {
      let tail = (self.head + self.len) % capacity;
      self.slots[tail] = Some(capture);
      self.len += 1;
    } else {
      self.slots[self.head] = Some(capture);
      self.head = (self.head + 1) % capacity;
    }
  }

  fn iter(&self) -> impl Iterator<Item = &Arc<CapturedRequest>> {
    let capacity = self.slots.len();
    (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
  }

  fn clear(&mut self) {
    self.slots.iter_mut().for_each(|slot| *slot = None);
    self.head = 0;
    self.len = 0;
  }
}

/// Fixed-capacity, FIFO-evicting capture store
pub struct CaptureRecorder {
  ring: Mutex<Ring>,
  listeners: RwLock<Vec<Arc<dyn CaptureListener>>>,
}

impl CaptureRecorder {
  /// Create a recorder keeping at most `capacity` captures (at least one).
  pub fn new(capacity: usize) -> Self {
    Self {
      ring: Mutex::new(Ring::new(capacity.max(1))),
      listeners: RwLock::new(Vec::new()),
    }
  }

  /// Assign the next ID, store the capture, and notify every listener.
  pub fn record(&self, mut capture: CapturedRequest) -> Arc<CapturedRequest> {
    let capture = {
      let mut ring = self.ring.lock();
      capture.id = ring.next_id;
      ring.next_id += 1;
      let capture = Arc::new(capture);
      ring.push(capture.clone());
      capture
    };
    tracing::debug!(
      "[CAPTURE] #{} {} {} -> {:?}",
      capture.id,
      capture.method,
      capture.url,
      capture.status
    );
    let listeners = self.listeners.read().clone();
    for listener in listeners.iter() {
      listener.on_capture(&capture);
    }
    capture
  }

  /// Current captures, oldest first.
  pub fn snapshot(&self) -> Vec<Arc<CapturedRequest>> {
    self.ring.lock().iter().cloned().collect()
  }

  /// Drop every capture; IDs keep counting from where they were.
  pub fn clear(&self) {
    self.ring.lock().clear();
  }

  /// Register a listener for the rest of the recorder's lifetime.
  pub fn add_listener<L>(&self, listener: L)
  where
    L: CaptureListener + 'static,
  {
    self.listeners.write().push(Arc::new(listener));
  }

  /// Find a capture by ID if it has not been evicted.
  pub fn get(&self, id: u64) -> Option<Arc<CapturedRequest>> {
    self.ring.lock().iter().find(|c| c.id == id).cloned()
  }

  /// Case-insensitive search over URLs and text bodies.
  pub fn search(&self, query: &str) -> Vec<Arc<CapturedRequest>> {
    let query = query.to_lowercase();
    self
      .snapshot()
      .into_iter()
      .filter(|c| {
        c.url.to_lowercase().contains(&query)
          || c.request_body.text().to_lowercase().contains(&query)
          || c.response_body.text().to_lowercase().contains(&query)
      })
      .collect()
  }

  /// Number of captures held
  pub fn len(&self) -> usize {
    self.ring.lock().len
  }

  /// Whether no captures are held
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Maximum number of captures held
  pub fn capacity(&self) -> usize {
    self.ring.lock().slots.len()
  }
}

impl Default for CaptureRecorder {
  fn default() -> Self {
    Self::new(crate::config::DEFAULT_CAPACITY)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{CapturedBody, CapturedRequest};
  use bytes::Bytes;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn capture(path: &str) -> CapturedRequest {
    CapturedRequest::new(http::Method::GET, format!("http://example.com{}", path))
  }

  #[test]
  fn ids_start_at_one_and_increase() {
    let recorder = CaptureRecorder::new(10);
    let a = recorder.record(capture("/a"));
    let b = recorder.record(capture("/b"));
    assert_eq!(a.id, 1);
    assert_eq!(b.id, 2);
    assert_eq!(recorder.get(2).unwrap().url, "http://example.com/b");
  }

  #[test]
  fn overflow_evicts_oldest_first() {
    let recorder = CaptureRecorder::new(3);
    for i in 0..8 {
      recorder.record(capture(&format!("/{}", i)));
    }
    let ids: Vec<u64> = recorder.snapshot().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![6, 7, 8]);
    assert_eq!(recorder.len(), 3);
    assert!(recorder.get(1).is_none());
  }

  #[test]
  fn clear_keeps_the_id_counter() {
    let recorder = CaptureRecorder::new(3);
    recorder.record(capture("/a"));
    recorder.record(capture("/b"));
    recorder.clear();
    assert!(recorder.is_empty());
    let next = recorder.record(capture("/c"));
    assert_eq!(next.id, 3);
    assert_eq!(recorder.snapshot().len(), 1);
  }

  #[test]
  fn zero_capacity_still_keeps_latest() {
    let recorder = CaptureRecorder::new(0);
    recorder.record(capture("/a"));
    recorder.record(capture("/b"));
    assert_eq!(recorder.capacity(), 1);
    assert_eq!(recorder.snapshot()[0].id, 2);
  }

  #[test]
  fn listeners_run_in_registration_order() {
    let recorder = CaptureRecorder::new(4);
    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..3 {
      let order = order.clone();
      recorder.add_listener(move |c: &Arc<CapturedRequest>| order.lock().push((n, c.id)));
    }
    recorder.record(capture("/a"));
    assert_eq!(*order.lock(), vec![(0, 1), (1, 1), (2, 1)]);
  }

  #[test]
  fn listeners_may_reenter_the_recorder() {
    let recorder = Arc::new(CaptureRecorder::new(4));
    let seen = Arc::new(AtomicUsize::new(0));
    let inner = recorder.clone();
    let counter = seen.clone();
    recorder.add_listener(move |_: &Arc<CapturedRequest>| {
      counter.store(inner.snapshot().len(), Ordering::SeqCst);
      let counter = counter.clone();
      inner.add_listener(move |_: &Arc<CapturedRequest>| {
        counter.fetch_add(100, Ordering::SeqCst);
      });
    });
    recorder.record(capture("/a"));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn search_matches_url_and_bodies() {
    let recorder = CaptureRecorder::new(4);
    recorder.record(capture("/users"));
    let mut with_body = capture("/login");
    with_body.response_body = CapturedBody {
      data: Bytes::from_static(b"Welcome Admin"),
      truncated: false,
      total_len: 13,
    };
    recorder.record(with_body);
    assert_eq!(recorder.search("USERS").len(), 1);
    assert_eq!(recorder.search("admin")[0].id, 2);
    assert!(recorder.search("missing").is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_records_are_not_lost() {
    let recorder = Arc::new(CaptureRecorder::new(1000));
    let mut tasks = Vec::new();
    for t in 0..8 {
      let recorder = recorder.clone();
      tasks.push(tokio::spawn(async move {
        for i in 0..100 {
          recorder.record(capture(&format!("/{}/{}", t, i)));
        }
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    let ids: Vec<u64> = recorder.snapshot().iter().map(|c| c.id).collect();
    assert_eq!(ids.len(), 800);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ids[0], 1);
    assert_eq!(ids[799], 800);
  }
}
