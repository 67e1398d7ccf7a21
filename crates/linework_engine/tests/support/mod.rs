#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use linework_engine::{Sink, SinkError, SourceId};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(engine_logging::initialize_for_tests);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    Prepare,
    Before(SourceId),
    Pre(usize),
    Write(T),
    Post(usize),
    After,
}

/// Sink that records every call; clones share one log.
#[derive(Clone)]
pub struct RecordingSink<T> {
    events: Arc<Mutex<Vec<Event<T>>>>,
    writes: Arc<AtomicUsize>,
    fail_on_write: Option<usize>,
}

impl<T> Default for RecordingSink<T> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(AtomicUsize::new(0)),
            fail_on_write: None,
        }
    }
}

impl<T: Clone> RecordingSink<T> {
    /// Fails the `n`-th write (1-based) and every write after it.
    pub fn failing_on_write(n: usize) -> Self {
        Self {
            fail_on_write: Some(n),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event<T>> {
        self.events.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<T> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Write(item) => Some(item),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event<T>) {
        self.events.lock().unwrap().push(event);
    }
}

impl<T: Clone + Send + 'static> Sink<T> for RecordingSink<T> {
    fn prepare_once(&mut self) -> Result<(), SinkError> {
        self.push(Event::Prepare);
        Ok(())
    }

    fn before_write(&mut self, source: &SourceId) -> Result<(), SinkError> {
        self.push(Event::Before(source.clone()));
        Ok(())
    }

    fn pre_write(&mut self, row: usize) -> Result<(), SinkError> {
        self.push(Event::Pre(row));
        Ok(())
    }

    fn write(&mut self, item: T) -> Result<(), SinkError> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_write.is_some_and(|n| attempt >= n) {
            return Err(SinkError::Rejected(format!("write {attempt} refused")));
        }
        self.push(Event::Write(item));
        Ok(())
    }

    fn post_write(&mut self, row: usize) -> Result<(), SinkError> {
        self.push(Event::Post(row));
        Ok(())
    }

    fn after_write(&mut self) -> Result<(), SinkError> {
        self.push(Event::After);
        Ok(())
    }
}

/// Deterministic pseudo-random short strings.
pub fn random_lines(count: usize, seed: u64) -> Vec<String> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let len = 1 + (state >> 59) as usize;
            (0..len)
                .map(|i| (b'a' + (state.rotate_right(i as u32 * 5) % 26) as u8) as char)
                .collect()
        })
        .collect()
}
