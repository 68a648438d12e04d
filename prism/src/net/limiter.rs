//! Token-bucket send limiter for the datagram channel. A refill thread adds
//! `rate * tick` tokens every tick, capped at the burst capacity; senders
//! request tokens before each datagram and defer the send when denied. The
//! limiter is inert unless a rate is configured.

use crate::config::LimiterConfig;
use crate::logging;
use std::cmp::min;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

struct State {
    operating: bool,
    tokens: usize,
    rate: f64,
    capacity: usize,
    tick: Duration,
}

impl State {
    /// One refill step: add a tick's worth of tokens, capped at capacity.
    fn refill(&mut self) {
        let added = (self.rate * self.tick.as_secs_f64()) as usize;
        self.tokens = min(self.capacity, self.tokens + added);
    }
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

pub struct TokenBucket {
    shared: Arc<Shared>,
    refill_thread: Option<thread::JoinHandle<()>>,
    log: logging::Logger,
}

impl TokenBucket {
    /// Builds the bucket from configuration. Without a configured rate the
    /// bucket is inert: every request is granted and no thread runs.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &LimiterConfig,
        log: L,
    ) -> TokenBucket {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "limiter")),
            None => logging::discard(),
        };

        let operating = config.rate.is_some();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                operating,
                tokens: 0,
                rate: config.rate.unwrap_or(0.0),
                capacity: config.capacity,
                tick: config.tick(),
            }),
            cv: Condvar::new(),
        });

        let mut bucket = TokenBucket {
            shared,
            refill_thread: None,
            log,
        };

        if operating {
            bucket.start();
        }

        bucket
    }

    fn start(&mut self) {
        let shared = Arc::clone(&self.shared);
        let log = self.log.clone();

        {
            let state = self.shared.state.lock().expect("limiter state poisoned");
            logging::info!(log, "limiter started";
                           "rate" => state.rate,
                           "capacity" => state.capacity,
                           "tick_ms" => state.tick.as_millis() as u64);
        }

        self.refill_thread = Some(thread::spawn(move || {
            let mut state = shared.state.lock().expect("limiter state poisoned");
            while state.operating {
                let tick = state.tick;
                let (guard, _) = shared
                    .cv
                    .wait_timeout(state, tick)
                    .expect("limiter state poisoned");
                state = guard;

                if !state.operating {
                    break;
                }

                state.refill();
                shared.cv.notify_all();
            }
        }));
    }

    /// True while the refill thread is running.
    pub fn is_active(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("limiter state poisoned")
            .operating
    }

    /// Requests `n` tokens. Grants and deducts when enough are available;
    /// otherwise the caller defers and waits for the next tick. Inert
    /// buckets always grant.
    pub fn request(&self, n: usize) -> bool {
        let mut state = self.shared.state.lock().expect("limiter state poisoned");

        if !state.operating {
            return true;
        }

        if n <= state.tokens {
            state.tokens -= n;
            return true;
        }

        false
    }

    /// Blocks until the next refill tick (or the configured tick duration as
    /// an upper bound). Used by senders after a denied request; pending data
    /// must not be reordered in the meantime.
    pub fn wait_tick(&self) {
        let state = self.shared.state.lock().expect("limiter state poisoned");

        if !state.operating {
            return;
        }

        let tick = state.tick;
        let _ = self
            .shared
            .cv
            .wait_timeout(state, tick)
            .expect("limiter state poisoned");
    }

    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("limiter state poisoned");
            if !state.operating {
                return;
            }
            state.operating = false;
        }
        self.shared.cv.notify_all();

        if let Some(handle) = self.refill_thread.take() {
            logging::debug!(self.log, "joining limiter refill thread");
            let _ = handle.join();
        }
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.stop();
    }
}
