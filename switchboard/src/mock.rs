//! Mock platform - hosted scheduler, interrupt controller and console for
//! testing
//!
//! Every std thread is a kernel thread. Wake tokens are a flag plus a
//! condition variable per thread, the interrupt level is a thread-local flag
//! and the clock counts microseconds since the platform was first touched.
//!
//! # Example
//!
//! ```text
//! mock::install();
//! let sem = Semaphore::new(0);
//! assert_eq!(sem.down_timeout(0), Err(WaitError::TimedOut));
//! ```

use crate::attunement::{self, InterruptController, Ipl};
use crate::console::{self, ConsoleSink};
use crate::loom_of_fate::{self, Deadline, Scheduler, ThreadId};
use lazy_static::lazy_static;
use std::cell::Cell;
use std::collections::HashMap;
use std::string::String;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct WakeToken {
    fired: Mutex<bool>,
    cond: Condvar,
}

/// Hosted implementation of every platform seam.
pub struct HostPlatform {
    threads: Mutex<HashMap<u64, Arc<WakeToken>>>,
    next_id: AtomicU64,
    epoch: Instant,
    console: Mutex<String>,
}

thread_local! {
    static CURRENT: Cell<Option<u64>> = Cell::new(None);
    static INTERRUPTS_DISABLED: Cell<bool> = Cell::new(false);
}

lazy_static! {
    static ref PLATFORM: HostPlatform = HostPlatform::new();
}

impl HostPlatform {
    fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            console: Mutex::new(String::new()),
        }
    }

    fn current(&self) -> (u64, Arc<WakeToken>) {
        let id = CURRENT.with(|current| match current.get() {
            Some(id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                current.set(Some(id));
                id
            }
        });
        let token = self
            .threads
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| {
                Arc::new(WakeToken {
                    fired: Mutex::new(false),
                    cond: Condvar::new(),
                })
            })
            .clone();
        (id, token)
    }
}

impl Scheduler for HostPlatform {
    fn current_thread(&self) -> ThreadId {
        ThreadId(self.current().0)
    }

    fn thread_wait_start(&self) -> bool {
        let (_, token) = self.current();
        *token.fired.lock().unwrap() = false;
        true
    }

    fn thread_wait_finish(&self, deadline: Deadline) -> bool {
        let (_, token) = self.current();
        let mut fired = token.fired.lock().unwrap();
        loop {
            if *fired {
                *fired = false;
                return false;
            }
            match deadline.remaining(self.now_usec()) {
                None => fired = token.cond.wait(fired).unwrap(),
                Some(0) => return true,
                Some(usec) => {
                    fired = token
                        .cond
                        .wait_timeout(fired, Duration::from_micros(usec))
                        .unwrap()
                        .0
                }
            }
        }
    }

    fn thread_wakeup(&self, thread: ThreadId) {
        let token = self.threads.lock().unwrap().get(&thread.0).cloned();
        if let Some(token) = token {
            *token.fired.lock().unwrap() = true;
            token.cond.notify_all();
        }
    }

    fn now_usec(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn cpu_id(&self) -> usize {
        self.current().0 as usize
    }
}

impl InterruptController for HostPlatform {
    fn interrupts_disable(&self) -> Ipl {
        let was_disabled = INTERRUPTS_DISABLED.with(|flag| flag.replace(true));
        Ipl(was_disabled as usize)
    }

    fn interrupts_restore(&self, ipl: Ipl) {
        INTERRUPTS_DISABLED.with(|flag| flag.set(ipl.0 != 0));
    }

    fn interrupts_disabled(&self) -> bool {
        INTERRUPTS_DISABLED.with(|flag| flag.get())
    }
}

impl ConsoleSink for HostPlatform {
    fn write_str(&self, s: &str) {
        self.console.lock().unwrap().push_str(s);
    }
}

/// Install the hosted platform into every seam. Idempotent.
pub fn install() {
    let platform: &'static HostPlatform = &PLATFORM;
    attunement::install(platform);
    loom_of_fate::install(platform);
    console::install(platform);
    // Register the calling thread before it can be the target of a wakeup.
    let _ = platform.current();
}

/// Everything written to the console so far, by every test.
pub fn console_output() -> String {
    PLATFORM.console.lock().unwrap().clone()
}

/// Spawn a thread that runs with the platform installed.
pub fn spawn<F, T>(f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::spawn(move || {
        install();
        f()
    })
}

/// Sleep the calling host thread.
pub fn pause(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// Poll `cond` until it holds or two seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
