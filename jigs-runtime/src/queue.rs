//! Serial admission of top-level invocations from many threads

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{debug, warn};

use crate::runtime::Runtime;

#[derive(Debug, Default)]
struct Tickets {
    /// Ticket handed to the next caller
    next: u64,
    /// Ticket allowed to run
    serving: u64,
}

struct Shared {
    runtime: Mutex<Runtime>,
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

/// A runtime shared between threads
///
/// Tasks run one at a time in the order they were submitted. Callers are queued, never rejected,
/// and each task runs its invocation tree to settlement before the next one starts.
#[derive(Clone)]
pub struct SharedRuntime {
    inner: Arc<Shared>,
}

/// Holds the turn of one task and passes it on when dropped
struct Turn<'a> {
    shared: &'a Shared,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut tickets = lock(&self.shared.tickets);
        tickets.serving += 1;
        self.shared.turn.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SharedRuntime {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            inner: Arc::new(Shared {
                runtime: Mutex::new(runtime),
                tickets: Mutex::new(Tickets::default()),
                turn: Condvar::new(),
            }),
        }
    }

    /// Run `task` once every earlier task has finished
    ///
    /// # Parameters
    /// * `task` - Closure given exclusive access to the runtime
    ///
    /// # Returns
    /// Whatever `task` returns
    pub fn submit<R>(&self, task: impl FnOnce(&mut Runtime) -> R) -> R {
        let shared = &*self.inner;
        let ticket = {
            let mut tickets = lock(&shared.tickets);
            let ticket = tickets.next;
            tickets.next += 1;
            while tickets.serving != ticket {
                tickets = shared.turn.wait(tickets).unwrap_or_else(|e| e.into_inner());
            }
            ticket
        };
        let _turn = Turn { shared };
        debug!("Running queued task {}", ticket);

        let mut runtime = match shared.runtime.lock() {
            Ok(runtime) => runtime,
            Err(poisoned) => {
                let mut runtime = poisoned.into_inner();
                if runtime.recover() {
                    warn!("Rolled back the invocation of a task that panicked");
                }
                shared.runtime.clear_poison();
                runtime
            }
        };
        task(&mut runtime)
    }

    /// Number of tasks submitted but not yet finished
    pub fn queued(&self) -> u64 {
        let tickets = lock(&self.inner.tickets);
        tickets.next - tickets.serving
    }
}
