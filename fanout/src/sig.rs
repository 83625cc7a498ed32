//! Signal supervisor: a process-wide queue of named cleanup handlers,
//! ordered by priority (lower runs first), invoked once on SIGINT/SIGTERM.
//! Registration is a no-op until the listener is armed with `listen`.

use color_eyre::Report;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{signal, SignalKind};
use tracing::warn;

pub type Handler = Box<dyn FnOnce() -> Result<(), Report> + Send>;

static ENABLED: AtomicBool = AtomicBool::new(false);
static RAN: AtomicBool = AtomicBool::new(false);
static QUEUE: Lazy<Mutex<HandlerQueue>> = Lazy::new(|| Mutex::new(HandlerQueue::new()));

/// Arms the supervisor and subscribes to SIGINT/SIGTERM.
pub fn listen() {
    ENABLED.store(true, Ordering::SeqCst);
    tokio::spawn(async {
        let interrupt = signal(SignalKind::interrupt());
        let terminate = signal(SignalKind::terminate());
        let (Ok(mut interrupt), Ok(mut terminate)) = (interrupt, terminate) else {
            warn!("cannot subscribe to signals");
            return;
        };
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        clean_up();
    });
}

/// Queues `handler` under `name`. A second registration with the same name
/// is ignored. `0` has a higher priority over `1`.
pub fn register(name: &str, priority: i32, handler: Handler) {
    if !ENABLED.load(Ordering::SeqCst) {
        return;
    }
    QUEUE.lock().register(name, priority, handler);
}

/// Marks a handler as not-to-run without removing it.
pub fn disable(name: &str) {
    QUEUE.lock().disable(name);
}

/// Runs all enabled handlers in priority order and exits: 0 when every
/// handler succeeded, 2 otherwise.
pub fn clean_up() -> ! {
    let code = if run_once().is_ok() { 0 } else { 2 };
    std::process::exit(code);
}

/// Runs the cleanup queue and exits with `code` (2 when a handler failed).
/// Used by presenters that end the process early on operator request.
pub fn abort(code: i32) -> ! {
    let code = if run_once().is_ok() { code } else { 2 };
    std::process::exit(code);
}

fn run_once() -> Result<(), Report> {
    if RAN.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    if !ENABLED.load(Ordering::SeqCst) {
        return Ok(());
    }
    QUEUE.lock().run()
}

struct SigHandler {
    name: String,
    priority: i32,
    enabled: bool,
    handler: Handler,
}

struct HandlerQueue {
    queue: Vec<SigHandler>,
}

impl HandlerQueue {
    fn new() -> Self {
        Self { queue: Vec::new() }
    }

    fn register(&mut self, name: &str, priority: i32, handler: Handler) {
        if self.queue.iter().any(|existing| existing.name == name) {
            return;
        }
        self.queue.push(SigHandler {
            name: name.to_string(),
            priority,
            enabled: true,
            handler,
        });
    }

    fn disable(&mut self, name: &str) {
        if let Some(handler) = self
            .queue
            .iter_mut()
            .find(|handler| handler.name == name)
        {
            handler.enabled = false;
        }
    }

    /// Pops handlers in priority order. A failing handler is reported and
    /// the remaining ones are skipped.
    fn run(&mut self) -> Result<(), Report> {
        self.queue.sort_by_key(|handler| handler.priority);
        // the drain clears whatever remains once this returns
        for handler in self.queue.drain(..) {
            if !handler.enabled {
                continue;
            }
            if let Err(err) = (handler.handler)() {
                eprintln!("Signal Handler {} Failed: {}", handler.name, err);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &str,
        fail: bool,
    ) -> Handler {
        let log = Arc::clone(log);
        let name = name.to_string();
        Box::new(move || {
            log.lock().push(name.clone());
            if fail {
                Err(color_eyre::eyre::eyre!("ErrorByDesign"))
            } else {
                Ok(())
            }
        })
    }

    #[test]
    fn handlers_run_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = HandlerQueue::new();
        for i in 0..3 {
            queue.register(&format!("{}", i), -i, recorder(&log, &format!("{}", i), false));
        }
        queue.run().unwrap();
        assert_eq!(*log.lock(), vec!["2", "1", "0"]);
    }

    #[test]
    fn failing_handler_skips_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = HandlerQueue::new();
        queue.register("error", 0, recorder(&log, "error", true));
        queue.register("normal", 1, recorder(&log, "normal", false));
        assert!(queue.run().is_err());
        assert_eq!(*log.lock(), vec!["error"]);
    }

    #[test]
    fn disabled_handlers_are_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = HandlerQueue::new();
        queue.register("first", 0, recorder(&log, "first", false));
        queue.register("second", 1, recorder(&log, "second", false));
        queue.disable("first");
        queue.run().unwrap();
        assert_eq!(*log.lock(), vec!["second"]);
    }

    #[test]
    fn duplicate_names_register_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = HandlerQueue::new();
        queue.register("only", 0, recorder(&log, "a", false));
        queue.register("only", 1, recorder(&log, "b", false));
        queue.run().unwrap();
        assert_eq!(*log.lock(), vec!["a"]);
    }
}
