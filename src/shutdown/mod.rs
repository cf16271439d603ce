use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGUSR1};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Process-wide stop flag raised by SIGINT, SIGTERM, SIGUSR1 or by
/// [`ShutdownHooks::trigger`].
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let mut sig_ids = Vec::with_capacity(3);
            for signal in [SIGINT, SIGTERM, SIGUSR1] {
                sig_ids.push(flag::register(signal, Arc::clone(&triggered))?);
            }
            return Ok(Self { triggered, sig_ids });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    /// Shared handle for code that raises the flag from another thread.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.triggered)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::ShutdownHooks;

    #[test]
    fn trigger_and_shared_flag_raise_shutdown() {
        let hooks = ShutdownHooks::install().expect("hooks should install");
        assert!(!hooks.is_triggered());

        hooks.flag().store(true, Ordering::SeqCst);
        assert!(hooks.is_triggered());

        let hooks = ShutdownHooks::install().expect("hooks should install");
        hooks.trigger();
        assert!(hooks.is_triggered());
    }
}
