//! Foreground detection for a terminal host.
//!
//! A terminal drawer is "backgrounded" while its job is stopped (Ctrl-Z) and
//! regains the foreground on `SIGCONT`. The stream may have missed chunks in
//! between, so a resume is reported to the drawer as a background→foreground
//! transition, which triggers a hydration.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::drawer::{DrawerEvent, Visibility};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[cfg(unix)]
mod imp {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    static RESUMED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigcont(_signal: libc::c_int) {
        RESUMED.store(true, Ordering::SeqCst);
    }

    pub fn install() -> io::Result<()> {
        let handler = on_sigcont as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only stores to an atomic, which is signal-safe.
        let previous = unsafe { libc::signal(libc::SIGCONT, handler) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn take_resumed() -> bool {
        RESUMED.swap(false, Ordering::SeqCst)
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    pub fn install() -> io::Result<()> {
        Ok(())
    }

    pub fn take_resumed() -> bool {
        false
    }
}

/// Install the resume handler. No-op where job control does not exist.
pub fn install_resume_handler() -> io::Result<()> {
    imp::install()
}

/// Whether a resume was seen since the last call.
pub fn take_resumed() -> bool {
    imp::take_resumed()
}

/// Events that report one stop/resume cycle to the drawer.
pub fn resume_events() -> [DrawerEvent; 2] {
    [
        DrawerEvent::Visibility(Visibility::Background),
        DrawerEvent::Visibility(Visibility::Foreground),
    ]
}

/// Poll for resumes until `stop` is raised or the drawer goes away.
pub fn spawn_resume_watcher(
    tx: Sender<DrawerEvent>,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    install_resume_handler()?;
    thread::Builder::new()
        .name("drawer-foreground".to_string())
        .spawn(move || {
            debug!("foreground watcher started");
            while !stop.load(Ordering::Relaxed) {
                if take_resumed() {
                    info!("resumed from job-control stop");
                    for event in resume_events() {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_is_a_background_then_foreground_transition() {
        let [first, second] = resume_events();
        assert!(matches!(first, DrawerEvent::Visibility(Visibility::Background)));
        assert!(matches!(second, DrawerEvent::Visibility(Visibility::Foreground)));
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn sigcont_marks_resumed_once() {
        install_resume_handler().unwrap();
        take_resumed();

        // SAFETY: SIGCONT to a running process only invokes our handler.
        let rc = unsafe { libc::raise(libc::SIGCONT) };
        assert_eq!(rc, 0);

        assert!(take_resumed());
        assert!(!take_resumed());
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn watcher_forwards_resume_and_stops() {
        let (tx, rx) = std::sync::mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_resume_watcher(tx, Arc::clone(&stop)).unwrap();
        take_resumed();

        // SAFETY: as above.
        unsafe { libc::raise(libc::SIGCONT) };

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(first, DrawerEvent::Visibility(Visibility::Background)));
        assert!(matches!(second, DrawerEvent::Visibility(Visibility::Foreground)));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
