// Process-wide abort signaling and the raw-terminal console listener.
//
// The abort flag is a cooperative cancellation token: any component may
// request an abort, every long-running wait polls it at a bounded interval.
// The listener thread is the only reader of the keyboard; it assembles
// command lines itself so that the space key can double as the emergency
// stop while motion is in progress.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvError, Sender};
use std::thread;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tracing::{debug, warn};

/// Shared cancellation token.
///
/// Cloning is cheap; all clones observe the same flags. `abort` is sticky
/// until explicitly cleared, `enter` is edge-triggered and consumed once.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    abort: AtomicBool,
    enter: AtomicBool,
    // True while the interpreter is executing commands; the listener only
    // maps the space key to an abort in that window so that spaces can
    // still be typed at the idle prompt.
    busy: AtomicBool,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        self.inner.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.inner.abort.load(Ordering::SeqCst)
    }

    pub fn clear_abort(&self) {
        self.inner.abort.store(false, Ordering::SeqCst);
    }

    pub fn press_enter(&self) {
        self.inner.enter.store(true, Ordering::SeqCst);
    }

    /// One-shot read of the enter flag.
    pub fn consume_enter(&self) -> bool {
        self.inner.enter.swap(false, Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Sleep for `total`, waking every `chunk` to poll the abort flag.
    ///
    /// Returns false if the wait was cut short by an abort.
    pub fn wait_or_abort(&self, total: Duration, chunk: Duration) -> bool {
        let mut waited = Duration::ZERO;
        while waited < total {
            if self.abort_requested() {
                return false;
            }
            let step = chunk.min(total - waited);
            thread::sleep(step);
            waited += step;
        }
        !self.abort_requested()
    }
}

/// Input events delivered by the console listener.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleEvent {
    Line(String),
    Eof,
}

/// Raw-mode keyboard listener.
///
/// Runs for the process lifetime and is never joined; only the terminal
/// mode is restored at shutdown (see [`restore_terminal`]).
pub struct ConsoleListener {
    rx: Receiver<ConsoleEvent>,
}

impl ConsoleListener {
    pub fn spawn(abort: AbortSignal) -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("console-listener".into())
            .spawn(move || listen_loop(abort, tx))?;
        Ok(Self { rx })
    }

    /// Block until the next console event. `Eof` is also returned if the
    /// listener thread is gone.
    pub fn recv(&self) -> ConsoleEvent {
        match self.rx.recv() {
            Ok(ev) => ev,
            Err(RecvError) => ConsoleEvent::Eof,
        }
    }

    /// Non-blocking poll for queued input.
    pub fn try_recv(&self) -> Option<ConsoleEvent> {
        self.rx.try_recv().ok()
    }
}

fn listen_loop(abort: AbortSignal, tx: Sender<ConsoleEvent>) {
    let mut line = String::new();
    loop {
        match event::poll(Duration::from_millis(50)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("console poll failed: {e}");
                break;
            }
        }
        let ev = match event::read() {
            Ok(ev) => ev,
            Err(e) => {
                warn!("console read failed: {e}");
                break;
            }
        };
        let Event::Key(key) = ev else { continue };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char(' ') if abort.is_busy() => {
                debug!("space pressed during motion, requesting abort");
                abort.request_abort();
            }
            KeyCode::Char('d') | KeyCode::Char('c')
                if key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                let _ = tx.send(ConsoleEvent::Eof);
                break;
            }
            KeyCode::Char(c) => {
                line.push(c);
                echo(&c.to_string());
            }
            KeyCode::Backspace => {
                if line.pop().is_some() {
                    echo("\x08 \x08");
                }
            }
            KeyCode::Enter => {
                abort.press_enter();
                echo("\r\n");
                if tx.send(ConsoleEvent::Line(std::mem::take(&mut line))).is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
}

// Raw mode disables local echo; print what the operator types.
fn echo(s: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(s.as_bytes());
    let _ = out.flush();
}

/// Put the terminal back the way we found it. Safe to call more than once.
pub fn restore_terminal() {
    let _ = terminal::disable_raw_mode();
}

/// Operator-facing console output. Raw mode leaves output post-processing
/// disabled, so a bare `\n` would not return the carriage.
#[macro_export]
macro_rules! cprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        let _ = write!(out, $($arg)*);
        let _ = out.write_all(b"\r\n");
        let _ = out.flush();
    }};
}

/// Prompt without a trailing newline.
#[macro_export]
macro_rules! cprint {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        let _ = write!(out, $($arg)*);
        let _ = out.flush();
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn abort_is_sticky_until_cleared() {
        let sig = AbortSignal::new();
        assert!(!sig.abort_requested());
        sig.request_abort();
        assert!(sig.abort_requested());
        assert!(sig.abort_requested(), "abort must not self-clear");
        sig.clear_abort();
        assert!(!sig.abort_requested());
    }

    #[test]
    fn enter_is_consumed_once() {
        let sig = AbortSignal::new();
        assert!(!sig.consume_enter());
        sig.press_enter();
        assert!(sig.consume_enter());
        assert!(!sig.consume_enter());
    }

    #[test]
    fn clones_share_flags() {
        let sig = AbortSignal::new();
        let other = sig.clone();
        other.request_abort();
        assert!(sig.abort_requested());
    }

    #[test]
    fn wait_or_abort_runs_full_duration_when_clear() {
        let sig = AbortSignal::new();
        let start = Instant::now();
        assert!(sig.wait_or_abort(Duration::from_millis(40), Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn wait_or_abort_observes_abort_at_next_poll() {
        let sig = AbortSignal::new();
        let waiter = sig.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let finished = waiter.wait_or_abort(Duration::from_secs(10), Duration::from_millis(10));
            (finished, start.elapsed())
        });
        thread::sleep(Duration::from_millis(30));
        sig.request_abort();
        let (finished, elapsed) = handle.join().unwrap();
        assert!(!finished);
        assert!(
            elapsed < Duration::from_secs(1),
            "abort must terminate the wait within a polling interval, took {elapsed:?}"
        );
    }
}
