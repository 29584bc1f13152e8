use std::collections::VecDeque;
use std::io::{stdin, stdout, Read, Write};

#[cfg(unix)]
use termios::*;

#[cfg(unix)]
const STDIN_FD: i32 = 0;

/// Outcome of a non-blocking console read: nothing available right
/// now, the input stream has ended for good, or a character.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ConsoleRead {
    None,
    Eof,
    Char(u8),
}

/// Console source/sink for the emulated UART. Puts the host terminal in
/// raw non-blocking mode so single keystrokes reach the guest, and
/// restores the original settings on drop. A piped stdin works too:
/// readiness is polled, so a script feeds the guest until the pipe
/// closes, which reads as end of input rather than "no key yet".
///
/// Input is drained from stdin into a queue; `queue_char` lets the host
/// inject characters ahead of the keyboard (auto-boot strings). LF is
/// mapped to CR on the way out, as CP/M expects.
pub struct Console {
    #[cfg(unix)]
    initial_termios: Option<Termios>,
    stdin_enabled: bool,
    queue: VecDeque<u8>,
    eof: bool,
    consecutive_ctrl_c: u8,
    /// Set after three consecutive Ctrl+C; the outer loop exits cleanly.
    pub quit_requested: bool,
    /// Byte diverted to the host when seen in the input stream — the
    /// hook point a debug console attaches to. None passes everything
    /// through to the guest.
    pub escape_char: Option<u8>,
    /// Set when the escape character was seen and consumed.
    pub escape_requested: bool,
}

impl Console {
    pub fn new() -> Console {
        #[cfg(unix)]
        let initial_termios = Termios::from_fd(STDIN_FD).ok();

        let console = Console {
            #[cfg(unix)]
            initial_termios,
            stdin_enabled: true,
            queue: VecDeque::new(),
            eof: false,
            consecutive_ctrl_c: 0,
            quit_requested: false,
            escape_char: None,
            escape_requested: false,
        };
        console.setup_host_terminal();
        console
    }

    /// Console with host stdin detached: input comes only from queued
    /// characters. For embedding hosts and tests.
    #[allow(dead_code)]
    pub fn detached() -> Console {
        Console {
            #[cfg(unix)]
            initial_termios: None,
            stdin_enabled: false,
            queue: VecDeque::new(),
            eof: false,
            consecutive_ctrl_c: 0,
            quit_requested: false,
            escape_char: None,
            escape_requested: false,
        }
    }

    #[cfg(unix)]
    fn setup_host_terminal(&self) {
        if let Some(mut raw) = self.initial_termios {
            raw.c_iflag &= !(IXON | ICRNL);
            raw.c_lflag &= !(ISIG | ECHO | ICANON | IEXTEN);
            raw.c_cc[VMIN] = 0;
            raw.c_cc[VTIME] = 0;
            let _ = tcsetattr(STDIN_FD, TCSANOW, &raw);
        }
    }

    #[cfg(not(unix))]
    fn setup_host_terminal(&self) {}

    /// Drain whatever stdin has buffered into the input queue without
    /// blocking. A stream that polls readable but reads zero bytes has
    /// closed; that is recorded as end of input, distinct from an empty
    /// poll. Escape bytes are diverted before queueing, and consecutive
    /// Ctrl+C feeds the exit latch (those still reach the guest).
    pub fn consume_input(&mut self) {
        if !self.stdin_enabled || self.eof || !stdin_ready() {
            return;
        }
        let mut buf = [0u8; 100];
        let size = stdin().read(&mut buf).unwrap_or(0);
        if size == 0 {
            self.eof = true;
            return;
        }
        for &b in &buf[..size] {
            if self.check_escape(b) {
                continue;
            }
            if b == 0x03 {
                self.consecutive_ctrl_c += 1;
                if self.consecutive_ctrl_c >= 3 {
                    self.quit_requested = true;
                }
            } else {
                self.consecutive_ctrl_c = 0;
            }
            self.queue.push_back(b);
        }
    }

    /// Check one input byte against the configured escape character.
    /// Returns true when the byte was diverted to the host instead of
    /// the guest. With no escape configured every byte flows through.
    pub fn check_escape(&mut self, byte: u8) -> bool {
        if self.escape_char == Some(byte) {
            self.escape_requested = true;
            return true;
        }
        false
    }

    pub fn has_input(&mut self) -> bool {
        if self.queue.is_empty() {
            self.consume_input();
        }
        !self.queue.is_empty()
    }

    /// True once the underlying input stream has closed and the queue
    /// can never refill from it.
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Mark the input stream as ended. Embedding hosts call this when
    /// their input source is exhausted; queued characters still drain
    /// first.
    pub fn close_input(&mut self) {
        self.eof = true;
    }

    /// Non-blocking read distinguishing "no key yet" from a closed
    /// input stream.
    pub fn read_char(&mut self) -> ConsoleRead {
        if self.queue.is_empty() {
            self.consume_input();
        }
        match self.queue.pop_front() {
            Some(ch) => ConsoleRead::Char(if ch == b'\n' { b'\r' } else { ch }),
            None if self.eof => ConsoleRead::Eof,
            None => ConsoleRead::None,
        }
    }

    /// Inject a character ahead of keyboard input (auto-boot strings,
    /// embedding hosts).
    pub fn queue_char(&mut self, ch: u8) {
        self.queue.push_back(ch);
    }

    /// Queue a whole command followed by CR, as if typed at the boot prompt.
    pub fn queue_line(&mut self, line: &str) {
        for ch in line.bytes() {
            self.queue_char(ch);
        }
        self.queue_char(b'\r');
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub fn write_char(&mut self, ch: u8) {
        let mut out = stdout();
        let _ = out.write_all(&[ch & 0x7F]);
        let _ = out.flush();
    }

    pub fn write_str(&mut self, s: &str) {
        for ch in s.bytes() {
            self.write_char(ch);
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(initial) = self.initial_termios {
            let _ = tcsetattr(STDIN_FD, TCSANOW, &initial);
        }
    }
}

/// Zero-timeout readability poll on stdin. Reports true for pending
/// bytes and for hangup, so a closed pipe is noticed by the zero-byte
/// read that follows.
#[cfg(unix)]
fn stdin_ready() -> bool {
    let mut fds = libc::pollfd {
        fd: STDIN_FD,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut fds, 1, 0) > 0 }
}

#[cfg(not(unix))]
fn stdin_ready() -> bool {
    false
}
