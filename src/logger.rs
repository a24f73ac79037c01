use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);
static BOOT_COUNTER: AtomicU64 = AtomicU64::new(0);
static COUNTER_FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());

/// Output sink. The crate owns no console; the embedder registers one
/// line-oriented writer and we format into a stack buffer before handing
/// the line over.
pub type LogSink = fn(&str);

static SINK: AtomicUsize = AtomicUsize::new(0);

const LINE_BUFFER_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    PANIC,
    FATAL,
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::PANIC => "PANIC",
            LogLevel::FATAL => "FATAL",
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    pub const fn priority(self) -> u8 {
        match self {
            LogLevel::PANIC => 0,
            LogLevel::FATAL => 1,
            LogLevel::ERROR => 2,
            LogLevel::WARN => 3,
            LogLevel::INFO => 4,
            LogLevel::DEBUG => 5,
            LogLevel::TRACE => 6,
        }
    }

    pub fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::PANIC,
            1 => LogLevel::FATAL,
            2 => LogLevel::ERROR,
            3 => LogLevel::WARN,
            4 => LogLevel::INFO,
            5 => LogLevel::DEBUG,
            _ => LogLevel::TRACE,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("panic") {
            Some(LogLevel::PANIC)
        } else if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::FATAL)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::ERROR)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::WARN)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::INFO)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::DEBUG)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::TRACE)
        } else if let Ok(priority) = value.parse::<u8>() {
            if priority <= LogLevel::TRACE.priority() {
                Some(LogLevel::from_priority(priority))
            } else {
                None
            }
        } else {
            None
        }
    }
}

/// Register the output sink and the time base. `counter_now` is the
/// monotonic counter at the moment logging starts; `counter_hz` may be 0
/// when no calibrated frequency is available, timestamps then read 0.
pub fn init(sink: LogSink, counter_now: u64, counter_hz: u64) {
    if LOGGER_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    BOOT_COUNTER.store(counter_now, Ordering::Relaxed);
    COUNTER_FREQUENCY_HZ.store(counter_hz, Ordering::Relaxed);
    SINK.store(sink as usize, Ordering::SeqCst);
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.load(Ordering::Relaxed)
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    let current = LOG_LEVEL.load(Ordering::Relaxed);
    if level.priority() > current {
        return;
    }

    let sink = SINK.load(Ordering::Acquire);
    if sink == 0 {
        return;
    }
    // Registered via `init` from a plain fn item.
    let sink: LogSink = unsafe { core::mem::transmute(sink) };

    let mut line = LineBuffer::new();
    let _ = write!(
        line,
        "[{timestamp}] [{level:<5}] {message}",
        timestamp = TimestampDisplay {
            microseconds: elapsed_us(),
        },
        level = level.as_str(),
        message = args,
    );
    sink(line.as_str());
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Scan a kernel-style command line for `log=` / `loglevel=` directives.
pub fn parse_level_directive(cmdline: &str) -> Option<LogLevel> {
    for token in cmdline.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("log") || key.eq_ignore_ascii_case("loglevel") {
                if let Some(level) = LogLevel::from_str(value) {
                    return Some(level);
                }
            }
        }
    }
    None
}

/// Hand the logger fresh counter readings once the frequency is calibrated.
pub fn set_time_base(counter_now: u64, counter_hz: u64) {
    BOOT_COUNTER.store(counter_now, Ordering::Relaxed);
    COUNTER_FREQUENCY_HZ.store(counter_hz, Ordering::Relaxed);
}

/// The counter sample used for timestamping. The embedder's sink may call
/// this back with the current counter to get elapsed time; without it the
/// logger only knows the boot sample.
static LAST_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn touch_counter(counter_now: u64) {
    LAST_COUNTER.store(counter_now, Ordering::Relaxed);
}

fn elapsed_us() -> u64 {
    let start = BOOT_COUNTER.load(Ordering::Relaxed);
    let freq = COUNTER_FREQUENCY_HZ.load(Ordering::Relaxed);
    let now = LAST_COUNTER.load(Ordering::Relaxed);
    if freq == 0 || now <= start {
        return 0;
    }
    let ticks = now - start;
    ticks.saturating_mul(1_000_000) / freq
}

struct TimestampDisplay {
    microseconds: u64,
}

impl fmt::Display for TimestampDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.microseconds / 1_000_000;
        let fraction = self.microseconds % 1_000_000;
        write!(f, "{:5}.{:06}", seconds, fraction)
    }
}

struct LineBuffer {
    buf: [u8; LINE_BUFFER_SIZE],
    len: usize,
}

impl LineBuffer {
    fn new() -> Self {
        Self {
            buf: [0; LINE_BUFFER_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Only ever filled through `write_str` with valid UTF-8.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = LINE_BUFFER_SIZE - self.len;
        let take = s.len().min(remaining);
        // Truncate on a char boundary so as_str stays valid UTF-8.
        let mut take = take;
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}
