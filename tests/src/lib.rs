//! smpcore Test Suite
//!
//! This crate tests the coordination layer by directly including its
//! source files. This bypasses no_std restrictions while testing the
//! actual protocol logic.
//!
//! # How it works
//! 1. We define stub macros (kinfo!, kwarn!, etc.) that map to eprintln! or no-op
//! 2. We use `#[path = "..."]` to include library source files directly
//! 3. The `core::` references in library code work because std re-exports core
//!
//! This allows testing the real dispatch and rendezvous code without
//! firmware or a second machine.

// Re-export alloc crate for library code that uses alloc::vec etc.
extern crate alloc;

// ===========================================================================
// Logging macro stubs - these replace the library's macros for testing
// ===========================================================================

/// Stub for the library's kinfo! macro - prints to stderr in tests
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[INFO] {}", format_args!($($arg)*));
    }};
}

/// Stub for the library's kwarn! macro
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[WARN] {}", format_args!($($arg)*));
    }};
}

/// Stub for the library's kerror! macro
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[ERROR] {}", format_args!($($arg)*));
    }};
}

/// Stub for the library's kfatal! macro
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[FATAL] {}", format_args!($($arg)*));
    }};
}

/// Stub for the library's kdebug! macro - no-op in tests
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{}};
}

/// Stub for the library's ktrace! macro - no-op in tests (too verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{}};
}

// ===========================================================================
// Import library source files directly using #[path]
// ===========================================================================

#[path = "../../src/error.rs"]
pub mod error;

#[path = "../../src/sync.rs"]
pub mod sync;

#[path = "../../src/timeout.rs"]
pub mod timeout;

#[path = "../../src/hal.rs"]
pub mod hal;

#[path = "../../src/logger.rs"]
pub mod logger;

#[path = "../../src/config.rs"]
pub mod config;

#[path = "../../src/exchange.rs"]
pub mod exchange;

#[path = "../../src/regtable.rs"]
pub mod regtable;

#[path = "../../src/types.rs"]
pub mod types;

#[path = "../../src/apic.rs"]
pub mod apic;

#[path = "../../src/wake.rs"]
pub mod wake;

#[path = "../../src/analysis.rs"]
pub mod analysis;

#[path = "../../src/services.rs"]
pub mod services;

#[path = "../../src/orchestrator.rs"]
pub mod orchestrator;

#[cfg(feature = "smm")]
#[path = "../../src/smm/mod.rs"]
pub mod smm;

// ===========================================================================
// Hardware-level mocks (simulate the machine, NOT library functionality)
// ===========================================================================


// ===========================================================================
// Test modules
// ===========================================================================
