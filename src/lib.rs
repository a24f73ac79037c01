//! smpcore - CPU bring-up and multiprocessor coordination.
//!
//! This crate implements the multiprocessor plumbing a platform firmware
//! needs between reset and OS handoff: the INIT-SIPI-SIPI wake protocol
//! with its fixed-layout exchange region, per-core register programming
//! tables, the three-phase boot orchestrator, the MP services dispatch
//! surface (startup-all/this, BSP switch, enable/disable), and the SMM
//! rendezvous engine with its two-window arrival protocol.
//!
//! All hardware access goes through the [`hal::CpuHal`] trait; the crate
//! ships an x86 backend and the protocol layer itself is host-testable.
//! Protocol state lives in explicit context structs ([`types::MpContext`],
//! [`smm::SmmSync`]) passed by reference - there is no global mutable
//! protocol state.

#![no_std]

extern crate alloc;

pub mod analysis;
pub mod apic;
pub mod config;
pub mod error;
pub mod exchange;
pub mod hal;
pub mod logger;
pub mod orchestrator;
pub mod regtable;
pub mod services;
#[cfg(feature = "smm")]
pub mod smm;
pub mod sync;
pub mod timeout;
pub mod types;
pub mod wake;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86;

// ============================================================================
// Logging macros
// ============================================================================

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
