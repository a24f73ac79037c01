//! Bring-up configuration.
//!
//! One plain struct, filled from defaults or parsed out of a
//! kernel-style `key=value` command line the same way the log level is.

use crate::exchange::ApLoopMode;

/// How strictly the SMM rendezvous synchronizes before dispatching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmmSyncMode {
    /// Every countable core must arrive before the dispatcher body runs.
    Traditional,
    /// The dispatcher body may run while stragglers are still arriving.
    Relaxed,
}

impl SmmSyncMode {
    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("traditional") {
            Some(SmmSyncMode::Traditional)
        } else if value.eq_ignore_ascii_case("relaxed") {
            Some(SmmSyncMode::Relaxed)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct MpConfig {
    /// Upper bound on logical processors this instance will drive.
    pub max_cores: usize,
    /// Per-AP stack size in bytes, multiple of 16.
    pub stack_size: usize,
    /// Grace window after the broadcast counting wake, in microseconds.
    pub startup_timeout_us: u64,
    /// Cadence of the periodic AP status poll, in microseconds.
    pub check_interval_us: u64,
    /// Budget of each SMM arrival window, in microseconds.
    pub smm_sync_timeout_us: u64,
    /// Starting SMM synchronization mode.
    pub smm_sync_mode: SmmSyncMode,
    /// Elect the SMM BSP per SMI instead of pinning it.
    pub bsp_election: bool,
    /// How APs park between dispatches.
    pub loop_mode: ApLoopMode,
}

impl Default for MpConfig {
    fn default() -> Self {
        Self {
            max_cores: 16,
            stack_size: 0x2000,
            startup_timeout_us: 50_000,
            check_interval_us: 0x10,
            smm_sync_timeout_us: 1_000,
            smm_sync_mode: SmmSyncMode::Traditional,
            bsp_election: false,
            loop_mode: ApLoopMode::HltLoop,
        }
    }
}

impl MpConfig {
    /// Parse overrides out of a command line. Unknown keys and malformed
    /// values are ignored; the defaults stand.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        for token in cmdline.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };
            match key {
                "mp.max_cores" => {
                    if let Some(n) = parse_number(value) {
                        if n > 0 {
                            config.max_cores = n as usize;
                        }
                    }
                }
                "mp.stack_size" => {
                    if let Some(n) = parse_number(value) {
                        if n > 0 && n % 16 == 0 {
                            config.stack_size = n as usize;
                        }
                    }
                }
                "mp.timeout_us" => {
                    if let Some(n) = parse_number(value) {
                        config.startup_timeout_us = n;
                    }
                }
                "mp.check_interval_us" => {
                    if let Some(n) = parse_number(value) {
                        config.check_interval_us = n;
                    }
                }
                "mp.smm_timeout_us" => {
                    if let Some(n) = parse_number(value) {
                        config.smm_sync_timeout_us = n;
                    }
                }
                "mp.sync" => {
                    if let Some(mode) = SmmSyncMode::from_str(value) {
                        config.smm_sync_mode = mode;
                    }
                }
                "mp.election" => {
                    if value.eq_ignore_ascii_case("on") {
                        config.bsp_election = true;
                    } else if value.eq_ignore_ascii_case("off") {
                        config.bsp_election = false;
                    }
                }
                "mp.loop" => {
                    if value.eq_ignore_ascii_case("hlt") {
                        config.loop_mode = ApLoopMode::HltLoop;
                    } else if value.eq_ignore_ascii_case("mwait") {
                        config.loop_mode = ApLoopMode::MwaitLoop;
                    } else if value.eq_ignore_ascii_case("run") {
                        config.loop_mode = ApLoopMode::RunLoop;
                    }
                }
                _ => {}
            }
        }
        config
    }
}

fn parse_number(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u64>().ok()
    }
}
