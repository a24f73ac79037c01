//! INIT-SIPI-SIPI wake protocol.
//!
//! Two flavors of wake exist: the broadcast counting wake that first
//! discovers the APs (each arrival claims a BIST slot while `init_flag`
//! is up), and directed wakes used afterwards for dispatch in hlt-loop
//! mode, for resetting a stuck core, and for relocating the exchange
//! buffer.

use core::sync::atomic::Ordering;

use crate::exchange::{ApLoopMode, ExchangeRegion};
use crate::hal::CpuHal;
use crate::timeout::Timeout;
use crate::types::{MpContext, Procedure};

/// INIT assert-to-SIPI settle time.
pub const INIT_DELAY_US: u64 = 10_000;
/// Gap between the two SIPIs.
pub const SIPI_GAP_US: u64 = 200;

/// Startup vector of the wakeup buffer; SIPI vectors address 4K pages.
pub fn startup_vector(exchange: &ExchangeRegion) -> u8 {
    (exchange.info.buffer_start >> 12) as u8
}

fn init_sipi_sipi_broadcast(hal: &dyn CpuHal, vector: u8) {
    hal.send_init_broadcast();
    hal.delay_us(INIT_DELAY_US);
    hal.send_startup_broadcast(vector);
    hal.delay_us(SIPI_GAP_US);
    hal.send_startup_broadcast(vector);
}

/// Directed INIT-SIPI-SIPI to one core.
pub fn wake_targeted(hal: &dyn CpuHal, apic_id: u32, vector: u8) {
    hal.send_init(apic_id);
    hal.delay_us(INIT_DELAY_US);
    hal.send_startup(apic_id, vector);
    hal.delay_us(SIPI_GAP_US);
    hal.send_startup(apic_id, vector);
}

/// Broadcast counting wake. Raises `init_flag`, wakes everything, waits
/// out the grace window, then lowers the flag so late arrivals take the
/// directed path. Returns how many APs checked in.
pub fn wake_broadcast_and_count(hal: &dyn CpuHal, exchange: &ExchangeRegion, grace_us: u64) -> u32 {
    let info = &exchange.info;
    info.ap_count.store(0, Ordering::Release);
    info.init_flag.store(1, Ordering::Release);

    init_sipi_sipi_broadcast(hal, startup_vector(exchange));

    // Fixed grace window; a core that misses it is treated as absent
    // rather than waited for.
    hal.delay_us(grace_us);
    info.init_flag.store(0, Ordering::Release);

    info.ap_count.load(Ordering::Acquire)
}

/// Queue `procedure` on AP `index` and kick it per its loop mode:
/// halted APs need the full IPI sequence, monitor/run loops just get
/// their signal word armed.
pub fn wake_ap(
    hal: &dyn CpuHal,
    ctx: &MpContext,
    index: usize,
    procedure: Option<Procedure>,
    argument: usize,
) {
    {
        let mut slot = ctx.cpus[index].slot.lock();
        slot.procedure = procedure;
        slot.argument = argument;
        slot.finished = false;
    }

    match crate::types::loop_mode_of(&ctx.exchange.info.loop_mode) {
        ApLoopMode::HltLoop => {
            wake_targeted(hal, ctx.apic_id_of(index), startup_vector(&ctx.exchange));
        }
        ApLoopMode::MwaitLoop | ApLoopMode::RunLoop => {
            ctx.exchange.signal_ap(index);
        }
    }
}

/// Move the exchange buffer. The far jump in the trampoline page is
/// redirected first, then every parked AP is re-woken so none keeps
/// running out of the old buffer, counted back in under the serialize
/// lock.
pub fn relocate_exchange(hal: &dyn CpuHal, ctx: &mut MpContext, new_buffer_start: u32) {
    ctx.serialize.acquire();
    hal.patch_trampoline_target(new_buffer_start);
    ctx.exchange.info.buffer_start = new_buffer_start;

    let expected = (ctx.cpus.len().saturating_sub(1)) as u32;
    let info = &ctx.exchange.info;
    info.ap_count.store(0, Ordering::Release);
    info.init_flag.store(1, Ordering::Release);
    init_sipi_sipi_broadcast(hal, startup_vector(&ctx.exchange));

    let mut timeout = Timeout::start(hal, ctx.config.startup_timeout_us);
    while ctx.exchange.info.ap_count.load(Ordering::Acquire) < expected
        && !timeout.expired(hal)
    {
        hal.pause();
    }
    ctx.exchange.info.init_flag.store(0, Ordering::Release);
    ctx.serialize.release();

    crate::kinfo!(
        "MP: exchange buffer relocated to {:#x}, {} APs re-homed",
        new_buffer_start,
        ctx.exchange.info.ap_count.load(Ordering::Acquire)
    );
}

/// Switch every parked AP to `new_mode`. Run at ready-to-boot so the OS
/// inherits APs in the loop the platform promised.
pub fn upgrade_loop_mode(hal: &dyn CpuHal, ctx: &MpContext, new_mode: ApLoopMode) {
    ctx.serialize.acquire();
    let previous = crate::types::loop_mode_of(&ctx.exchange.info.loop_mode);
    ctx.exchange
        .info
        .loop_mode
        .store(new_mode as u32, Ordering::Release);

    let bsp = ctx.bsp_index();
    for index in 0..ctx.cpus.len() {
        if index == bsp {
            continue;
        }
        let monitor = ctx.exchange.monitor(index);
        monitor.loop_mode.store(new_mode as u32, Ordering::Release);
        monitor.ready_to_boot.store(1, Ordering::Release);
    }

    // Wake everyone once so the parked loops re-read their mode.
    match previous {
        ApLoopMode::HltLoop => {
            init_sipi_sipi_broadcast(hal, startup_vector(&ctx.exchange));
        }
        ApLoopMode::MwaitLoop | ApLoopMode::RunLoop => {
            for index in 0..ctx.cpus.len() {
                if index != bsp {
                    ctx.exchange.signal_ap(index);
                }
            }
        }
    }
    ctx.serialize.release();

    crate::kinfo!("MP: AP loop mode upgraded to {:?}", new_mode);
}
