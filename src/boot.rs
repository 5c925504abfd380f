//! Boot controller: entry decision, update loop, application handoff.
//!
//! On reset the board glue asks [`should_enter`] whether to stay in the
//! bootloader. If so it brings up USB and hands the device to [`run`],
//! which drives the DFU class and its flash worker until a download
//! completes or the host goes quiet. If not, it confirms the resident
//! image once more and transfers control with [`jump_to_application`].

use usb_device::bus::UsbBus;
use usb_device::device::UsbDevice;

use crate::class::DfuClass;
use crate::config::{
    BOOTLOADER_MAGIC, BOOTLOADER_MAGIC_ADDR, BOOTLOADER_TIMEOUT_MS, MAIN_LOOP_PERIOD_MS,
};
use crate::flash::FlashBus;
use crate::header::validate_app;
use crate::timeout::InactivityTimeout;

/// Platform services the bootloader needs from the board and its RTOS.
///
/// Everything behind this trait is external to the bootloader core:
/// the system time base, the scheduler, the board's button wiring, the
/// reset controller, and the raw views of RAM and flash. On hardware
/// the implementations are one-liners over the HAL and
/// [`read_magic_cell`]/[`clear_magic_cell`]; on the host they are plain
/// test doubles.
pub trait Board {
    /// Monotonic system time in milliseconds. Wrapping is fine; only
    /// differences are ever taken.
    fn now_ms(&self) -> u32;

    /// Sleep for at least `ms` milliseconds, yielding to whatever else
    /// runs on the system.
    fn sleep_ms(&mut self, ms: u32);

    /// Whether the user button was held at reset. The line is active
    /// low and externally pulled up; implementations report the
    /// logical "pressed" state.
    fn button_pressed(&self) -> bool;

    /// Read the firmware-update mailbox word at the top of RAM.
    fn reentry_magic(&self) -> u32;

    /// Clear the firmware-update mailbox word.
    fn clear_reentry_magic(&mut self);

    /// The application region of flash, header first.
    fn app_region(&self) -> &[u8];

    /// Reset the system. Does not return.
    fn system_reset(&self) -> !;
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RunExit {
    /// A firmware download completed; the caller should system-reset
    /// into the new image.
    Reboot,
    /// The host went quiet and a valid application is resident; the
    /// caller should validate once more and jump to it.
    LaunchApplication,
}

/// Decide whether to stay in the bootloader.
///
/// True if any of the following holds:
/// 1. the application left [`BOOTLOADER_MAGIC`] in the RAM mailbox —
///    consumed here, so the request is one-shot;
/// 2. the resident application does not validate;
/// 3. the user button was held at reset.
pub fn should_enter<P: Board>(board: &mut P) -> bool {
    if board.reentry_magic() == BOOTLOADER_MAGIC {
        board.clear_reentry_magic();
        return true;
    }

    if !validate_app(board.app_region()) {
        return true;
    }

    board.button_pressed()
}

/// Drive the DFU session until an exit condition.
///
/// Each iteration polls the USB device, runs the deferred flash
/// worker, and re-arms the inactivity deadline on any sign of the
/// host. Exits with [`RunExit::Reboot`] once a download completes.
/// When the deadline expires the loop exits with
/// [`RunExit::LaunchApplication`] if a valid application is resident,
/// and otherwise re-arms and keeps waiting — with nothing to boot
/// there is nowhere else to go.
///
/// The caller owns the irreversible follow-up: a system reset after
/// `Reboot`, or validate-and-jump (falling back to a fresh DFU
/// session) after `LaunchApplication`. On boards where the USB
/// interrupt already polls the device, the poll here simply never has
/// work to do.
pub fn run<B: UsbBus, F: FlashBus, P: Board>(
    usb_dev: &mut UsbDevice<B>,
    dfu: &mut DfuClass<B, F>,
    board: &mut P,
) -> RunExit {
    let mut deadline = InactivityTimeout::new(BOOTLOADER_TIMEOUT_MS);
    deadline.init(board.now_ms());

    loop {
        usb_dev.poll(&mut [&mut *dfu]);

        let worked = dfu.process();
        if worked || dfu.take_activity() {
            deadline.reset(board.now_ms());
        }

        if dfu.download_complete() {
            return RunExit::Reboot;
        }

        if deadline.expired(board.now_ms()) {
            if validate_app(board.app_region()) {
                return RunExit::LaunchApplication;
            }
            deadline.reset(board.now_ms());
        }

        board.sleep_ms(MAIN_LOOP_PERIOD_MS);
    }
}

/// Read the firmware-update mailbox word.
///
/// # Safety
///
/// Dereferences [`BOOTLOADER_MAGIC_ADDR`]; only meaningful on the
/// target, where that address is the last word of RAM.
pub unsafe fn read_magic_cell() -> u32 {
    core::ptr::read_volatile(BOOTLOADER_MAGIC_ADDR as *const u32)
}

/// Clear the firmware-update mailbox word.
///
/// # Safety
///
/// See [`read_magic_cell`].
pub unsafe fn clear_magic_cell() {
    core::ptr::write_volatile(BOOTLOADER_MAGIC_ADDR as *mut u32, 0);
}

/// Transfer control to the application whose vector table is at
/// `vector_table`.
///
/// Relocates VTOR, loads the initial stack pointer and reset handler
/// from the first two vector entries, masks interrupts, installs the
/// stack and tail-calls the reset handler. Never returns; the
/// application owns the machine from here.
///
/// # Safety
///
/// `vector_table` must point at a valid Cortex-M vector table in
/// flash — in practice `APP_BASE + APP_VECTOR_TABLE_OFFSET` after
/// [`validate_app`](crate::header::validate_app) has passed. The
/// caller must have quiesced any peripherals it started; interrupts
/// are disabled here and it is up to the application to re-enable
/// them.
pub unsafe fn jump_to_application(vector_table: u32) -> ! {
    cortex_m::interrupt::disable();

    let scb = &*cortex_m::peripheral::SCB::PTR;
    scb.vtor.write(vector_table);

    let stack = core::ptr::read_volatile(vector_table as *const u32);
    let entry = core::ptr::read_volatile((vector_table + 4) as *const u32);

    cortex_m::register::msp::write(stack);

    let reset_handler = core::mem::transmute::<usize, extern "C" fn() -> !>(entry as usize);
    reset_handler()
}
