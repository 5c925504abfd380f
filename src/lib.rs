#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! USB DFU bootloader core for a `usb-device` device.
//!
//! ## About
//!
//! This crate is the core of a flash-resident bootloader for small
//! Cortex-M0+ parts: the reserved low 16 KiB of flash holds the
//! bootloader, the rest holds an application image led by a 32-byte
//! header with a CRC32 over the firmware body. On reset the bootloader
//! decides whether to start the application or enter update mode; in
//! update mode it enumerates as a USB DFU 1.1 device with the DFUSe
//! address-pointer/erase extensions (as specified by AN3156 by
//! STMicroelectronics), receives a new image over EP0, programs it,
//! and reboots into it.
//!
//! The crate owns the pieces with hard contracts between them:
//!
//! * the DFU protocol state machine ([`class::DfuClass`]), including
//!   the `DFU_GETSTATUS`/`bwPollTimeout` synchronization dance;
//! * the flash programming engine ([`flash::Flash`]): unlock keys,
//!   page erase, verified double-word programming;
//! * boot decision, image validation and the application handoff
//!   ([`boot`], [`header`]).
//!
//! Everything the target owns — clocks, the USB bus, GPIO, the system
//! timer, reset — stays behind narrow seams ([`boot::Board`],
//! [`flash::FlashBus`], `usb-device`'s `UsbBus`), which is also what
//! makes the whole protocol and engine testable off-target.
//!
//! ### Supported operations
//!
//! * Write (host to device) — download command
//! * DFUSe Set Address Pointer (`0x21`) and Erase (`0x41`)
//!
//! ### Not supported operations
//!
//! * Read (device to host) — upload is rejected
//! * Read Unprotect
//!
//! ### Limitations
//!
//! * The advertised `wTransferSize` is 1024 bytes, but a single
//!   control transfer through stock `usb-device` is limited by its
//!   control buffer (128 bytes by default). Hosts that use shorter
//!   data blocks work unchanged because writes advance sequentially by
//!   the received length.
//!
//! * iString in `DFU_GETSTATUS` is always `0`.
//!
//! ## DFU utilities
//!
//! Any DFUSe-aware host tool can drive the device, for example
//! [dfu-util](http://dfu-util.sourceforge.net/).
//!
//! ## Example
//!
//! The example focuses on the reset-time flow; bringing up the USB bus
//! and implementing [`boot::Board`] for a target is board-support
//! work.
//!
//! ```no_run
//! use usb_device::prelude::*;
//! use usbd_dfu_boot::*;
//! #
//! # use usb_device::bus::UsbBusAllocator;
//! #
//! # pub struct DummyUsbBus { }
//! # impl usb_device::bus::UsbBus for DummyUsbBus {
//! #     fn alloc_ep(&mut self, _: usb_device::UsbDirection, _: Option<usb_device::endpoint::EndpointAddress>,
//! #                 _: usb_device::endpoint::EndpointType, _: u16, _: u8) -> usb_device::Result<usb_device::endpoint::EndpointAddress> { todo!() }
//! #     fn enable(&mut self) { todo!() }
//! #     fn reset(&self) { todo!() }
//! #     fn set_device_address(&self, _: u8) { todo!() }
//! #     fn write(&self, _: usb_device::endpoint::EndpointAddress, _: &[u8]) -> usb_device::Result<usize> { todo!() }
//! #     fn read(&self, _: usb_device::endpoint::EndpointAddress, _: &mut [u8]) -> usb_device::Result<usize> { todo!() }
//! #     fn set_stalled(&self, _: usb_device::endpoint::EndpointAddress, _: bool) { todo!() }
//! #     fn is_stalled(&self, _: usb_device::endpoint::EndpointAddress) -> bool { todo!() }
//! #     fn suspend(&self) { todo!() }
//! #     fn resume(&self) { todo!() }
//! #     fn poll(&self) -> usb_device::bus::PollResult { todo!() }
//! # }
//! #
//! # struct MyBoard;
//! # impl Board for MyBoard {
//! #     fn now_ms(&self) -> u32 { 0 }
//! #     fn sleep_ms(&mut self, _ms: u32) {}
//! #     fn button_pressed(&self) -> bool { false }
//! #     fn reentry_magic(&self) -> u32 { unsafe { boot::read_magic_cell() } }
//! #     fn clear_reentry_magic(&mut self) { unsafe { boot::clear_magic_cell() } }
//! #     fn app_region(&self) -> &[u8] {
//! #         unsafe { core::slice::from_raw_parts(config::APP_BASE as *const u8, config::APP_MAX_SIZE) }
//! #     }
//! #     fn system_reset(&self) -> ! { cortex_m::peripheral::SCB::sys_reset() }
//! # }
//! #
//! # let usb_bus_alloc: UsbBusAllocator<DummyUsbBus> = unsafe { core::mem::MaybeUninit::<UsbBusAllocator<DummyUsbBus>>::uninit().assume_init() };
//!
//! let mut board = MyBoard;
//!
//! if boot::should_enter(&mut board) {
//!     // Bring up the USB bus for the target:
//!     // let usb_bus_alloc = UsbBus::new(peripheral);
//!
//!     // Advertise the application's USB identity when one is present.
//!     let (vid, pid) = header::usb_ids(board.app_region());
//!
//!     let flash = Flash::new(unsafe { FlashRegs::new() });
//!     let mut dfu = DfuClass::new(&usb_bus_alloc, flash);
//!     let mut usb_dev =
//!         UsbDeviceBuilder::new(&usb_bus_alloc, UsbVidPid(vid, pid)).build();
//!
//!     match boot::run(&mut usb_dev, &mut dfu, &mut board) {
//!         RunExit::Reboot => board.system_reset(),
//!         RunExit::LaunchApplication => {}
//!     }
//! }
//!
//! if header::validate_app(board.app_region()) {
//!     unsafe {
//!         boot::jump_to_application(config::APP_BASE + config::APP_VECTOR_TABLE_OFFSET)
//!     }
//! }
//!
//! // No valid image: fall through and start a DFU session instead.
//! ```

/// Boot controller module
pub mod boot;
/// DFU protocol module
pub mod class;
/// Memory map and protocol constants
pub mod config;
/// CRC32 engine
pub mod crc32;
/// Flash programming module
pub mod flash;
/// Application header module
pub mod header;
/// Inactivity deadline
pub mod timeout;

#[doc(inline)]
pub use crate::boot::{Board, RunExit};
#[doc(inline)]
pub use crate::class::{DfuClass, DfuState, DfuStatusCode};
#[doc(inline)]
pub use crate::flash::{Flash, FlashBus, FlashError, FlashRegs};
#[doc(inline)]
pub use crate::header::AppHeader;
#[doc(inline)]
pub use crate::timeout::InactivityTimeout;
