//! Memory map and protocol constants.
//!
//! The bootloader occupies the first 16 KiB of a 128 KiB flash; the
//! application image, led by its [32-byte header](crate::header::AppHeader),
//! occupies the rest. The last word of RAM is the firmware-update
//! re-entry mailbox shared with the application.

/// Start of internal flash.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Total internal flash size in bytes.
pub const FLASH_TOTAL_SIZE: usize = 128 * 1024;

/// Flash erase granularity in bytes.
pub const FLASH_PAGE_SIZE: usize = 2048;

/// Flash reserved for the bootloader itself, starting at [`FLASH_BASE`].
pub const BOOTLOADER_SIZE: usize = 16 * 1024;

/// Start of the application image (header first).
pub const APP_BASE: u32 = 0x0800_4000;

/// Maximum application image size in bytes.
pub const APP_MAX_SIZE: usize = 112 * 1024;

/// First address past the end of flash.
pub const FLASH_END: u32 = FLASH_BASE + FLASH_TOTAL_SIZE as u32;

/// Start of RAM.
pub const RAM_BASE: u32 = 0x2000_0000;

/// RAM size in bytes.
pub const RAM_SIZE: usize = 24 * 1024;

/// Value an application stores at [`BOOTLOADER_MAGIC_ADDR`] to request
/// DFU mode on the next reset. Consumed (cleared) by the bootloader.
pub const BOOTLOADER_MAGIC: u32 = 0xDEAD_BEEF;

/// Location of the re-entry magic word: the last 4 bytes of RAM.
pub const BOOTLOADER_MAGIC_ADDR: u32 = RAM_BASE + RAM_SIZE as u32 - 4;

/// Expected value of [`AppHeader::magic`](crate::header::AppHeader::magic).
pub const APP_HEADER_MAGIC: u32 = 0xDEAD_BEEF;

/// Size of the application header in bytes.
pub const APP_HEADER_SIZE: usize = 32;

/// Offset of the application vector table from [`APP_BASE`].
///
/// Cortex-M0+ requires 256-byte vector table alignment, so the firmware
/// body starts 256 bytes past the header. The gap between the 32-byte
/// header and the vector table is padding.
pub const APP_VECTOR_TABLE_OFFSET: u32 = 0x100;

/// DFU transfer size: `wTransferSize` in the functional descriptor and
/// the size of the download staging buffer.
pub const DFU_XFER_SIZE: u16 = 1024;

/// Vendor ID advertised when no application header supplies one.
pub const USB_DEFAULT_VID: u16 = 0x0483;

/// Product ID advertised when no application header supplies one.
pub const USB_DEFAULT_PID: u16 = 0xDF11;

/// Host inactivity budget before the bootloader tries to start the
/// resident application instead of waiting for DFU traffic.
pub const BOOTLOADER_TIMEOUT_MS: u32 = 60_000;

/// Sleep between bootloader main-loop iterations.
pub const MAIN_LOOP_PERIOD_MS: u32 = 10;
