//! Application header parsing and image validation.
//!
//! The header is a 32-byte packed little-endian record at the start of
//! the application region. The firmware body it describes starts at
//! [`APP_VECTOR_TABLE_OFFSET`](crate::config::APP_VECTOR_TABLE_OFFSET)
//! past the region start; the padding between header and vector table
//! is not covered by the checksum.

use crate::config::{
    APP_HEADER_MAGIC, APP_HEADER_SIZE, APP_MAX_SIZE, APP_VECTOR_TABLE_OFFSET, USB_DEFAULT_PID,
    USB_DEFAULT_VID,
};
use crate::crc32;

/// Application image header.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AppHeader {
    /// Must equal [`APP_HEADER_MAGIC`] for the image to be considered.
    pub magic: u32,
    /// Firmware version. Opaque to the bootloader.
    pub version: u32,
    /// Length in bytes of the firmware body covered by `crc32`.
    pub size: u32,
    /// CRC32 of the firmware body.
    pub crc32: u32,
    /// USB vendor ID the bootloader advertises in DFU mode.
    pub usb_vid: u16,
    /// USB product ID the bootloader advertises in DFU mode.
    pub usb_pid: u16,
    /// Reserved. Image writers keep these zero.
    pub reserved: [u32; 3],
}

impl From<[u8; APP_HEADER_SIZE]> for AppHeader {
    fn from(bytes: [u8; APP_HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            size: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            crc32: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            usb_vid: u16::from_le_bytes([bytes[16], bytes[17]]),
            usb_pid: u16::from_le_bytes([bytes[18], bytes[19]]),
            reserved: [
                u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
                u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
                u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
            ],
        }
    }
}

impl AppHeader {
    /// Parse the header from the leading bytes of an application
    /// region view. `None` if the view is too short to hold one.
    pub fn read(region: &[u8]) -> Option<Self> {
        let mut bytes = [0u8; APP_HEADER_SIZE];
        bytes.copy_from_slice(region.get(..APP_HEADER_SIZE)?);
        Some(Self::from(bytes))
    }
}

/// Validate the resident application image.
///
/// True iff the header magic matches, the declared size is nonzero and
/// within the region, and the stored CRC32 matches the firmware body.
/// `region` is the application region, header first.
pub fn validate_app(region: &[u8]) -> bool {
    let header = match AppHeader::read(region) {
        Some(h) => h,
        None => return false,
    };

    if header.magic != APP_HEADER_MAGIC {
        return false;
    }

    if header.size == 0 || header.size as usize > APP_MAX_SIZE {
        return false;
    }

    let body_start = APP_VECTOR_TABLE_OFFSET as usize;
    let body = match region.get(body_start..body_start + header.size as usize) {
        Some(b) => b,
        None => return false,
    };

    crc32::checksum(body) == header.crc32
}

/// USB IDs to advertise in DFU mode.
///
/// An application with a matching header magic supplies its own
/// VID/PID; otherwise the compile-time defaults apply. Only the magic
/// is checked, so a partially flashed image can still bring the device
/// up under its intended identity.
pub fn usb_ids(region: &[u8]) -> (u16, u16) {
    match AppHeader::read(region) {
        Some(header) if header.magic == APP_HEADER_MAGIC => (header.usb_vid, header.usb_pid),
        _ => (USB_DEFAULT_VID, USB_DEFAULT_PID),
    }
}
