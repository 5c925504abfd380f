#![allow(dead_code)]
//! Host side of the DFU conversation, for driving the bootloader class
//! through the emulated EP0 pipe.

use usb_device::class::UsbClass;
use usbd_class_tester::prelude::*;

// State
pub const APP_IDLE: u8 = 0;
pub const APP_DETACH: u8 = 1;
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DN_BUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_UPLOAD_IDLE: u8 = 9;
pub const DFU_ERROR: u8 = 10;

// Status
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_WRITE: u8 = 0x03;
pub const STATUS_ERR_ERASE: u8 = 0x04;
pub const STATUS_ERR_PROG: u8 = 0x06;
pub const STATUS_ERR_ADDRESS: u8 = 0x08;
pub const STATUS_ERR_STALLED_PKT: u8 = 0x0F;

// DFU class request codes.
const DFU_DETACH: u8 = 0x00;
const DFU_DNLOAD: u8 = 0x01;
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

// DFUSe commands carried in DFU_DNLOAD block 0.
const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;

/// What a DFU host does to the device under test: the two raw EP0
/// class-request operations, and the bootloader's request vocabulary
/// built on top of them.
///
/// Every request targets interface 0; the device has no other.
pub trait HostExt<C> {
    /// Class request with a device-to-host data stage.
    fn class_in(&mut self, cls: &mut C, req: u8, value: u16, length: u16) -> AnyResult<Vec<u8>>;

    /// Class request with a host-to-device data stage (or none).
    fn class_out(&mut self, cls: &mut C, req: u8, value: u16, data: &[u8]) -> AnyResult<Vec<u8>>;

    /// `DFU_DNLOAD` block 0 carrying a raw DFUSe command payload.
    fn send_command(&mut self, cls: &mut C, payload: &[u8]) -> AnyResult<Vec<u8>>;

    /// DFUSe Set Address Pointer.
    fn send_set_address(&mut self, cls: &mut C, address: u32) -> AnyResult<Vec<u8>>;

    /// DFUSe Erase.
    fn send_erase(&mut self, cls: &mut C, address: u32) -> AnyResult<Vec<u8>>;

    /// `DFU_DNLOAD` firmware data block.
    fn send_block(&mut self, cls: &mut C, block_num: u16, data: &[u8]) -> AnyResult<Vec<u8>>;

    /// Zero-length `DFU_DNLOAD` terminating the transfer.
    fn finish_download(&mut self, cls: &mut C, block_num: u16) -> AnyResult<Vec<u8>>;

    /// `DFU_GETSTATUS`: the 6-byte status block, driving the state
    /// machine as a side effect.
    fn poll_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;

    /// `DFU_GETSTATE`: the bare state byte.
    fn read_state(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;

    /// `DFU_CLRSTATUS`.
    fn clear_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;

    /// `DFU_ABORT`.
    fn abort(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;

    /// `DFU_DETACH`.
    fn detach(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;

    /// `DFU_UPLOAD`, which this bootloader refuses.
    fn attempt_upload(&mut self, cls: &mut C, block_num: u16, length: u16) -> AnyResult<Vec<u8>>;
}

impl<'a, C, M> HostExt<C> for Device<'a, C, M>
where
    C: UsbClass<EmulatedUsbBus>,
    M: UsbDeviceCtx<C<'a> = C>,
{
    fn class_in(&mut self, cls: &mut C, req: u8, value: u16, length: u16) -> AnyResult<Vec<u8>> {
        self.control_read(
            cls,
            CtrRequestType::to_host().class().interface(),
            req,
            value,
            0,
            length,
        )
    }

    fn class_out(&mut self, cls: &mut C, req: u8, value: u16, data: &[u8]) -> AnyResult<Vec<u8>> {
        if data.len() > u16::MAX as usize {
            return Err(AnyUsbError::DataConversion);
        }
        self.control_write(
            cls,
            CtrRequestType::to_device().class().interface(),
            req,
            value,
            0,
            data.len() as u16,
            data,
        )
    }

    fn send_command(&mut self, cls: &mut C, payload: &[u8]) -> AnyResult<Vec<u8>> {
        self.class_out(cls, DFU_DNLOAD, 0, payload)
    }

    fn send_set_address(&mut self, cls: &mut C, address: u32) -> AnyResult<Vec<u8>> {
        let a = address.to_le_bytes();
        self.send_command(cls, &[CMD_SET_ADDRESS, a[0], a[1], a[2], a[3]])
    }

    fn send_erase(&mut self, cls: &mut C, address: u32) -> AnyResult<Vec<u8>> {
        let a = address.to_le_bytes();
        self.send_command(cls, &[CMD_ERASE, a[0], a[1], a[2], a[3]])
    }

    fn send_block(&mut self, cls: &mut C, block_num: u16, data: &[u8]) -> AnyResult<Vec<u8>> {
        self.class_out(cls, DFU_DNLOAD, block_num, data)
    }

    fn finish_download(&mut self, cls: &mut C, block_num: u16) -> AnyResult<Vec<u8>> {
        self.class_out(cls, DFU_DNLOAD, block_num, &[])
    }

    fn poll_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.class_in(cls, DFU_GETSTATUS, 0, 6)
    }

    fn read_state(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.class_in(cls, DFU_GETSTATE, 0, 1)
    }

    fn clear_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.class_out(cls, DFU_CLRSTATUS, 0, &[])
    }

    fn abort(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.class_out(cls, DFU_ABORT, 0, &[])
    }

    fn detach(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.class_out(cls, DFU_DETACH, 0, &[])
    }

    fn attempt_upload(&mut self, cls: &mut C, block_num: u16, length: u16) -> AnyResult<Vec<u8>> {
        self.class_in(cls, DFU_UPLOAD, block_num, length)
    }
}

/// Expected `DFU_GETSTATUS` reply for a status, poll timeout and state.
pub fn status_block(status: u8, poll_timeout: u32, state: u8) -> [u8; 6] {
    let mut block = [0u8; 6];
    block[0] = status;
    block[1..4].copy_from_slice(&poll_timeout.to_le_bytes()[..3]);
    block[4] = state;
    block
}
