//! USB DFU device class and deferred flash worker.
//!
//! Implements USB DFU 1.1 in DFU mode with the DFUSe (ST AN3156)
//! download extensions: the Set Address Pointer (`0x21`) and Erase
//! (`0x41`) commands carried in `DFU_DNLOAD` block 0. Firmware upload
//! (device to host) is not supported.
//!
//! Control requests only move bytes and advance the state machine;
//! flash work is deferred. A `DFU_DNLOAD` parks the payload in the
//! class buffer and enters `dfuDNLOAD-SYNC`; the host's `DFU_GETSTATUS`
//! moves the machine to `dfuDNBUSY` and reports how long to stay away;
//! the bootloader main loop then calls [`DfuClass::process`] which
//! performs the erase or program and clears the buffer. The next
//! `DFU_GETSTATUS` observes the empty buffer and completes the cycle.
//! Flash program and erase stall the bus for milliseconds, which is
//! acceptable in the main loop but not in a setup handler.

use core::marker::PhantomData;
use usb_device::{class_prelude::*, control::Request};

use crate::config::{APP_BASE, APP_MAX_SIZE, DFU_XFER_SIZE};
use crate::flash::{self, Flash, FlashBus};

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const DFU_DETACH: u8 = 0x00;
const DFU_DNLOAD: u8 = 0x01;
#[allow(dead_code)]
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

const DESC_DESCTYPE_DFU: u8 = 0x21;

const DFU_ATTR_CAN_DOWNLOAD: u8 = 0x01;
const DFU_ATTR_WILL_DETACH: u8 = 0x08;

const DETACH_TIMEOUT_MS: u16 = 255;

// DFUSe download commands, carried in DFU_DNLOAD with wValue == 0.
const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;
const DFUSE_CMD_ERASE: u8 = 0x41;

/// `block_num` sentinel marking a parked DFUSe command rather than a
/// data block.
const DFUSE_COMMAND_BLOCK: u16 = 0xFFFF;

/// `bwPollTimeout` reported when a DFUSe command is pending; erasing
/// the whole application region dominates.
const POLL_TIMEOUT_COMMAND_MS: u32 = 2000;
/// `bwPollTimeout` reported when a data block write is pending.
const POLL_TIMEOUT_WRITE_MS: u32 = 10;

/// DFUSe memory layout advertised on the DFU interface string: the
/// application region, 112 pages of 1 KiB granularity, readable,
/// erasable and writable.
pub const MEM_LAYOUT_STRING: &str = "@Internal Flash  /0x08004000/112*001Kg";

/// DFU device states, numbered as they appear in `DFU_GETSTATE` and
/// `DFU_GETSTATUS` replies.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuState {
    /// Device is running its normal application.
    AppIdle = 0,
    /// Device has received `DFU_DETACH` and is waiting for a USB reset.
    AppDetach = 1,
    /// Device is in DFU mode, waiting for requests.
    DfuIdle = 2,
    /// Device has received a block and is waiting for `DFU_GETSTATUS`.
    DfuDnloadSync = 3,
    /// Device is programming a received block into flash.
    DfuDnBusy = 4,
    /// Device is mid-download, expecting further `DFU_DNLOAD` requests.
    DfuDnloadIdle = 5,
    /// Final block received; waiting for `DFU_GETSTATUS` to begin the
    /// manifestation phase.
    DfuManifestSync = 6,
    /// Device is in the manifestation phase.
    DfuManifest = 7,
    /// Manifestation done; waiting for a USB or power-on reset.
    DfuManifestWaitReset = 8,
    /// Device is processing an upload operation.
    DfuUploadIdle = 9,
    /// An error has occurred. Awaiting `DFU_CLRSTATUS`.
    DfuError = 10,
}

/// DFU status codes reported in `DFU_GETSTATUS`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuStatusCode {
    /// No error condition is present.
    Ok = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails some vendor-specific test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Received address is out of range.
    ErrAddress = 0x08,
    /// `DFU_DNLOAD` with `wLength = 0` arrived before all data.
    ErrNotdone = 0x09,
    /// Device firmware is corrupt; run-time operations are impossible.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Unexpected USB reset signaling detected.
    ErrUsbr = 0x0C,
    /// Unexpected power-on reset detected.
    ErrPOR = 0x0D,
    /// Something went wrong, cause unknown.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

/// Mutable DFU session state.
///
/// Written from the setup handlers and consumed by the worker; the two
/// never overlap because the worker only acts in `dfuDNBUSY` while the
/// handlers only fill the buffer outside it.
struct DfuContext {
    state: DfuState,
    status: DfuStatusCode,
    /// Next flash write address, advanced by each completed block.
    current_address: u32,
    /// Last address received through a Set Address Pointer command.
    target_address: u32,
    /// `wValue` of the parked download, or [`DFUSE_COMMAND_BLOCK`].
    block_num: u16,
    buffer: [u8; DFU_XFER_SIZE as usize],
    /// Bytes parked in `buffer` awaiting the worker; `0` means idle.
    buffer_len: u16,
    poll_timeout: u32,
    download_complete: bool,
    /// Set once a session has erased the application region; sticky
    /// until the session is aborted or reset.
    erase_done: bool,
    /// Host activity marker, consumed by the boot loop to re-arm the
    /// inactivity deadline.
    activity: bool,
}

impl DfuContext {
    fn new() -> Self {
        Self {
            state: DfuState::DfuIdle,
            status: DfuStatusCode::Ok,
            current_address: APP_BASE,
            target_address: APP_BASE,
            block_num: 0,
            buffer: [0; DFU_XFER_SIZE as usize],
            buffer_len: 0,
            poll_timeout: 0,
            download_complete: false,
            erase_done: false,
            activity: false,
        }
    }

    /// The 6-byte `DFU_GETSTATUS` reply:
    /// `{bStatus, bwPollTimeout[3], bState, iString}`.
    fn status_response(&self) -> [u8; 6] {
        [
            self.status as u8,
            (self.poll_timeout & 0xff) as u8,
            ((self.poll_timeout >> 8) & 0xff) as u8,
            ((self.poll_timeout >> 16) & 0xff) as u8,
            self.state as u8,
            0,
        ]
    }
}

/// USB DFU bootloader class for the usb-device library.
///
/// Owns the DFU session state, the download staging buffer, and the
/// [`Flash`] engine it programs. The USB stack drives the protocol
/// through [`UsbClass`]; the bootloader main loop drives the deferred
/// flash work through [`process`](DfuClass::process).
pub struct DfuClass<B: UsbBus, F: FlashBus> {
    if_num: InterfaceNumber,
    interface_string: StringIndex,
    ctx: DfuContext,
    flash: Flash<F>,
    _bus: PhantomData<B>,
}

impl<B: UsbBus, F: FlashBus> UsbClass<B> for DfuClass<B, F> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface_alt(
            self.if_num,
            0,
            USB_CLASS_APPLICATION_SPECIFIC,
            USB_SUBCLASS_DFU,
            USB_PROTOCOL_DFU_MODE,
            Some(self.interface_string),
        )?;

        // DFU Functional descriptor
        writer.write(
            DESC_DESCTYPE_DFU,
            &[
                // bmAttributes: download only, detaches by itself
                DFU_ATTR_CAN_DOWNLOAD | DFU_ATTR_WILL_DETACH,
                // wDetachTimeOut
                (DETACH_TIMEOUT_MS & 0xff) as u8,
                (DETACH_TIMEOUT_MS >> 8) as u8,
                // wTransferSize
                (DFU_XFER_SIZE & 0xff) as u8,
                (DFU_XFER_SIZE >> 8) as u8,
                // bcdDFUVersion (1.1a)
                0x1a,
                0x01,
            ],
        )?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, lang_id: LangID) -> Option<&str> {
        if index == self.interface_string && (lang_id == LangID::EN_US || u16::from(lang_id) == 0) {
            return Some(MEM_LAYOUT_STRING);
        }
        None
    }

    // Handle control requests to the host.
    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class {
            return;
        }

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        self.ctx.activity = true;

        match req.request {
            DFU_GETSTATUS => {
                self.get_status(xfer);
            }
            DFU_GETSTATE => {
                self.get_state(xfer);
            }
            // DFU_UPLOAD is unsupported and is not acknowledged.
            _ => {
                xfer.reject().ok();
            }
        }
    }

    // Handle a control request from the host.
    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class {
            return;
        }

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        self.ctx.activity = true;

        match req.request {
            DFU_DNLOAD => {
                self.download(xfer, req);
            }
            DFU_CLRSTATUS => {
                self.clear_status(xfer);
            }
            DFU_ABORT => {
                self.abort(xfer);
            }
            DFU_DETACH => {
                // Already in DFU mode; acknowledge and carry on.
                xfer.accept().ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    fn reset(&mut self) {
        self.ctx.state = DfuState::DfuIdle;
        self.ctx.status = DfuStatusCode::Ok;
    }
}

impl<B: UsbBus, F: FlashBus> DfuClass<B, F> {
    /// Creates a new [`DfuClass`] over the provided bus allocator and
    /// flash engine.
    pub fn new(alloc: &UsbBusAllocator<B>, flash: Flash<F>) -> Self {
        Self {
            if_num: alloc.interface(),
            interface_string: alloc.string(),
            ctx: DfuContext::new(),
            flash,
            _bus: PhantomData,
        }
    }

    /// Consume self and return the owned flash engine.
    pub fn release(self) -> Flash<F> {
        self.flash
    }

    /// Borrow the owned flash engine.
    pub fn flash(&self) -> &Flash<F> {
        &self.flash
    }

    /// Current DFU state.
    pub fn state(&self) -> DfuState {
        self.ctx.state
    }

    /// Current DFU status code.
    pub fn status(&self) -> DfuStatusCode {
        self.ctx.status
    }

    /// Next flash write address.
    pub fn current_address(&self) -> u32 {
        self.ctx.current_address
    }

    /// True once the host has terminated the download with a
    /// zero-length `DFU_DNLOAD`.
    pub fn download_complete(&self) -> bool {
        self.ctx.download_complete
    }

    /// Consume the host-activity marker. Returns whether any class
    /// request or worker pass happened since the last call.
    pub fn take_activity(&mut self) -> bool {
        core::mem::replace(&mut self.ctx.activity, false)
    }

    fn fail(&mut self, status: DfuStatusCode) {
        self.ctx.status = status;
        self.ctx.state = DfuState::DfuError;
    }

    fn download(&mut self, xfer: ControlOut<B>, req: Request) {
        let state = self.ctx.state;

        if state != DfuState::DfuIdle && state != DfuState::DfuDnloadIdle {
            self.fail(DfuStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        // Zero-length download terminates the transfer.
        if req.length == 0 {
            self.ctx.state = DfuState::DfuManifestSync;
            self.ctx.download_complete = true;
            xfer.accept().ok();
            return;
        }

        if req.length > DFU_XFER_SIZE {
            self.fail(DfuStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        let data = xfer.data();

        // wValue 0 carries a DFUSe command; anything else is firmware
        // data (blocks 0 and 1 are reserved for commands by the DFUSe
        // convention, data transfers start at block 2).
        self.ctx.block_num = if req.value == 0 {
            DFUSE_COMMAND_BLOCK
        } else {
            req.value
        };

        self.ctx.buffer[..data.len()].copy_from_slice(data);
        self.ctx.buffer_len = data.len() as u16;
        self.ctx.state = DfuState::DfuDnloadSync;
        xfer.accept().ok();
    }

    fn get_status(&mut self, xfer: ControlIn<B>) {
        match self.ctx.state {
            DfuState::DfuDnloadSync => {
                // Announce the deferred work and its duration; the
                // worker runs while the host honors the poll timeout.
                self.ctx.poll_timeout = if self.ctx.block_num == DFUSE_COMMAND_BLOCK {
                    POLL_TIMEOUT_COMMAND_MS
                } else {
                    POLL_TIMEOUT_WRITE_MS
                };
                self.ctx.state = DfuState::DfuDnBusy;
            }
            DfuState::DfuDnBusy => {
                // Leave only once the worker has drained the buffer.
                if self.ctx.buffer_len == 0 {
                    self.ctx.state = if self.ctx.status == DfuStatusCode::Ok {
                        DfuState::DfuDnloadIdle
                    } else {
                        DfuState::DfuError
                    };
                }
            }
            DfuState::DfuManifestSync => {
                self.ctx.state = DfuState::DfuManifest;
                self.ctx.poll_timeout = 0;
            }
            _ => {}
        }

        xfer.accept_with(&self.ctx.status_response()).ok();
    }

    fn get_state(&mut self, xfer: ControlIn<B>) {
        // Current state, no transition.
        xfer.accept_with(&[self.ctx.state as u8]).ok();
    }

    fn clear_status(&mut self, xfer: ControlOut<B>) {
        if self.ctx.state == DfuState::DfuError {
            self.ctx.state = DfuState::DfuIdle;
            self.ctx.status = DfuStatusCode::Ok;
        }
        xfer.accept().ok();
    }

    fn abort(&mut self, xfer: ControlOut<B>) {
        self.ctx.state = DfuState::DfuIdle;
        self.ctx.status = DfuStatusCode::Ok;
        self.ctx.block_num = 0;
        self.ctx.current_address = APP_BASE;
        self.ctx.target_address = APP_BASE;
        self.ctx.erase_done = false;
        xfer.accept().ok();
    }

    /// Execute deferred flash work.
    ///
    /// Must be called periodically from the bootloader main loop, never
    /// from the USB stack. Acts only when a `DFU_GETSTATUS` has moved
    /// the machine to `dfuDNBUSY` with a parked buffer; returns whether
    /// any work was performed.
    pub fn process(&mut self) -> bool {
        if self.ctx.state != DfuState::DfuDnBusy || self.ctx.buffer_len == 0 {
            return false;
        }

        self.ctx.activity = true;

        if self.ctx.block_num == DFUSE_COMMAND_BLOCK {
            self.process_command();
        } else {
            self.process_data_block();
        }

        true
    }

    /// Little-endian address argument of a parked DFUSe command.
    fn command_address(&self) -> u32 {
        u32::from_le_bytes([
            self.ctx.buffer[1],
            self.ctx.buffer[2],
            self.ctx.buffer[3],
            self.ctx.buffer[4],
        ])
    }

    fn address_in_app(addr: u32) -> bool {
        addr >= APP_BASE && addr < APP_BASE + APP_MAX_SIZE as u32
    }

    fn process_command(&mut self) {
        let len = self.ctx.buffer_len;

        match self.ctx.buffer[0] {
            DFUSE_CMD_SET_ADDRESS if len == 5 => {
                let addr = self.command_address();
                if !Self::address_in_app(addr) {
                    self.fail(DfuStatusCode::ErrAddress);
                    return;
                }

                self.ctx.target_address = addr;
                self.ctx.current_address = self.ctx.target_address;
            }
            DFUSE_CMD_ERASE if len == 5 => {
                // The address argument is validated, but the whole
                // application region is erased regardless; hosts issue
                // one erase per session.
                let addr = self.command_address();
                if !Self::address_in_app(addr) {
                    self.fail(DfuStatusCode::ErrAddress);
                    return;
                }

                if self.flash.unlock().is_err() {
                    self.fail(DfuStatusCode::ErrProg);
                    return;
                }

                if self.flash.erase_pages(APP_BASE, APP_MAX_SIZE).is_err() {
                    self.flash.lock();
                    self.fail(DfuStatusCode::ErrErase);
                    return;
                }

                self.flash.clear_status_flags();
                self.flash.lock();

                self.ctx.erase_done = true;
                self.ctx.current_address = APP_BASE;
            }
            _ => {
                self.fail(DfuStatusCode::ErrStalledPkt);
                return;
            }
        }

        self.ctx.buffer_len = 0;
        self.ctx.status = DfuStatusCode::Ok;
    }

    fn process_data_block(&mut self) {
        // A host may skip the DFUSe erase and start streaming data
        // directly; erase the application region once, before the
        // first data block.
        if !self.ctx.erase_done && self.ctx.block_num == 2 {
            if self.flash.unlock().is_err() {
                self.fail(DfuStatusCode::ErrProg);
                return;
            }

            if self.flash.erase_pages(APP_BASE, APP_MAX_SIZE).is_err() {
                self.flash.lock();
                self.fail(DfuStatusCode::ErrErase);
                return;
            }

            self.flash.lock();
            self.ctx.erase_done = true;
            self.ctx.current_address = APP_BASE;
        }

        let addr = self.ctx.current_address;
        let len = self.ctx.buffer_len;

        if !flash::is_app_region(addr, len as usize) {
            self.fail(DfuStatusCode::ErrAddress);
            return;
        }

        if len == 0 || len > DFU_XFER_SIZE {
            self.fail(DfuStatusCode::ErrStalledPkt);
            return;
        }

        if self.flash.unlock().is_err() {
            self.fail(DfuStatusCode::ErrProg);
            return;
        }

        if self
            .flash
            .write(addr, &self.ctx.buffer[..len as usize])
            .is_err()
        {
            self.flash.lock();
            self.fail(DfuStatusCode::ErrWrite);
            return;
        }

        self.flash.lock();

        self.ctx.current_address += len as u32;
        self.ctx.buffer_len = 0;
        self.ctx.status = DfuStatusCode::Ok;
    }
}
