#![allow(dead_code)]
//! Register-level emulation of the flash controller and flash array.
//!
//! Models what the programming engine depends on: the key-sequence
//! lock, the write protection of `CR` while locked, page erase through
//! PER/PNB/STRT, NOR programming (stores can only clear bits), and the
//! EOP/error status flags. Failure injection flags let tests force the
//! peripheral error paths.

use std::cell::RefCell;
use std::rc::Rc;

use usbd_dfu_boot::config::{FLASH_BASE, FLASH_PAGE_SIZE, FLASH_TOTAL_SIZE};
use usbd_dfu_boot::flash::{
    FlashBus, CR_LOCK, CR_PER, CR_PG, CR_PNB_MASK, CR_PNB_POS, CR_STRT, FLASH_KEY1, FLASH_KEY2,
    SR_BSY1, SR_EOP, SR_PROGERR, SR_WRPERR,
};

pub struct SimState {
    pub mem: Vec<u8>,
    pub cr: u32,
    pub sr: u32,
    key_stage: u8,
    /// Swallow key writes so the unlock sequence never takes.
    pub reject_keys: bool,
    /// Report the controller busy forever.
    pub stuck_busy: bool,
    /// Raise PROGERR on every programming store.
    pub fail_program: bool,
    /// Raise WRPERR instead of erasing.
    pub fail_erase: bool,
    pub pages_erased: u32,
    pub words_programmed: u32,
}

impl SimState {
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; FLASH_TOTAL_SIZE],
            cr: CR_LOCK,
            sr: 0,
            key_stage: 0,
            reject_keys: false,
            stuck_busy: false,
            fail_program: false,
            fail_erase: false,
            pages_erased: 0,
            words_programmed: 0,
        }
    }

    pub fn locked(&self) -> bool {
        self.cr & CR_LOCK != 0
    }

    /// Flash bytes at `addr`.
    pub fn read(&self, addr: u32, len: usize) -> &[u8] {
        let offset = (addr - FLASH_BASE) as usize;
        &self.mem[offset..offset + len]
    }

    /// Overwrite flash bytes at `addr`, bypassing the controller.
    pub fn preload(&mut self, addr: u32, data: &[u8]) {
        let offset = (addr - FLASH_BASE) as usize;
        self.mem[offset..offset + data.len()].copy_from_slice(data);
    }
}

pub fn sim_state() -> Rc<RefCell<SimState>> {
    Rc::new(RefCell::new(SimState::new()))
}

/// [`FlashBus`] over a shared [`SimState`].
pub struct SimFlash {
    state: Rc<RefCell<SimState>>,
}

impl SimFlash {
    pub fn new(state: &Rc<RefCell<SimState>>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    pub fn state(&self) -> &Rc<RefCell<SimState>> {
        &self.state
    }
}

impl FlashBus for SimFlash {
    fn sr(&self) -> u32 {
        let s = self.state.borrow();
        if s.stuck_busy {
            s.sr | SR_BSY1
        } else {
            s.sr
        }
    }

    fn clear_sr(&mut self, bits: u32) {
        self.state.borrow_mut().sr &= !bits;
    }

    fn cr(&self) -> u32 {
        self.state.borrow().cr
    }

    fn set_cr(&mut self, value: u32) {
        let mut s = self.state.borrow_mut();

        if s.cr & CR_LOCK != 0 {
            // CR is write-protected while locked; only the lock bit
            // itself sticks.
            s.cr |= value & CR_LOCK;
            return;
        }

        let started = value & CR_STRT != 0;
        s.cr = value & !CR_STRT;
        if s.cr & CR_LOCK != 0 {
            s.key_stage = 0;
        }

        if started && s.cr & CR_PER != 0 {
            if s.fail_erase {
                s.sr |= SR_WRPERR;
                return;
            }
            let page = ((s.cr & CR_PNB_MASK) >> CR_PNB_POS) as usize;
            let offset = page * FLASH_PAGE_SIZE;
            s.mem[offset..offset + FLASH_PAGE_SIZE].fill(0xFF);
            s.pages_erased += 1;
            s.sr |= SR_EOP;
        }
    }

    fn write_key(&mut self, key: u32) {
        let mut s = self.state.borrow_mut();
        if s.reject_keys {
            return;
        }
        match (s.key_stage, key) {
            (0, FLASH_KEY1) => s.key_stage = 1,
            (1, FLASH_KEY2) => {
                s.cr &= !CR_LOCK;
                s.key_stage = 0;
            }
            _ => s.key_stage = 0,
        }
    }

    fn program_word(&mut self, address: u32, value: u32) {
        let mut s = self.state.borrow_mut();

        if s.cr & CR_PG == 0 || s.fail_program {
            s.sr |= SR_PROGERR;
            return;
        }

        let offset = (address - FLASH_BASE) as usize;
        // NOR flash: programming only clears bits.
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            s.mem[offset + i] &= *byte;
        }
        s.words_programmed += 1;
        s.sr |= SR_EOP;
    }

    fn load_word(&self, address: u32) -> u32 {
        let s = self.state.borrow();
        let o = (address - FLASH_BASE) as usize;
        u32::from_le_bytes([s.mem[o], s.mem[o + 1], s.mem[o + 2], s.mem[o + 3]])
    }
}
