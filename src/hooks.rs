//! Call interception for BIOS graphics routines
//!
//! A handful of library functions inside the program image cannot be
//! reproduced by pure CPU emulation (they talk to the GPU) or are simply
//! not worth descending into (audio setup, vsync waits). The interpreter
//! consults this table before transferring control on `jal`/`jalr`; a hit
//! runs the handler against the framebuffer and skips the call entirely.
//!
//! The set of addresses is fixed and known at initialization, so the table
//! is a plain `HashMap` built once.

use std::collections::HashMap;

use log::debug;

use crate::cpu::reg;
use crate::framebuffer::{Framebuffer, Rect};
use crate::memory::{Memory, MemoryError};

// Program addresses of the framebuffer-related library routines
pub const LOAD_IMAGE_ADDR: u32 = 0x0001_2B24;
pub const STORE_IMAGE_ADDR: u32 = 0x0001_2B88;
pub const MOVE_IMAGE_ADDR: u32 = 0x0001_2BEC;
pub const CLEAR_IMAGE_ADDR: u32 = 0x0001_2A90;

// Library routines skipped outright
pub const SS_VAB_WAIT_ADDR: u32 = 0x000E_3278;
pub const SPU_INIT_ADDR: u32 = 0x0002_7274;
pub const SETUP_AUDIO_ADDR: u32 = 0x0013_25D8;
pub const VSYNC_ADDR: u32 = 0x0001_5308;
pub const DRAWSYNC_ADDR: u32 = 0x0001_290C;
pub const ADDQUE_ADDR: u32 = 0x0001_4670;
pub const STARTINTR_ADDR: u32 = 0x0001_5694;
pub const DMA_CALLBACK_ADDR: u32 = 0x0001_555C;

/// What to do when a hooked address is called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    LoadImage,
    StoreImage,
    MoveImage,
    ClearImage,
    /// Return immediately without side effects
    Return,
}

/// Address-keyed hook table plus the framebuffer the image hooks target
pub struct Hooks {
    table: HashMap<u32, HookKind>,
    pub framebuffer: Framebuffer,
}

impl Hooks {
    /// The fixed hook set for the target binary
    pub fn standard() -> Self {
        let mut table = HashMap::new();
        table.insert(LOAD_IMAGE_ADDR, HookKind::LoadImage);
        table.insert(STORE_IMAGE_ADDR, HookKind::StoreImage);
        table.insert(MOVE_IMAGE_ADDR, HookKind::MoveImage);
        table.insert(CLEAR_IMAGE_ADDR, HookKind::ClearImage);
        for addr in [
            SS_VAB_WAIT_ADDR,
            SPU_INIT_ADDR,
            SETUP_AUDIO_ADDR,
            VSYNC_ADDR,
            DRAWSYNC_ADDR,
            ADDQUE_ADDR,
            STARTINTR_ADDR,
            DMA_CALLBACK_ADDR,
        ] {
            table.insert(addr, HookKind::Return);
        }
        Hooks {
            table,
            framebuffer: Framebuffer::new(),
        }
    }

    /// Read the four-halfword `RECT` the argument register points at
    fn read_rect(mem: &Memory, addr: u32) -> Result<Rect, MemoryError> {
        Ok(Rect {
            x: mem.read16(addr)? as i16,
            y: mem.read16(addr + 2)? as i16,
            w: mem.read16(addr + 4)? as i16,
            h: mem.read16(addr + 6)? as i16,
        })
    }

    /// If `target` is hooked, run the handler and report the call as
    /// intercepted. The interpreter then advances past the delay slot
    /// without transferring control.
    pub fn intercept(
        &mut self,
        target: u32,
        regs: &mut [u32; 32],
        mem: &mut Memory,
    ) -> Result<bool, MemoryError> {
        let Some(kind) = self.table.get(&target).copied() else {
            return Ok(false);
        };

        match kind {
            HookKind::LoadImage => {
                let rect = Self::read_rect(mem, regs[reg::A0])?;
                let len = (rect.w.max(0) as usize) * (rect.h.max(0) as usize) * 2;
                let mut data = vec![0u8; len];
                mem.copy_out(regs[reg::A1], &mut data)?;
                debug!("LoadImage {:?} <- ${:08X}", rect, regs[reg::A1]);
                self.framebuffer.load_image(rect, &data);
            }
            HookKind::StoreImage => {
                let rect = Self::read_rect(mem, regs[reg::A0])?;
                let data = self.framebuffer.store_image(rect);
                debug!("StoreImage {:?} -> ${:08X}", rect, regs[reg::A1]);
                mem.copy_in(regs[reg::A1], &data)?;
            }
            HookKind::MoveImage => {
                let rect = Self::read_rect(mem, regs[reg::A0])?;
                let x = regs[reg::A1] as i32;
                let y = regs[reg::A2] as i32;
                debug!("MoveImage {:?} -> ({}, {})", rect, x, y);
                self.framebuffer.move_image(rect, x, y);
            }
            HookKind::ClearImage => {
                let rect = Self::read_rect(mem, regs[reg::A0])?;
                let (r, g, b) = (regs[reg::A1] as u8, regs[reg::A2] as u8, regs[reg::A3] as u8);
                debug!("ClearImage {:?} ({}, {}, {})", rect, r, g, b);
                self.framebuffer.clear_image(rect, r, g, b);
            }
            HookKind::Return => {
                debug!("skipping hooked library call at ${:08X}", target);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhooked_addresses_pass_through() {
        let mut hooks = Hooks::standard();
        let mut regs = [0u32; 32];
        let mut mem = Memory::new();
        assert!(!hooks.intercept(0x0001_8000, &mut regs, &mut mem).unwrap());
    }

    #[test]
    fn load_image_copies_ram_into_framebuffer() {
        let mut hooks = Hooks::standard();
        let mut regs = [0u32; 32];
        let mut mem = Memory::new();

        // RECT { 5, 6, 1, 1 } at 0x1000, pixel data at 0x2000
        mem.write16(0x1000, 5).unwrap();
        mem.write16(0x1002, 6).unwrap();
        mem.write16(0x1004, 1).unwrap();
        mem.write16(0x1006, 1).unwrap();
        mem.write16(0x2000, 0xBEEF).unwrap();
        regs[reg::A0] = 0x1000;
        regs[reg::A1] = 0x2000;

        assert!(hooks.intercept(LOAD_IMAGE_ADDR, &mut regs, &mut mem).unwrap());
        assert_eq!(hooks.framebuffer.pixel(5, 6), 0xBEEF);
    }

    #[test]
    fn store_image_copies_framebuffer_into_ram() {
        let mut hooks = Hooks::standard();
        let mut regs = [0u32; 32];
        let mut mem = Memory::new();

        hooks.framebuffer.load_image(Rect { x: 7, y: 8, w: 1, h: 1 }, &[0x34, 0x12]);
        mem.write16(0x1000, 7).unwrap();
        mem.write16(0x1002, 8).unwrap();
        mem.write16(0x1004, 1).unwrap();
        mem.write16(0x1006, 1).unwrap();
        regs[reg::A0] = 0x1000;
        regs[reg::A1] = 0x3000;

        assert!(hooks.intercept(STORE_IMAGE_ADDR, &mut regs, &mut mem).unwrap());
        assert_eq!(mem.read16(0x3000).unwrap(), 0x1234);
    }

    #[test]
    fn bios_stubs_return_without_effect() {
        let mut hooks = Hooks::standard();
        let mut regs = [0u32; 32];
        let mut mem = Memory::new();
        assert!(hooks.intercept(VSYNC_ADDR, &mut regs, &mut mem).unwrap());
        assert!(hooks.intercept(DRAWSYNC_ADDR, &mut regs, &mut mem).unwrap());
    }
}
