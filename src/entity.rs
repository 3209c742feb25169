//! Entity record layout
//!
//! Update routines address entity fields by byte offset into a fixed 0xBC
//! byte structure, so the layout here must match the compiled code exactly.
//! [`EntityRecord`] wraps the raw image and exposes the fields the driver
//! and lifter read back by name; everything else stays available as bytes.

use serde::{Deserialize, Serialize};

use crate::memory::{Memory, MemoryError, ENTITY_TABLE_BASE};

/// Size of the in-RAM entity structure
pub const ENTITY_SIZE: usize = 0xBC;

/// The first 0x40 slots are reserved for the player and HUD; rooms allocate
/// from the remaining 0xC0
pub const RESERVED_SLOTS: u32 = 0x40;
pub const USER_SLOTS: u32 = 0xC0;

/// Start of the allocatable entity slots in RAM
pub const ENTITY_ALLOCATION_START: u32 = ENTITY_TABLE_BASE + RESERVED_SLOTS * ENTITY_SIZE as u32;

/// Entity update functions live in the map overlay's address window
pub const UPDATE_FUNC_MIN: u32 = 0x8018_0000;
pub const UPDATE_FUNC_MAX: u32 = 0x8020_0000;

/// Object ids with dedicated lifting paths
pub const OBJ_CANDLE: u16 = 0x0001;
pub const OBJ_RELIC: u16 = 0x000B;
pub const OBJ_PICKUP: u16 = 0x000C;

/// Initial-state values marking the stat power-ups
pub const LIFE_MAX_UP_ID: u16 = 0x8017;
pub const HEART_MAX_UP_ID: u16 = 0x800C;

/// Blend-mode bits in the entity's blend byte
pub const BLEND_LIGHTEN: u8 = 0x20;
pub const BLEND_FADE_LIGHT: u8 = 0x70;

/// Poly-flag bit: the entity draws through a primitive list
pub const POLY_FLAG_HAS_PRIMITIVES: u32 = 0x0080_0000;

/// One seed from a room's entity layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySeed {
    pub x: i16,
    pub y: i16,
    pub entity_id: u16,
    /// Low byte is the slot index; the high bits carry the room-slot tag
    /// and spawn group the record is stamped with
    pub slot: u16,
    pub initial_state: u16,
}

/// A fixed-layout view over the 0xBC-byte in-RAM entity structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(with = "serde_bytes_array")]
    pub raw: [u8; ENTITY_SIZE],
}

// Serde lacks impls for [u8; 0xBC]; carry it as a byte slice
mod serde_bytes_array {
    use super::ENTITY_SIZE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; ENTITY_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; ENTITY_SIZE], D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(d)?;
        let mut out = [0u8; ENTITY_SIZE];
        let n = bytes.len().min(ENTITY_SIZE);
        out[..n].copy_from_slice(&bytes[..n]);
        Ok(out)
    }
}

impl EntityRecord {
    pub fn zeroed() -> Self {
        EntityRecord { raw: [0; ENTITY_SIZE] }
    }

    /// Read the record occupying `slot` (relative to the allocatable
    /// region) out of RAM
    pub fn from_slot(mem: &Memory, slot: u32) -> Result<Self, MemoryError> {
        let mut rec = EntityRecord::zeroed();
        mem.copy_out(Self::slot_addr(slot), &mut rec.raw)?;
        Ok(rec)
    }

    /// RAM address of an allocatable slot
    pub fn slot_addr(slot: u32) -> u32 {
        ENTITY_ALLOCATION_START + slot * ENTITY_SIZE as u32
    }

    /// Build the initial record the driver writes for a layout seed. The
    /// update function comes from the per-map function table.
    pub fn from_seed(seed: &EntitySeed, update_function: u32) -> Self {
        let mut rec = EntityRecord::zeroed();
        rec.put16(0x02, seed.x as u16);
        rec.put16(0x06, seed.y as u16);
        rec.put16(0x26, seed.entity_id & 0x03FF);
        rec.put32(0x28, update_function);
        rec.put16(0x30, seed.initial_state);
        rec.put16(0x32, seed.slot >> 8);
        rec.put16(0x68, (seed.slot >> 10) & 7);
        rec
    }

    /// Any non-zero byte in the live portion of the record means the slot
    /// is occupied
    pub fn is_populated(&self) -> bool {
        self.raw[..0xB0].iter().any(|&b| b != 0)
    }

    /// Whether the update-function pointer lands in the map overlay window
    pub fn has_valid_update_function(&self) -> bool {
        let f = self.update_function();
        f > UPDATE_FUNC_MIN && f < UPDATE_FUNC_MAX
    }

    fn get16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.raw[off], self.raw[off + 1]])
    }

    fn get32(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.raw[off],
            self.raw[off + 1],
            self.raw[off + 2],
            self.raw[off + 3],
        ])
    }

    fn put16(&mut self, off: usize, v: u16) {
        self.raw[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put32(&mut self, off: usize, v: u32) {
        self.raw[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    // Named field accessors, offsets per the compiled layout

    pub fn pos_x(&self) -> i16 {
        self.get16(0x02) as i16
    }

    pub fn pos_y(&self) -> i16 {
        self.get16(0x06) as i16
    }

    pub fn facing(&self) -> u16 {
        self.get16(0x14)
    }

    pub fn clut_index(&self) -> u16 {
        self.get16(0x16)
    }

    pub fn blend_mode(&self) -> u8 {
        self.raw[0x18]
    }

    pub fn transform_flags(&self) -> u8 {
        self.raw[0x19]
    }

    pub fn rotation(&self) -> i16 {
        self.get16(0x1E) as i16
    }

    pub fn z_depth(&self) -> i16 {
        self.get16(0x24) as i16
    }

    pub fn object_id(&self) -> u16 {
        self.get16(0x26)
    }

    pub fn update_function(&self) -> u32 {
        self.get32(0x28)
    }

    pub fn current_state(&self) -> u16 {
        self.get16(0x2C)
    }

    pub fn current_substate(&self) -> i16 {
        self.get16(0x2E) as i16
    }

    pub fn initial_state(&self) -> u16 {
        self.get16(0x30)
    }

    pub fn room_slot(&self) -> u16 {
        self.get16(0x32)
    }

    pub fn set_room_slot(&mut self, slot: u16) {
        self.put16(0x32, slot);
    }

    /// Draw-path flag word (bit 23 selects the primitive list)
    pub fn poly_flags(&self) -> u32 {
        self.get32(0x34)
    }

    /// Index into the enemy descriptor array
    pub fn info_index(&self) -> i16 {
        self.get16(0x3A) as i16
    }

    pub fn hit_points(&self) -> i16 {
        self.get16(0x3E) as i16
    }

    pub fn attack_damage(&self) -> i16 {
        self.get16(0x40) as i16
    }

    pub fn hitbox_width(&self) -> u8 {
        self.raw[0x46]
    }

    pub fn hitbox_height(&self) -> u8 {
        self.raw[0x47]
    }

    pub fn frame_index(&self) -> u16 {
        self.get16(0x50)
    }

    pub fn frame_duration(&self) -> u16 {
        self.get16(0x52)
    }

    pub fn sprite_bank(&self) -> u16 {
        self.get16(0x54)
    }

    pub fn sprite_image(&self) -> u16 {
        self.get16(0x56)
    }

    pub fn tileset(&self) -> u16 {
        self.get16(0x5A)
    }

    pub fn polygon_id(&self) -> u32 {
        self.get32(0x64)
    }

    /// Head of the primitive list the entity built in RAM (a KSEG0
    /// pointer), or zero
    pub fn primitives_addr(&self) -> u32 {
        self.get32(0x7C)
    }

    pub fn pickup_flag(&self) -> u16 {
        self.get16(0xB4)
    }

    pub fn has_primitive_list(&self) -> bool {
        self.primitives_addr() != 0 && self.poly_flags() & POLY_FLAG_HAS_PRIMITIVES != 0
    }
}
