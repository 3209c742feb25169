//! GPU primitive records
//!
//! Update routines build their draw lists as chains of fixed-layout records
//! in RAM, shaped like the four-vertex textured/shaded GPU packet: a `tag`
//! word linking to the next record, then four vertex groups of color,
//! position, and texture coordinates. The `code` byte carries the GP0
//! command class, which is what the lifter keys off.
//!
//! Several fields are reinterpreted per kind: sprites carry their width and
//! height in `u1`/`v1`, tiles likewise, and the draw-environment record
//! packs a pointer into `r1`/`g1`/`b1`.

use serde::{Deserialize, Serialize};

use crate::memory::{Memory, MemoryError};

/// Byte size of one primitive record in RAM
pub const PRIMITIVE_SIZE: usize = 0x34;

/// Chain pointers must stay inside the KSEG0 RAM window
pub const CHAIN_PTR_MIN: u32 = 0x8000_0000;
pub const CHAIN_PTR_MAX: u32 = 0x8020_0000;

/// Hard ceiling on chain length; game data alone is never trusted to
/// terminate
pub const CHAIN_WALK_LIMIT: usize = 256;

/// Primitive classes the lifter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveKind {
    /// Textured axis-aligned rectangle
    Sprite,
    /// Solid-color rectangle
    Tile,
    /// Gouraud-shaded quad
    PolyG4,
    /// Textured gouraud quad
    PolyGt4,
    /// Textured gouraud triangle
    PolyGt3,
    /// Gouraud line, ignored by the lifter
    LineG2,
    /// Draw-environment update, parsed but not emitted
    DrawEnv,
}

impl PrimitiveKind {
    /// Classify a primitive `code` byte by its GP0 command class
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x34..=0x37 => Some(PrimitiveKind::PolyGt3),
            0x38..=0x3B => Some(PrimitiveKind::PolyG4),
            0x3C..=0x3F => Some(PrimitiveKind::PolyGt4),
            0x50..=0x53 => Some(PrimitiveKind::LineG2),
            0x60..=0x63 => Some(PrimitiveKind::Tile),
            0x64..=0x67 => Some(PrimitiveKind::Sprite),
            0xE0..=0xEF => Some(PrimitiveKind::DrawEnv),
            _ => None,
        }
    }
}

/// One primitive record, read verbatim from RAM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primitive {
    /// KSEG0 pointer to the next record, or 0
    pub tag: u32,
    pub r0: u8,
    pub g0: u8,
    pub b0: u8,
    pub code: u8,
    pub x0: i16,
    pub y0: i16,
    pub u0: u8,
    pub v0: u8,
    pub clut: u16,
    pub r1: u8,
    pub g1: u8,
    pub b1: u8,
    pub p1: u8,
    pub x1: i16,
    pub y1: i16,
    pub u1: u8,
    pub v1: u8,
    pub tpage: u16,
    pub r2: u8,
    pub g2: u8,
    pub b2: u8,
    pub p2: u8,
    pub x2: i16,
    pub y2: i16,
    pub u2: u8,
    pub v2: u8,
    /// Reused as the ordering-table key
    pub pad2: u16,
    pub r3: u8,
    pub g3: u8,
    pub b3: u8,
    pub p3: u8,
    pub x3: i16,
    pub y3: i16,
    pub u3: u8,
    pub v3: u8,
    /// Low bit marks semi-transparency; any non-zero value shades the
    /// texture
    pub pad3: u16,
}

impl Primitive {
    /// Read a record at a physical RAM offset
    pub fn read(mem: &Memory, addr: u32) -> Result<Self, MemoryError> {
        let mut b = [0u8; PRIMITIVE_SIZE];
        mem.copy_out(addr, &mut b)?;

        let h = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        Ok(Primitive {
            tag: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            r0: b[4],
            g0: b[5],
            b0: b[6],
            code: b[7],
            x0: h(8) as i16,
            y0: h(10) as i16,
            u0: b[12],
            v0: b[13],
            clut: h(14),
            r1: b[16],
            g1: b[17],
            b1: b[18],
            p1: b[19],
            x1: h(20) as i16,
            y1: h(22) as i16,
            u1: b[24],
            v1: b[25],
            tpage: h(26),
            r2: b[28],
            g2: b[29],
            b2: b[30],
            p2: b[31],
            x2: h(32) as i16,
            y2: h(34) as i16,
            u2: b[36],
            v2: b[37],
            pad2: h(38),
            r3: b[40],
            g3: b[41],
            b3: b[42],
            p3: b[43],
            x3: h(44) as i16,
            y3: h(46) as i16,
            u3: b[48],
            v3: b[49],
            pad3: h(50),
        })
    }

    pub fn kind(&self) -> Option<PrimitiveKind> {
        PrimitiveKind::from_code(self.code)
    }

    /// Sprite width and height live in `u1`/`v1`
    pub fn sprite_size(&self) -> (u8, u8) {
        (self.u1, self.v1)
    }

    /// Sprite records add part of `p1` into the texture page
    pub fn sprite_tpage(&self) -> u16 {
        self.tpage.wrapping_add((self.p1 & 0x60) as u16)
    }

    /// Draw-environment records pack the target address into `r1..b1`
    pub fn drawenv_addr(&self) -> u32 {
        ((self.b1 as u32) << 16) | ((self.g1 as u32) << 8) | self.r1 as u32
    }

    /// The four corner colors in vertex order
    pub fn corner_colors(&self) -> [[u8; 3]; 4] {
        [
            [self.r0, self.g0, self.b0],
            [self.r1, self.g1, self.b1],
            [self.r2, self.g2, self.b2],
            [self.r3, self.g3, self.b3],
        ]
    }

    pub fn semi_transparent(&self) -> bool {
        self.pad3 & 1 == 1
    }

    pub fn shade_texture(&self) -> bool {
        self.pad3 > 0
    }

    /// Ordering-table key
    pub fn ot_key(&self) -> u16 {
        self.pad2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_round_trips_through_ram() {
        let mut mem = Memory::new();
        let base = 0x0010_0000;
        mem.write32(base, 0x8010_1000).unwrap(); // tag
        mem.write8(base + 4, 0x20).unwrap(); // r0
        mem.write8(base + 7, 0x64).unwrap(); // code: sprite
        mem.write16(base + 8, (-5i16) as u16).unwrap(); // x0
        mem.write16(base + 14, 0x0123).unwrap(); // clut
        mem.write8(base + 24, 32).unwrap(); // u1 (sprite width)
        mem.write8(base + 25, 16).unwrap(); // v1 (sprite height)
        mem.write16(base + 26, 0x001F).unwrap(); // tpage
        mem.write16(base + 38, 0x40).unwrap(); // pad2 (OT key)
        mem.write16(base + 50, 1).unwrap(); // pad3

        let prim = Primitive::read(&mem, base).unwrap();
        assert_eq!(prim.tag, 0x8010_1000);
        assert_eq!(prim.kind(), Some(PrimitiveKind::Sprite));
        assert_eq!(prim.x0, -5);
        assert_eq!(prim.clut, 0x0123);
        assert_eq!(prim.sprite_size(), (32, 16));
        assert_eq!(prim.ot_key(), 0x40);
        assert!(prim.semi_transparent());
        assert!(prim.shade_texture());
    }

    #[test]
    fn code_classification() {
        assert_eq!(PrimitiveKind::from_code(0x3C), Some(PrimitiveKind::PolyGt4));
        assert_eq!(PrimitiveKind::from_code(0x38), Some(PrimitiveKind::PolyG4));
        assert_eq!(PrimitiveKind::from_code(0x36), Some(PrimitiveKind::PolyGt3));
        assert_eq!(PrimitiveKind::from_code(0x52), Some(PrimitiveKind::LineG2));
        assert_eq!(PrimitiveKind::from_code(0x61), Some(PrimitiveKind::Tile));
        assert_eq!(PrimitiveKind::from_code(0x65), Some(PrimitiveKind::Sprite));
        assert_eq!(PrimitiveKind::from_code(0xE1), Some(PrimitiveKind::DrawEnv));
        assert_eq!(PrimitiveKind::from_code(0x00), None);
        assert_eq!(PrimitiveKind::from_code(0x7F), None);
    }

    #[test]
    fn drawenv_address_packing() {
        let prim = Primitive {
            r1: 0x44,
            g1: 0x33,
            b1: 0x80,
            ..Primitive::default()
        };
        assert_eq!(prim.drawenv_addr(), 0x0080_3344);
    }
}
