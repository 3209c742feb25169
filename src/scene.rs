//! Lifted scene model
//!
//! The output side of the pipeline: plain-data sprites, entities, and
//! per-room ordering tables that a viewer (or the scene dump written by the
//! CLI) can consume without knowing anything about the emulation that
//! produced them. Everything here derives serde so the whole scene can be
//! serialized with bincode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::EntityRecord;
use crate::primitive::PrimitiveKind;

/// Default ordering-table thresholds: keys below `BG_LAYER_Z` render behind
/// the background tile layer, keys below `FG_LAYER_Z` between the layers
pub const BG_LAYER_Z: u16 = 0x20;
pub const FG_LAYER_Z: u16 = 0x60;

/// An owned RGBA image lifted out of the simulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes
    pub rgba: Vec<u8>,
}

/// Blend mode selected by the entity's blend byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Opaque,
    Lighten,
    FadeLight,
}

/// Corner displacements for skewed quads, relative to the axis-aligned
/// bounding box
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skew {
    pub top_right_y: i32,
    pub bottom_left_x: i32,
    pub bottom_right_x: i32,
    pub bottom_right_y: i32,
}

impl Skew {
    pub fn is_identity(&self) -> bool {
        *self == Skew::default()
    }
}

/// One renderable piece of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpritePart {
    pub kind: PrimitiveKind,
    /// Offset of the part relative to the entity (or absolute when the
    /// primitive carried explicit coordinates)
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
    /// Resolved RGBA pixels; absent for parts the primitive didn't texture
    pub texture: Option<Texture>,
    pub flip_x: bool,
    pub flip_y: bool,
    /// The part contains semi-transparent pixels and participates in
    /// blending
    pub blend: bool,
    pub blend_mode: BlendMode,
    pub semi_transparent: bool,
    pub shade_texture: bool,
    /// Ordering-table key the part was binned under
    pub ot_key: u16,
    /// Absolute room coordinates
    pub x: i32,
    pub y: i32,
    /// Rotation (clockwise, game units) around the anchor
    pub rotate: i32,
    pub anchor_x: i32,
    pub anchor_y: i32,
    pub skew: Skew,
    /// Corner colors for gouraud-shaded parts
    pub corner_colors: [[u8; 3]; 4],
}

impl SpritePart {
    /// A blank part of the given kind; lifters fill in what the primitive
    /// actually carries
    pub fn new(kind: PrimitiveKind) -> Self {
        SpritePart {
            kind,
            offset_x: 0,
            offset_y: 0,
            width: 0,
            height: 0,
            texture: None,
            flip_x: false,
            flip_y: false,
            blend: false,
            blend_mode: BlendMode::Opaque,
            semi_transparent: false,
            shade_texture: false,
            ot_key: 0,
            x: 0,
            y: 0,
            rotate: 0,
            anchor_x: 0,
            anchor_y: 0,
            skew: Skew::default(),
            corner_colors: [[0; 3]; 4],
        }
    }
}

/// A lifted entity: the raw record, decoded identity, and its draw parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Room slot, stable across the simulation pass
    pub slot: u16,
    pub record: EntityRecord,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Draw parts in list order
    pub sprites: Vec<SpritePart>,
    /// RAM address of the sprite-bank entry the entity referenced, if any
    pub sprite_address: u32,
    /// The update run drained its instruction budget
    pub budget_exhausted: bool,
    /// The update run aborted (out-of-range access, with address and PC)
    pub run_error: Option<String>,
    /// A primitive chain ended early (unknown code or runaway pointer)
    pub lift_anomaly: Option<String>,
}

impl Entity {
    pub fn new(slot: u16, record: EntityRecord) -> Self {
        Entity {
            slot,
            record,
            name: None,
            description: None,
            sprites: Vec::new(),
            sprite_address: 0,
            budget_exhausted: false,
            run_error: None,
            lift_anomaly: None,
        }
    }
}

/// Per-room lifted scene: entities plus three z-keyed ordering tables.
/// Within a bucket, parts keep the order they were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub entities: Vec<Entity>,
    /// Keys below the background layer's z
    pub bg_ordering_table: BTreeMap<u16, Vec<SpritePart>>,
    /// Keys between the layers
    pub mid_ordering_table: BTreeMap<u16, Vec<SpritePart>>,
    /// Keys at or above the foreground layer's z
    pub fg_ordering_table: BTreeMap<u16, Vec<SpritePart>>,
    pub bg_z: u16,
    pub fg_z: u16,
}

impl Room {
    pub fn new(bg_z: u16, fg_z: u16) -> Self {
        Room {
            bg_z,
            fg_z,
            ..Room::default()
        }
    }

    /// Bin a part by its ordering-table key
    pub fn insert_part(&mut self, part: SpritePart) {
        let key = part.ot_key;
        let table = if key < self.bg_z {
            &mut self.bg_ordering_table
        } else if key < self.fg_z {
            &mut self.mid_ordering_table
        } else {
            &mut self.fg_ordering_table
        };
        table.entry(key).or_default().push(part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part_with_key(key: u16) -> SpritePart {
        let mut p = SpritePart::new(PrimitiveKind::Tile);
        p.ot_key = key;
        p
    }

    #[test]
    fn parts_bin_by_layer_thresholds() {
        let mut room = Room::new(BG_LAYER_Z, FG_LAYER_Z);
        room.insert_part(part_with_key(0x10));
        room.insert_part(part_with_key(0x40));
        room.insert_part(part_with_key(0x80));
        assert_eq!(room.bg_ordering_table.len(), 1);
        assert_eq!(room.mid_ordering_table.len(), 1);
        assert_eq!(room.fg_ordering_table.len(), 1);
        assert!(room.bg_ordering_table.contains_key(&0x10));
        assert!(room.mid_ordering_table.contains_key(&0x40));
        assert!(room.fg_ordering_table.contains_key(&0x80));
    }

    #[test]
    fn buckets_preserve_insertion_order() {
        let mut room = Room::new(BG_LAYER_Z, FG_LAYER_Z);
        let mut first = part_with_key(0x70);
        first.x = 1;
        let mut second = part_with_key(0x70);
        second.x = 2;
        room.insert_part(first);
        room.insert_part(second);
        let bucket = &room.fg_ordering_table[&0x70];
        assert_eq!(bucket[0].x, 1);
        assert_eq!(bucket[1].x, 2);
    }

    #[test]
    fn boundary_keys_go_forward() {
        let mut room = Room::new(BG_LAYER_Z, FG_LAYER_Z);
        room.insert_part(part_with_key(BG_LAYER_Z));
        room.insert_part(part_with_key(FG_LAYER_Z));
        assert!(room.mid_ordering_table.contains_key(&BG_LAYER_Z));
        assert!(room.fg_ordering_table.contains_key(&FG_LAYER_Z));
    }
}
