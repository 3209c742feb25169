//! Entity driver and primitive lifter
//!
//! [`Simulator`] owns the whole substrate (CPU, GTE, memory, framebuffer)
//! and drives the run-and-observe loop: seed a room's entities into RAM,
//! run each slot's update routine through the interpreter, then read back
//! the mutated records and the GPU-primitive chains they built and lift
//! them into renderable [`SpritePart`]s binned by z-depth.
//!
//! The per-room cycle always starts from the snapshot taken at
//! initialization, so one room's simulation can never leak state into the
//! next no matter how its update code ended.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::clut::{ClutBanks, IndexedPage, Palette};
use crate::cpu::{reg, Cpu, RunOutcome, SimulationError};
use crate::entity::{
    EntityRecord, EntitySeed, BLEND_FADE_LIGHT, BLEND_LIGHTEN, ENTITY_SIZE, HEART_MAX_UP_ID,
    LIFE_MAX_UP_ID, OBJ_CANDLE, OBJ_PICKUP, OBJ_RELIC, USER_SLOTS,
};
use crate::gte::Gte;
use crate::hooks::Hooks;
use crate::memory::{
    Memory, MemoryError, CLUT_DATA_SIZE, CURRENT_ENTITY_ADDR, GAME_RAM_OFFSET, MAP_RAM_OFFSET,
    POINTER_TABLE_ADDR, PSX_RAM_OFFSET, RAM_BASE_OFFSET, ROOM_HEIGHT_ADDR, ROOM_TILE_DATA_ADDR,
    ROOM_TILE_INDICES_ADDR, ROOM_WIDTH_ADDR, ROOM_X_END_ADDR, ROOM_X_START_ADDR, ROOM_Y_END_ADDR,
    ROOM_Y_START_ADDR,
};
use crate::primitive::{Primitive, PrimitiveKind, CHAIN_PTR_MAX, CHAIN_PTR_MIN, CHAIN_WALK_LIMIT};
use crate::scene::{BlendMode, Entity, Room, Skew, SpritePart, Texture};
use crate::text;

/// Program address of the routine that fills the BIOS-resident palette area
const CLUT_INIT_FUNC: u32 = 0x000E_AD7C;

/// Status word the update routines poll; planted before every run
const GAME_STATUS_ADDR: u32 = 0x0009_7408;
const GAME_STATUS_VALUE: u32 = 0x94;

// Descriptor tables inside the game binary
const WEAPON_DESC_ADDR: u32 = 0x000A_4B04;
const EQUIP_DESC_ADDR: u32 = 0x000A_7718;
const RELIC_TABLE_ADDR: u32 = 0x000A_8720;
const ENEMY_DATA_ADDR: u32 = 0x000A_8900;

// Fixed palettes for the hardcoded pickup sprites
const CANDLE_CLUT: usize = 144;
const LIFE_MAX_UP_CLUT: usize = 128;
const HEART_MAX_UP_CLUT: usize = 145;

/// The framebuffer strip entities stream palette animations through,
/// committed back into the CLUT region after each room
const FB_CLUT_STRIP_Y: usize = 240;
const FB_CLUT_STRIP_W: usize = 768;
const FB_CLUT_STRIP_H: usize = 16;

/// Graphics extracted from the game and map files by the caller: indexed
/// texture pages plus the palette banks the lifter resolves CLUT ids
/// against
pub struct MapGraphics {
    /// Map tileset pages (texture pages below 0x10)
    pub tilesets: Vec<IndexedPage>,
    /// Shared game graphics pages; page 6 carries the candle and power-up
    /// tiles
    pub generic_pages: Vec<IndexedPage>,
    /// 16x16 item/relic sprite cells
    pub item_sprites: Vec<IndexedPage>,
    /// Generic and map palette banks
    pub clut_banks: ClutBanks,
    /// Item palette bank, raw RGB1555
    pub item_cluts: Vec<u8>,
}

impl MapGraphics {
    pub fn empty() -> Self {
        MapGraphics {
            tilesets: Vec::new(),
            generic_pages: Vec::new(),
            item_sprites: Vec::new(),
            clut_banks: ClutBanks::empty(),
            item_cluts: Vec::new(),
        }
    }
}

/// Geometry and graphics for one room, as the map parser delivers them
pub struct RoomMeta {
    pub width: u32,
    pub height: u32,
    pub x_start: u32,
    pub y_start: u32,
    pub x_end: u32,
    pub y_end: u32,
    /// Map-relative addresses of the foreground tile layer
    pub tile_indices_addr: u32,
    pub tile_data_addr: u32,
    /// Ordering-table layer thresholds
    pub bg_z: u16,
    pub fg_z: u16,
    /// Entity texture pages (texture pages 0x10 and up), keyed by
    /// `tpage - 0x10`
    pub texture_pages: HashMap<u16, IndexedPage>,
}

/// The driver facade: one value owns every substrate and is the unit of
/// parallelism (disjoint simulators may run on separate threads; one
/// simulator is strictly sequential)
pub struct Simulator {
    cpu: Cpu,
    mem: Memory,
    gte: Gte,
    hooks: Hooks,
    psx_bin: Vec<u8>,
    game_bin: Vec<u8>,
    map_bin: Vec<u8>,
    entity_functions: Vec<u32>,
    graphics: MapGraphics,
}

impl Simulator {
    /// Load both program binaries, initialize the substrate, run the
    /// palette-initialization routine, and take the reset snapshot
    pub fn new(psx_bin: Vec<u8>, game_bin: Vec<u8>) -> Result<Self, SimulationError> {
        let mut sim = Simulator {
            cpu: Cpu::new(),
            mem: Memory::new(),
            gte: Gte::new(),
            hooks: Hooks::standard(),
            psx_bin,
            game_bin,
            map_bin: Vec::new(),
            entity_functions: Vec::new(),
            graphics: MapGraphics::empty(),
        };
        sim.reset()?;
        info!("running palette initialization");
        sim.cpu
            .run(CLUT_INIT_FUNC, &mut sim.mem, &mut sim.gte, &mut sim.hooks)?;
        sim.mem.snapshot();
        Ok(sim)
    }

    /// Rebuild RAM from the loaded binaries: program images at their fixed
    /// offsets, pointer table from the head of the game binary, palettes
    /// from the mirror, registers cleared
    pub fn reset(&mut self) -> Result<(), SimulationError> {
        self.mem.clear();
        self.install_binaries().map_err(|e| self.mem_err(e))?;
        self.cpu.clear_registers();
        self.gte.reset();
        self.mem
            .write32(GAME_STATUS_ADDR, GAME_STATUS_VALUE)
            .map_err(|e| self.mem_err(e))?;
        Ok(())
    }

    fn install_binaries(&mut self) -> Result<(), MemoryError> {
        let psx = std::mem::take(&mut self.psx_bin);
        let game = std::mem::take(&mut self.game_bin);
        let map = std::mem::take(&mut self.map_bin);
        let result = self
            .mem
            .copy_in(PSX_RAM_OFFSET, &psx)
            .and_then(|_| self.mem.copy_in(GAME_RAM_OFFSET, &game))
            .and_then(|_| {
                if map.is_empty() {
                    Ok(())
                } else {
                    self.mem.copy_in(MAP_RAM_OFFSET, &map)
                }
            });
        self.psx_bin = psx;
        self.game_bin = game;
        self.map_bin = map;
        result?;
        self.mem.reload_cluts();

        // The destination pointer table mirrors the first 0x50 words that
        // follow the game binary's header word
        let mut table = vec![0u8; 0x50 * 4];
        self.mem.copy_out(GAME_RAM_OFFSET + 4, &mut table)?;
        self.mem.copy_in(POINTER_TABLE_ADDR, &table)?;
        Ok(())
    }

    fn mem_err(&self, e: MemoryError) -> SimulationError {
        let MemoryError::OutOfRange(addr) = e;
        SimulationError::OutOfRange { addr, pc: self.cpu.pc }
    }

    /// Copy a map image into RAM at its fixed offset and remember it for
    /// post-restore reinstalls
    pub fn load_map(&mut self, map_bytes: &[u8]) -> Result<(), SimulationError> {
        self.map_bin = map_bytes.to_vec();
        self.mem
            .copy_in(MAP_RAM_OFFSET, map_bytes)
            .map_err(|e| self.mem_err(e))
    }

    /// Install the per-map entity update-function table (indexed by
    /// `entity_id & 0x3FF`, map-relative addresses)
    pub fn set_entity_functions(&mut self, funcs: Vec<u32>) {
        self.entity_functions = funcs;
    }

    /// Install the graphics extracted from the map and game files
    pub fn set_graphics(&mut self, graphics: MapGraphics) {
        self.graphics = graphics;
    }

    /// Install a palette block (write-through to RAM and the mirror)
    pub fn store_clut(&mut self, offset: u32, bytes: &[u8]) -> Result<(), SimulationError> {
        self.mem.store_clut(offset, bytes).map_err(|e| self.mem_err(e))
    }

    /// Peek a word of simulated RAM
    pub fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        self.mem.read32(addr)
    }

    /// Bulk-read simulated RAM
    pub fn copy_out(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.mem.copy_out(addr, buf)
    }

    pub fn framebuffer(&self) -> &crate::framebuffer::Framebuffer {
        &self.hooks.framebuffer
    }

    /// Turn per-run debug tracing on or off
    pub fn set_debug(&mut self, debug: bool) {
        self.cpu.debug = debug;
    }

    /// The main lifting call: restore the substrate, seed the room's
    /// entities, run every update routine, and lift the results
    pub fn simulate_room(&mut self, meta: &RoomMeta, layout: &[EntitySeed]) -> Result<Room, SimulationError> {
        // 1. Back to the reset point, then reinstall what the snapshot
        //    does not cover
        self.mem.restore();
        let map_bin = std::mem::take(&mut self.map_bin);
        self.mem.copy_in(MAP_RAM_OFFSET, &map_bin).map_err(|e| self.mem_err(e))?;
        self.map_bin = map_bin;
        self.mem.reload_cluts();
        self.cpu.clear_registers();
        self.gte.reset();

        // Palettes animated by the previous room may still sit in the
        // framebuffer strip; rebuild the BIOS-resident palette area
        self.run_function(CLUT_INIT_FUNC)?;

        // 2. Clear the allocatable entity slots
        let zeroes = vec![0u8; USER_SLOTS as usize * ENTITY_SIZE];
        self.mem
            .copy_in(EntityRecord::slot_addr(0), &zeroes)
            .map_err(|e| self.mem_err(e))?;

        // 3. Seed the layout
        for seed in layout {
            let func_id = (seed.entity_id & 0x03FF) as usize;
            let func = self
                .entity_functions
                .get(func_id)
                .copied()
                .unwrap_or_default()
                .wrapping_add(RAM_BASE_OFFSET + MAP_RAM_OFFSET);
            let record = EntityRecord::from_seed(seed, func);
            let addr = EntityRecord::slot_addr((seed.slot & 0xFF) as u32);
            self.mem.copy_in(addr, &record.raw).map_err(|e| self.mem_err(e))?;
        }

        // 4. Room metadata at the addresses the update routines read
        self.write_room_meta(meta).map_err(|e| self.mem_err(e))?;

        // 5. Run every occupied slot's update function, twice per slot so
        //    two-pass init code reaches its steady state
        let mut run_flags: HashMap<u32, (bool, Option<String>)> = HashMap::new();
        for slot in 0..USER_SLOTS {
            let record = EntityRecord::from_slot(&self.mem, slot).map_err(|e| self.mem_err(e))?;
            if !record.has_valid_update_function() {
                continue;
            }
            let entry = record.update_function().wrapping_sub(RAM_BASE_OFFSET);
            let slot_addr = EntityRecord::slot_addr(slot);

            let mut exhausted = false;
            let mut error = None;
            for pass in 0..2 {
                self.cpu.regs[reg::A0] = slot_addr;
                self.cpu.regs[reg::S0] = slot_addr + 0x48;
                self.cpu.regs[reg::S1] = slot_addr;
                self.cpu.regs[reg::RA] = crate::cpu::RETURN_SENTINEL;
                self.cpu.regs[reg::SP] = 0x001F_FFC0;
                self.mem
                    .write32(CURRENT_ENTITY_ADDR, slot_addr)
                    .map_err(|e| self.mem_err(e))?;
                self.mem
                    .write32(GAME_STATUS_ADDR, GAME_STATUS_VALUE)
                    .map_err(|e| self.mem_err(e))?;

                match self.run_function(entry) {
                    Ok(outcome) => {
                        if outcome.budget_exhausted {
                            warn!("slot {} pass {} exhausted its budget", slot, pass);
                            exhausted = true;
                        }
                    }
                    Err(e) => {
                        // Recorded against the entity; the room carries on
                        warn!("slot {} pass {} aborted: {}", slot, pass, e);
                        error = Some(e.to_string());
                        break;
                    }
                }
            }
            run_flags.insert(slot, (exhausted, error));
        }

        // Palette rows the entities streamed through the framebuffer are
        // folded back into the CLUT region before lifting
        self.commit_framebuffer_cluts();

        // 6. Read back every populated slot and lift it
        let mut room = Room::new(meta.bg_z, meta.fg_z);
        for slot in 0..USER_SLOTS {
            let record = EntityRecord::from_slot(&self.mem, slot).map_err(|e| self.mem_err(e))?;
            if !record.is_populated() {
                continue;
            }
            let mut entity = Entity::new(slot as u16, record);
            if let Some((exhausted, error)) = run_flags.get(&slot) {
                entity.budget_exhausted = *exhausted;
                entity.run_error = error.clone();
            }
            self.lift_entity(&mut entity, meta);
            for part in &entity.sprites {
                room.insert_part(part.clone());
            }
            room.entities.push(entity);
        }

        info!("room simulated: {} entities", room.entities.len());
        Ok(room)
    }

    /// Run a function with the standard budget
    fn run_function(&mut self, entry: u32) -> Result<RunOutcome, SimulationError> {
        self.cpu.run(entry, &mut self.mem, &mut self.gte, &mut self.hooks)
    }

    fn write_room_meta(&mut self, meta: &RoomMeta) -> Result<(), MemoryError> {
        self.mem.write32(ROOM_WIDTH_ADDR, meta.width)?;
        self.mem.write32(ROOM_HEIGHT_ADDR, meta.height)?;
        self.mem.write32(ROOM_X_START_ADDR, meta.x_start)?;
        self.mem.write32(ROOM_Y_START_ADDR, meta.y_start)?;
        self.mem.write32(ROOM_X_END_ADDR, meta.x_end)?;
        self.mem.write32(ROOM_Y_END_ADDR, meta.y_end)?;
        self.mem
            .write32(ROOM_TILE_INDICES_ADDR, meta.tile_indices_addr + MAP_RAM_OFFSET)?;
        self.mem
            .write32(ROOM_TILE_DATA_ADDR, meta.tile_data_addr + MAP_RAM_OFFSET)?;
        Ok(())
    }

    /// Fold the non-zero bytes of the framebuffer palette strip back into
    /// the CLUT region, preserving palettes the room's entities animated
    fn commit_framebuffer_cluts(&mut self) {
        for k in 0..FB_CLUT_STRIP_W * FB_CLUT_STRIP_H {
            let px = self
                .hooks
                .framebuffer
                .pixel(k % FB_CLUT_STRIP_W, FB_CLUT_STRIP_Y + k / FB_CLUT_STRIP_W);
            let bytes = px.to_le_bytes();
            let off = k * 2;
            if off + 1 < CLUT_DATA_SIZE {
                self.mem.merge_clut_byte(off, bytes[0]);
                self.mem.merge_clut_byte(off + 1, bytes[1]);
            }
        }
    }

    // -- Lifting -------------------------------------------------------------

    fn lift_entity(&mut self, entity: &mut Entity, meta: &RoomMeta) {
        if entity.record.has_primitive_list() {
            self.lift_primitive_chain(entity, meta);
        }

        match entity.record.sprite_bank() {
            // Bank 3 carries the hardcoded pickup family
            3 => match entity.record.object_id() {
                OBJ_CANDLE if entity.record.blend_mode() == BLEND_FADE_LIGHT => {
                    self.lift_candle(entity)
                }
                OBJ_PICKUP => self.lift_pickup(entity),
                OBJ_RELIC => self.lift_relic(entity),
                _ => {}
            },
            0 => {}
            // Everything else names itself through the enemy descriptor
            // array
            _ => {
                let idx = entity.record.info_index();
                if idx > 0 {
                    let addr = ENEMY_DATA_ADDR + idx as u32 * 0x28;
                    if let Ok(ptr) = self.mem.read32(addr) {
                        let name = text::read_game_string(&self.mem, text::deref_string_ptr(ptr));
                        if !name.is_empty() {
                            entity.name = Some(name);
                        }
                    }
                }
            }
        }
    }

    /// Walk the singly-linked primitive chain the entity built in RAM and
    /// lift each record. Parts come out in reverse chain order (the list
    /// head is drawn last).
    fn lift_primitive_chain(&mut self, entity: &mut Entity, meta: &RoomMeta) {
        let mut ptr = entity.record.primitives_addr();
        let mut parts: Vec<SpritePart> = Vec::new();

        for step in 0..=CHAIN_WALK_LIMIT {
            if step == CHAIN_WALK_LIMIT {
                entity.lift_anomaly = Some(format!("primitive chain exceeded {} records", CHAIN_WALK_LIMIT));
                break;
            }
            if !(CHAIN_PTR_MIN..CHAIN_PTR_MAX).contains(&ptr) {
                entity.lift_anomaly = Some(format!("primitive pointer ${:08X} outside RAM", ptr));
                break;
            }
            let addr = ptr - RAM_BASE_OFFSET;
            let prim = match Primitive::read(&self.mem, addr) {
                Ok(p) => p,
                Err(e) => {
                    entity.lift_anomaly = Some(e.to_string());
                    break;
                }
            };

            let Some(kind) = prim.kind() else {
                entity.lift_anomaly = Some(format!("unrecognized primitive code {:02X}", prim.code));
                break;
            };

            match self.lift_primitive(&prim, kind, entity, meta) {
                LiftStep::Part(part) => parts.push(part),
                LiftStep::Skip => {}
                LiftStep::Stop => break,
            }

            if prim.tag == 0 {
                break;
            }
            ptr = prim.tag;
        }

        // The chain is drawn head-last
        parts.reverse();
        entity.sprites.extend(parts);
    }

    fn lift_primitive(
        &mut self,
        prim: &Primitive,
        kind: PrimitiveKind,
        entity: &Entity,
        meta: &RoomMeta,
    ) -> LiftStep {
        let record = &entity.record;
        let mut part = SpritePart::new(kind);
        part.semi_transparent = prim.semi_transparent();
        part.shade_texture = prim.shade_texture();
        part.ot_key = prim.ot_key();
        part.corner_colors = prim.corner_colors();

        match kind {
            PrimitiveKind::Sprite => {
                let (w, h) = prim.sprite_size();
                let tpage = prim.sprite_tpage();
                part.width = w as u32;
                part.height = h as u32;
                part.offset_x = prim.x0 as i32;
                part.offset_y = prim.y0 as i32;
                part.flip_x = (prim.x0 > prim.x1) ^ (prim.u0 > prim.u1);
                part.flip_y = (prim.y0 > prim.y2) ^ (prim.v0 > prim.v2);
                part.texture = self.page_texture(
                    tpage,
                    meta,
                    prim.u0 as usize,
                    prim.v0 as usize,
                    w as usize,
                    h as usize,
                    prim.clut,
                );
            }

            PrimitiveKind::Tile => {
                let (w, h) = (prim.u1 as u32, prim.v1 as u32);
                part.width = w;
                part.height = h;
                part.offset_x = prim.x0 as i32;
                part.offset_y = prim.y0 as i32;
                part.texture = Some(solid_texture(w, h, [prim.r0, prim.g0, prim.b0], prim.semi_transparent()));
            }

            PrimitiveKind::PolyG4 | PrimitiveKind::PolyGt4 => {
                let left = prim.u0.min(prim.u1) as usize;
                let top = prim.v0.min(prim.v2) as usize;
                let mut tex_w = (prim.u0.abs_diff(prim.u3) as usize / 4) * 4;
                let mut tex_h = (prim.v0.abs_diff(prim.v3) as usize / 4) * 4;
                if tex_w == 0 && tex_h == 0 {
                    tex_w = (prim.x0.abs_diff(prim.x3) as usize / 4) * 4;
                    tex_h = (prim.y0.abs_diff(prim.y3) as usize / 4) * 4;
                }
                if tex_w == 0 && tex_h == 0 {
                    // A quad with no extent ends the chain walk
                    debug!("zero-extent quad, stopping chain walk");
                    return LiftStep::Stop;
                }

                part.offset_x = prim.x0.min(prim.x1) as i32;
                part.offset_y = prim.y0.min(prim.y2) as i32;
                if part.offset_x != 0 || part.offset_y != 0 {
                    // The primitive carries absolute room coordinates
                    part.width = prim.x1.abs_diff(prim.x0) as u32;
                    part.height = prim.y2.abs_diff(prim.y0) as u32;
                } else {
                    part.width = prim.u1.abs_diff(prim.u0) as u32;
                    part.height = prim.v2.abs_diff(prim.v0) as u32;
                    part.offset_x += record.pos_x() as i32;
                    part.offset_y += record.pos_y() as i32;
                }

                if kind == PrimitiveKind::PolyGt4 {
                    part.texture =
                        self.page_texture(prim.tpage, meta, left, top, tex_w, tex_h, prim.clut);
                } else {
                    part.texture = Some(gouraud_texture(
                        part.width,
                        part.height,
                        prim.corner_colors(),
                        prim.semi_transparent(),
                    ));
                }

                part.flip_x = (prim.x0 > prim.x1) ^ (prim.u0 > prim.u1);
                part.flip_y = (prim.y0 > prim.y2) ^ (prim.v0 > prim.v2);
                part.skew = Skew {
                    top_right_y: prim.y1 as i32 - prim.y0 as i32,
                    bottom_left_x: prim.x2 as i32 - prim.x0 as i32,
                    bottom_right_x: prim.x3 as i32 - prim.x1 as i32,
                    bottom_right_y: prim.y3 as i32 - prim.y2 as i32,
                };
            }

            PrimitiveKind::PolyGt3 => {
                let left = prim.u0.min(prim.u1).min(prim.u2) as usize;
                let top = prim.v0.min(prim.v1).min(prim.v2) as usize;
                let right = prim.u0.max(prim.u1).max(prim.u2) as usize;
                let bottom = prim.v0.max(prim.v1).max(prim.v2) as usize;
                let mut tex_w = ((right - left) / 4) * 4;
                let mut tex_h = ((bottom - top) / 4) * 4;

                let min_x = prim.x0.min(prim.x1).min(prim.x2);
                let min_y = prim.y0.min(prim.y1).min(prim.y2);
                let max_x = prim.x0.max(prim.x1).max(prim.x2);
                let max_y = prim.y0.max(prim.y1).max(prim.y2);

                if tex_w == 0 && tex_h == 0 {
                    tex_w = (max_x.abs_diff(min_x) as usize / 4) * 4;
                    tex_h = (max_y.abs_diff(min_y) as usize / 4) * 4;
                }
                if tex_w == 0 && tex_h == 0 {
                    return LiftStep::Stop;
                }

                part.offset_x = min_x as i32;
                part.offset_y = min_y as i32;
                if part.offset_x != 0 || part.offset_y != 0 {
                    part.width = max_x.abs_diff(min_x) as u32;
                    part.height = max_y.abs_diff(min_y) as u32;
                } else {
                    part.width = (right - left) as u32;
                    part.height = (bottom - top) as u32;
                    part.offset_x += record.pos_x() as i32;
                    part.offset_y += record.pos_y() as i32;
                }

                part.texture = self.page_texture(prim.tpage, meta, left, top, tex_w, tex_h, prim.clut);
            }

            PrimitiveKind::DrawEnv => {
                // Parsed for completeness; not a renderable part
                let env = self.parse_drawenv(prim);
                debug!("draw environment update: {:?}", env);
                return LiftStep::Skip;
            }

            PrimitiveKind::LineG2 => return LiftStep::Skip,
        }

        // Common presentation state from the entity record
        part.x = part.offset_x;
        part.y = part.offset_y;
        let hb_w = if record.hitbox_width() > 0 { record.hitbox_width() as i32 } else { 16 };
        let hb_h = if record.hitbox_height() > 0 { record.hitbox_height() as i32 } else { 16 };
        part.anchor_x = record.pos_x() as i32 + hb_w / 2;
        part.anchor_y = record.pos_y() as i32 + hb_h / 2;
        part.rotate = record.rotation() as i32;
        part.blend_mode = entity_blend_mode(record.blend_mode());

        LiftStep::Part(part)
    }

    /// Resolve a texture page and cut an RGBA texture out of it through
    /// the primitive's palette
    #[allow(clippy::too_many_arguments)]
    fn page_texture(
        &self,
        tpage: u16,
        meta: &RoomMeta,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
        clut: u16,
    ) -> Option<Texture> {
        let page = if tpage < 0x10 {
            self.graphics.tilesets.get(tpage as usize & 7)?
        } else {
            meta.texture_pages.get(&(tpage - 0x10))?
        };
        let palette = self.graphics.clut_banks.resolve(&self.mem, clut);
        Some(Texture {
            width: w as u32,
            height: h as u32,
            rgba: page.expand(x, y, w, h, &palette),
        })
    }

    fn parse_drawenv(&self, prim: &Primitive) -> DrawEnvUpdate {
        let mut env = DrawEnvUpdate::default();
        let base = prim.drawenv_addr();
        // The code array follows the record's tag word
        for idx in 0..15 {
            let Ok(code) = self.mem.read32(base + 4 + idx * 4) else { break };
            match (code >> 24) as u8 {
                0xE1 => {
                    env.tpage = (code & 0x1FF) as u16;
                    env.dfe = code & 0x400 != 0;
                    env.dtd = code & 0x200 != 0;
                }
                0xE2 => {
                    env.tw = (
                        ((code >> 10) & 0x1F) as u16 * 8,
                        ((code >> 15) & 0x1F) as u16 * 8,
                        (code & 0x1F) as u16 * 8,
                        ((code >> 5) & 0x1F) as u16 * 8,
                    );
                }
                0xE3 => {
                    env.clip.0 = (code & 0xFFF) as u16;
                    env.clip.1 = ((code >> 12) & 0xFFF) as u16;
                }
                0xE4 => {
                    env.clip.2 = ((code & 0xFFF) as u16).wrapping_sub(env.clip.0).wrapping_add(1);
                    env.clip.3 = (((code >> 12) & 0xFFF) as u16)
                        .wrapping_sub(env.clip.1)
                        .wrapping_add(1);
                }
                0xE5 => {
                    env.ofs = ((code & 0xFFF) as u16, ((code >> 12) & 0xFFF) as u16);
                }
                _ => {}
            }
        }
        env
    }

    // -- Hardcoded pickup family ---------------------------------------------

    /// Shared tail for the fixed-sprite kinds: cut the cell, flag blending,
    /// and place at the entity with the entity's z as the OT key
    fn push_fixed_sprite(
        entity: &mut Entity,
        page: Option<&IndexedPage>,
        src: (usize, usize),
        size: (u32, u32),
        palette: Palette,
    ) {
        let Some(page) = page else { return };
        let (w, h) = size;
        let mut part = SpritePart::new(PrimitiveKind::Sprite);
        part.width = w;
        part.height = h;
        part.offset_x = -(w as i32) / 2;
        part.offset_y = -(h as i32) / 2;
        part.x = part.offset_x + entity.record.pos_x() as i32;
        part.y = part.offset_y + entity.record.pos_y() as i32;

        let rgba = page.expand(src.0, src.1, w as usize, h as usize, &palette);
        part.blend = rgba.chunks_exact(4).any(|px| px[3] == 0x80);
        part.texture = Some(Texture { width: w, height: h, rgba });

        part.rotate = entity.record.rotation() as i32;
        part.blend_mode = entity_blend_mode(entity.record.blend_mode());
        part.ot_key = entity.record.z_depth() as u16;
        entity.sprites.push(part);
    }

    fn generic_palette(&self, index: usize) -> Palette {
        let off = index * 32;
        if off + 32 <= self.graphics.clut_banks.generic.len() {
            Palette::from_rgb1555(&self.graphics.clut_banks.generic[off..off + 32])
        } else {
            Palette([[0; 4]; 16])
        }
    }

    fn item_palette(&self, index: usize) -> Palette {
        let off = index * 32;
        if off + 32 <= self.graphics.item_cluts.len() {
            Palette::from_rgb1555(&self.graphics.item_cluts[off..off + 32])
        } else {
            Palette([[0; 4]; 16])
        }
    }

    fn lift_candle(&mut self, entity: &mut Entity) {
        let palette = self.generic_palette(CANDLE_CLUT);
        Self::push_fixed_sprite(
            entity,
            self.graphics.generic_pages.get(6),
            (0x80, 0x80),
            (24, 24),
            palette,
        );
    }

    fn lift_pickup(&mut self, entity: &mut Entity) {
        let state = entity.record.initial_state();
        if state == LIFE_MAX_UP_ID || state == HEART_MAX_UP_ID {
            // The stat power-ups use fixed tiles out of the shared page
            let (src, clut, name) = if state == LIFE_MAX_UP_ID {
                ((0x80 + 112, 0x80 + 16), LIFE_MAX_UP_CLUT, "Life Max Up")
            } else {
                ((0x80, 0x80 + 48), HEART_MAX_UP_CLUT, "Heart Max Up")
            };
            entity.name = Some(name.to_string());
            let palette = self.generic_palette(clut);
            Self::push_fixed_sprite(
                entity,
                self.graphics.generic_pages.get(6),
                src,
                (16, 16),
                palette,
            );
            return;
        }

        // Weapon and equipment descriptors differ in stride and in where
        // the sprite/CLUT word sits
        let item = (state & 0x7FFF) as u32;
        let (data_addr, data_size) = if item < 0xA9 {
            (WEAPON_DESC_ADDR + item * 0x34, 0x2C)
        } else {
            (EQUIP_DESC_ADDR + (item - 0xA9) * 0x20, 0x18)
        };

        if let Ok(name_ptr) = self.mem.read32(data_addr) {
            let name = text::read_game_string(&self.mem, text::deref_string_ptr(name_ptr));
            if !name.is_empty() {
                entity.name = Some(name);
            }
        }
        if let Ok(desc_ptr) = self.mem.read32(data_addr + 4) {
            entity.description =
                Some(text::read_sjis_string(&self.mem, text::deref_string_ptr(desc_ptr)));
        }

        let Ok(data) = self.mem.read32(data_addr + data_size) else { return };
        let clut_id = (data >> 16) as usize;
        let item_id = (data & 0xFFFF) as usize;
        let palette = self.item_palette(clut_id);
        Self::push_fixed_sprite(
            entity,
            self.graphics.item_sprites.get(item_id),
            (0, 0),
            (16, 16),
            palette,
        );
    }

    fn lift_relic(&mut self, entity: &mut Entity) {
        let relic = (entity.record.initial_state() & 0x7FFF) as u32;
        let data_addr = RELIC_TABLE_ADDR + relic * 16;

        if let Ok(name_ptr) = self.mem.read32(data_addr) {
            let name = text::read_sjis_string(&self.mem, text::deref_string_ptr(name_ptr));
            entity.name = Some(name.trim_start().to_string());
        }
        if let Ok(desc_ptr) = self.mem.read32(data_addr + 4) {
            entity.description =
                Some(text::read_sjis_string(&self.mem, text::deref_string_ptr(desc_ptr)));
        }

        let Ok(data) = self.mem.read32(data_addr + 8) else { return };
        let clut_id = (data >> 16) as usize;
        let relic_id = (data & 0xFFFF) as usize;
        let palette = self.item_palette(clut_id);
        Self::push_fixed_sprite(
            entity,
            self.graphics.item_sprites.get(relic_id),
            (0, 0),
            (16, 16),
            palette,
        );
    }
}

/// Outcome of lifting one primitive record
enum LiftStep {
    Part(SpritePart),
    Skip,
    Stop,
}

/// Draw-environment state parsed out of a DrawEnv record
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DrawEnvUpdate {
    tpage: u16,
    dfe: bool,
    dtd: bool,
    /// Texture window (x, y, w, h)
    tw: (u16, u16, u16, u16),
    /// Clip rectangle (x, y, w, h)
    clip: (u16, u16, u16, u16),
    ofs: (u16, u16),
}

fn entity_blend_mode(blend: u8) -> BlendMode {
    if blend & BLEND_FADE_LIGHT == BLEND_FADE_LIGHT {
        BlendMode::FadeLight
    } else if blend & BLEND_LIGHTEN == BLEND_LIGHTEN {
        BlendMode::Lighten
    } else {
        BlendMode::Opaque
    }
}

fn solid_texture(w: u32, h: u32, rgb: [u8; 3], semi: bool) -> Texture {
    let alpha = if semi { 0x80 } else { 0xFF };
    let mut rgba = Vec::with_capacity((w * h * 4) as usize);
    for _ in 0..w * h {
        rgba.extend_from_slice(&[rgb[0], rgb[1], rgb[2], alpha]);
    }
    Texture { width: w, height: h, rgba }
}

fn lerp(a: u8, b: u8, t: f32) -> u8 {
    (a as f32 + (b as f32 - a as f32) * t) as u8
}

/// Bilinearly interpolate the four corner colors across the quad
fn gouraud_texture(w: u32, h: u32, corners: [[u8; 3]; 4], semi: bool) -> Texture {
    let alpha = if semi { 0x80 } else { 0xFF };
    let mut rgba = vec![0u8; (w * h * 4) as usize];
    for y in 0..h {
        for x in 0..w {
            let horiz = x as f32 / w as f32;
            let vert = y as f32 / h as f32;
            let o = ((y * w + x) * 4) as usize;
            for ch in 0..3 {
                let top = lerp(corners[0][ch], corners[1][ch], horiz);
                let bottom = lerp(corners[3][ch], corners[2][ch], horiz);
                rgba[o + ch] = lerp(top, bottom, vert);
            }
            rgba[o + 3] = alpha;
        }
    }
    Texture { width: w, height: h, rgba }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_mode_selection() {
        assert_eq!(entity_blend_mode(0x00), BlendMode::Opaque);
        assert_eq!(entity_blend_mode(0x20), BlendMode::Lighten);
        assert_eq!(entity_blend_mode(0x70), BlendMode::FadeLight);
        // The fade bits include the lighten bit; fade wins
        assert_eq!(entity_blend_mode(0xF0), BlendMode::FadeLight);
    }

    #[test]
    fn gouraud_corners_are_exact() {
        let tex = gouraud_texture(
            4,
            4,
            [[0, 0, 0], [255, 0, 0], [0, 255, 0], [0, 0, 255]],
            false,
        );
        // Top-left pixel carries corner 0 exactly
        assert_eq!(&tex.rgba[0..4], &[0, 0, 0, 0xFF]);
        // Alpha is opaque throughout
        assert!(tex.rgba.chunks_exact(4).all(|px| px[3] == 0xFF));
    }

    #[test]
    fn solid_texture_alpha_tracks_transparency() {
        let opaque = solid_texture(2, 2, [1, 2, 3], false);
        assert_eq!(&opaque.rgba[0..4], &[1, 2, 3, 0xFF]);
        let translucent = solid_texture(1, 1, [9, 9, 9], true);
        assert_eq!(translucent.rgba[3], 0x80);
    }
}
