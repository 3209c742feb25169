//! # castle-lifter
//!
//! Command-line front end for the scene lifter: loads the two program
//! binaries plus a map image, simulates a room's entity layout, and writes
//! the lifted scene to disk as a bincode dump (plus optional PNG renders of
//! the lifted textures and the framebuffer).

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use castle_lifter::clut::rgb1555_to_rgba;
use castle_lifter::driver::{MapGraphics, RoomMeta, Simulator};
use castle_lifter::entity::EntitySeed;
use castle_lifter::framebuffer::{FB_HEIGHT, FB_WIDTH};
use castle_lifter::scene::{BG_LAYER_Z, FG_LAYER_Z};

/// Reconstruct room scene data by running entity update code under
/// emulation
#[derive(Parser, Debug)]
#[command(name = "castle-lifter", version, about)]
struct Args {
    /// Main PSX executable (SLUS_000.67)
    psx_bin: PathBuf,

    /// Resident game binary (DRA.BIN)
    game_bin: PathBuf,

    /// Map data binary
    map_bin: PathBuf,

    /// Entity layout: raw seed records (x, y, id, slot, state as
    /// little-endian u16 each)
    #[arg(long)]
    layout: PathBuf,

    /// Entity update-function table: raw little-endian u32 list
    #[arg(long)]
    functions: PathBuf,

    /// Output directory
    #[arg(long, default_value = "out")]
    out: PathBuf,

    /// Room width in pixels
    #[arg(long, default_value_t = 256)]
    room_width: u32,

    /// Room height in pixels
    #[arg(long, default_value_t = 256)]
    room_height: u32,

    /// Write the final framebuffer as a PNG
    #[arg(long)]
    dump_fb: bool,

    /// Write each lifted sprite texture as a PNG
    #[arg(long)]
    dump_sprites: bool,

    /// Per-instruction trace logging
    #[arg(long)]
    debug: bool,
}

fn read_layout(path: &PathBuf) -> Result<Vec<EntitySeed>> {
    let bytes = fs::read(path).with_context(|| format!("reading layout {}", path.display()))?;
    if bytes.len() % 10 != 0 {
        bail!("layout file is not a whole number of 10-byte seed records");
    }
    let half = |c: &[u8], i: usize| u16::from_le_bytes([c[i], c[i + 1]]);
    Ok(bytes
        .chunks_exact(10)
        .map(|c| EntitySeed {
            x: half(c, 0) as i16,
            y: half(c, 2) as i16,
            entity_id: half(c, 4),
            slot: half(c, 6),
            initial_state: half(c, 8),
        })
        .collect())
}

fn read_function_table(path: &PathBuf) -> Result<Vec<u32>> {
    let bytes =
        fs::read(path).with_context(|| format!("reading function table {}", path.display()))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let psx_bin = fs::read(&args.psx_bin)
        .with_context(|| format!("reading PSX binary {}", args.psx_bin.display()))?;
    let game_bin = fs::read(&args.game_bin)
        .with_context(|| format!("reading game binary {}", args.game_bin.display()))?;
    let map_bin = fs::read(&args.map_bin)
        .with_context(|| format!("reading map binary {}", args.map_bin.display()))?;

    let layout = read_layout(&args.layout)?;
    let functions = read_function_table(&args.functions)?;
    info!(
        "{} seeds, {} entity functions",
        layout.len(),
        functions.len()
    );

    let mut sim = Simulator::new(psx_bin, game_bin).context("initializing simulator")?;
    sim.set_debug(args.debug);
    sim.load_map(&map_bin).context("loading map image")?;
    sim.set_entity_functions(functions);
    sim.set_graphics(MapGraphics::empty());

    let meta = RoomMeta {
        width: args.room_width,
        height: args.room_height,
        x_start: 0,
        y_start: 0,
        x_end: args.room_width / 256,
        y_end: args.room_height / 256,
        tile_indices_addr: 0,
        tile_data_addr: 0,
        bg_z: BG_LAYER_Z,
        fg_z: FG_LAYER_Z,
        texture_pages: Default::default(),
    };

    let room = sim
        .simulate_room(&meta, &layout)
        .context("simulating room")?;

    for entity in &room.entities {
        info!(
            "slot {:3}  object {:04X}  at ({}, {})  {} parts{}{}",
            entity.slot,
            entity.record.object_id(),
            entity.record.pos_x(),
            entity.record.pos_y(),
            entity.sprites.len(),
            entity.name.as_deref().map(|n| format!("  \"{}\"", n)).unwrap_or_default(),
            if entity.budget_exhausted { "  [budget exhausted]" } else { "" },
        );
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("creating output directory {}", args.out.display()))?;

    // Scene dump
    let scene_path = args.out.join("scene.bin");
    let mut file = fs::File::create(&scene_path)
        .with_context(|| format!("creating {}", scene_path.display()))?;
    bincode::serde::encode_into_std_write(&room, &mut file, bincode::config::standard())
        .context("serializing scene")?;
    info!("wrote {}", scene_path.display());

    if args.dump_sprites {
        for entity in &room.entities {
            for (i, part) in entity.sprites.iter().enumerate() {
                let Some(tex) = &part.texture else { continue };
                if tex.width == 0 || tex.height == 0 {
                    continue;
                }
                let Some(img) =
                    image::RgbaImage::from_raw(tex.width, tex.height, tex.rgba.clone())
                else {
                    continue;
                };
                let path = args
                    .out
                    .join(format!("entity_{:03}_part_{:02}.png", entity.slot, i));
                img.save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
    }

    if args.dump_fb {
        let fb = sim.framebuffer();
        let mut rgba = Vec::with_capacity(FB_WIDTH * FB_HEIGHT * 4);
        for px in fb.pixels() {
            rgba.extend_from_slice(&rgb1555_to_rgba(*px));
        }
        let img = image::RgbaImage::from_raw(FB_WIDTH as u32, FB_HEIGHT as u32, rgba)
            .expect("framebuffer dimensions are fixed");
        let path = args.out.join("framebuffer.png");
        img.save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("wrote {}", path.display());
    }

    Ok(())
}
