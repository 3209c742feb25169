//! GTE (Geometry Transformation Engine) implementation
//!
//! The GTE is coprocessor 2 of the PSX, a fixed-point vector/matrix unit the
//! game leans on for sprite transforms and lighting. It exposes 32 data and
//! 32 control registers and a command word whose low six bits select one of
//! the operations below.
//!
//! Every command clears the `FLAG` register, runs its per-stage saturating
//! limiters (each limiter records a dedicated flag bit), and finally folds
//! the stage bits into the bit-31 error summary. Division is performed with
//! the hardware's 257-entry reciprocal table rather than a true divide, and
//! the MVMVA far-color path reproduces the hardware's truncated-sum bug.
//!
//! Reference: <http://problemkaputt.de/psx-spx.htm#geometrytransformationenginegte>

use log::{debug, trace, warn};

/// Reciprocal table for the unsigned Newton-Raphson division
const DIV_TABLE: [u8; 257] = [
    0xFF, 0xFD, 0xFB, 0xF9, 0xF7, 0xF5, 0xF3, 0xF1, 0xEF, 0xEE, 0xEC, 0xEA, 0xE8, 0xE6, 0xE4, 0xE3,
    0xE1, 0xDF, 0xDD, 0xDC, 0xDA, 0xD8, 0xD6, 0xD5, 0xD3, 0xD1, 0xD0, 0xCE, 0xCD, 0xCB, 0xC9, 0xC8,
    0xC6, 0xC5, 0xC3, 0xC1, 0xC0, 0xBE, 0xBD, 0xBB, 0xBA, 0xB8, 0xB7, 0xB5, 0xB4, 0xB2, 0xB1, 0xB0,
    0xAE, 0xAD, 0xAB, 0xAA, 0xA9, 0xA7, 0xA6, 0xA4, 0xA3, 0xA2, 0xA0, 0x9F, 0x9E, 0x9C, 0x9B, 0x9A,
    0x99, 0x97, 0x96, 0x95, 0x94, 0x92, 0x91, 0x90, 0x8F, 0x8D, 0x8C, 0x8B, 0x8A, 0x89, 0x87, 0x86,
    0x85, 0x84, 0x83, 0x82, 0x81, 0x7F, 0x7E, 0x7D, 0x7C, 0x7B, 0x7A, 0x79, 0x78, 0x77, 0x75, 0x74,
    0x73, 0x72, 0x71, 0x70, 0x6F, 0x6E, 0x6D, 0x6C, 0x6B, 0x6A, 0x69, 0x68, 0x67, 0x66, 0x65, 0x64,
    0x63, 0x62, 0x61, 0x60, 0x5F, 0x5E, 0x5D, 0x5D, 0x5C, 0x5B, 0x5A, 0x59, 0x58, 0x57, 0x56, 0x55,
    0x54, 0x53, 0x53, 0x52, 0x51, 0x50, 0x4F, 0x4E, 0x4D, 0x4D, 0x4C, 0x4B, 0x4A, 0x49, 0x48, 0x48,
    0x47, 0x46, 0x45, 0x44, 0x43, 0x43, 0x42, 0x41, 0x40, 0x3F, 0x3F, 0x3E, 0x3D, 0x3C, 0x3C, 0x3B,
    0x3A, 0x39, 0x39, 0x38, 0x37, 0x36, 0x36, 0x35, 0x34, 0x33, 0x33, 0x32, 0x31, 0x31, 0x30, 0x2F,
    0x2E, 0x2E, 0x2D, 0x2C, 0x2C, 0x2B, 0x2A, 0x2A, 0x29, 0x28, 0x28, 0x27, 0x26, 0x26, 0x25, 0x24,
    0x24, 0x23, 0x22, 0x22, 0x21, 0x20, 0x20, 0x1F, 0x1E, 0x1E, 0x1D, 0x1D, 0x1C, 0x1B, 0x1B, 0x1A,
    0x19, 0x19, 0x18, 0x18, 0x17, 0x16, 0x16, 0x15, 0x15, 0x14, 0x14, 0x13, 0x12, 0x12, 0x11, 0x11,
    0x10, 0x0F, 0x0F, 0x0E, 0x0E, 0x0D, 0x0D, 0x0C, 0x0C, 0x0B, 0x0A, 0x0A, 0x09, 0x09, 0x08, 0x08,
    0x07, 0x07, 0x06, 0x06, 0x05, 0x05, 0x04, 0x04, 0x03, 0x03, 0x02, 0x02, 0x01, 0x01, 0x00, 0x00,
    0x00,
];

/// Stage bits folded into the bit-31 error summary (bits 30..23 and 18..13)
const FLAG_ERROR_MASK: u32 = 0x7F87_E000;

/// Geometry coprocessor state
///
/// Data registers hold input vectors, FIFOs, and accumulators; control
/// registers hold the matrices, translation vectors, and projection
/// parameters. Both files are read and written through the 32-entry packing
/// rules in [`Gte::read_data`] and friends, which is how MFC2/MTC2/CFC2/CTC2
/// and LWC2/SWC2 see them.
pub struct Gte {
    // Data registers
    /// Input vectors V0..V2 (x, y, z)
    vx: [[i16; 3]; 3],
    /// Color/code register
    rgbc: [u8; 4],
    /// Average Z (ordering table key)
    otz: u16,
    /// Intermediate results; IR0 is the interpolation factor
    ir: [i16; 4],
    /// Screen XY FIFO; entry 3 mirrors the newest push
    sxy_fifo: [(i16, i16); 4],
    /// Screen Z FIFO
    sz_fifo: [u16; 4],
    /// Color FIFO
    rgbc_fifo: [[u8; 4]; 3],
    /// Math accumulators
    mac: [i32; 4],
    /// Leading-zero-count source and result
    lzcs: i32,
    lzcr: u32,

    // Control registers
    rot: [[i16; 3]; 3],
    light: [[i16; 3]; 3],
    lcol: [[i16; 3]; 3],
    tr: [i32; 3],
    bg: [i32; 3],
    fc: [i32; 3],
    ofx: i32,
    ofy: i32,
    h: u16,
    dqa: i16,
    dqb: i32,
    zsf3: i16,
    zsf4: i16,
    /// Saturation/overflow flags; bit 31 is the error summary
    pub flag: u32,
}

impl Gte {
    /// Create a GTE with all registers cleared
    pub fn new() -> Self {
        Gte {
            vx: [[0; 3]; 3],
            rgbc: [0; 4],
            otz: 0,
            ir: [0; 4],
            sxy_fifo: [(0, 0); 4],
            sz_fifo: [0; 4],
            rgbc_fifo: [[0; 4]; 3],
            mac: [0; 4],
            lzcs: 0,
            lzcr: 0,
            rot: [[0; 3]; 3],
            light: [[0; 3]; 3],
            lcol: [[0; 3]; 3],
            tr: [0; 3],
            bg: [0; 3],
            fc: [0; 3],
            ofx: 0,
            ofy: 0,
            h: 0,
            dqa: 0,
            dqb: 0,
            zsf3: 0,
            zsf4: 0,
            flag: 0,
        }
    }

    /// Reset all registers to zero
    pub fn reset(&mut self) {
        *self = Gte::new();
    }

    /// Number of leading zeros in the low `num_bits` of `value`
    fn count_leading_zeros(value: u32, num_bits: u32) -> u32 {
        (value << (32 - num_bits)).leading_zeros().min(num_bits)
    }

    // -- Limiters ------------------------------------------------------------

    /// Clamp `x` into `[min, max]`, recording `bit` in FLAG on saturation
    fn lim(&mut self, x: i64, min: i64, max: i64, bit: u32) -> i64 {
        let result = x.clamp(min, max);
        if result != x {
            self.flag |= 1 << bit;
        }
        result
    }

    /// A-limiter for IR1..IR3: signed or unsigned per `lm`, flag bits 24/23/22
    fn lim_a(&mut self, ch: usize, x: i64, lm: u32) -> i16 {
        let min = if lm == 1 { 0 } else { -0x8000 };
        self.lim(x, min, 0x7FFF, 25 - ch as u32) as i16
    }

    /// B-limiter for color components: [0, 0xFF], flag bits 21/20/19
    fn lim_b(&mut self, ch: usize, x: i64) -> u8 {
        self.lim(x, 0, 0xFF, 22 - ch as u32) as u8
    }

    /// C-limiter for SZ/OTZ: [0, 0xFFFF], flag bit 18
    fn lim_c(&mut self, x: i64) -> u16 {
        self.lim(x, 0, 0xFFFF, 18) as u16
    }

    /// D-limiter for screen coordinates: [-0x400, 0x3FF], bits 14/13
    fn lim_d(&mut self, ch: usize, x: i64) -> i16 {
        self.lim(x, -0x400, 0x3FF, 15 - ch as u32) as i16
    }

    /// E-limiter for IR0: [0, 0xFFF], bit 12
    fn lim_e(&mut self, x: i64) -> i16 {
        self.lim(x, 0, 0xFFF, 12) as i16
    }

    /// 44-bit overflow check for MAC1..MAC3 (bits 30/29/28 positive,
    /// 27/26/25 negative), returning the value truncated to 32 bits
    fn check_mac(&mut self, ch: usize, x: i64) -> i32 {
        if x >= 0x800_0000_0000 {
            self.flag |= 1 << (31 - ch as u32);
        }
        if x < -0x800_0000_0000 {
            self.flag |= 1 << (28 - ch as u32);
        }
        x as i32
    }

    /// 32-bit overflow check for MAC0 (bit 16 positive, bit 15 negative)
    fn check_mac0(&mut self, x: i64) -> i32 {
        if x > 0x7FFF_FFFF {
            self.flag |= 1 << 16;
        }
        if x < -0x8000_0000 {
            self.flag |= 1 << 15;
        }
        x as i32
    }

    /// Table-driven unsigned division of `H` by a screen Z. Returns the
    /// 1.15 quotient, or 0x1FFFF with flag 17 when the vertex crosses the
    /// near plane.
    fn divide(&mut self, num: u32, den: u32) -> u32 {
        if den * 2 > num {
            let shift = Self::count_leading_zeros(den, 16);
            let num = num << shift;
            let den = (den << shift) | 0x8000;

            let idx = (((den & 0x7FFF) + 0x40) >> 7) as usize;
            let d = 0x101 + DIV_TABLE[idx] as i32;

            // Newton refinement as the hardware encodes it
            let n1 = (0x80 + (-d * den as i32)) >> 8;
            let n2 = (0x80 + d * (0x20000 + n1)) >> 8;

            let quotient = ((num as u64 * n2 as u64 + 0x8000) >> 16) as u32;
            quotient.min(0x1FFFF)
        } else {
            self.flag |= 1 << 17;
            0x1FFFF
        }
    }

    /// Shared matrix-vector kernel: MAC1..3 = (T<<12 + M*V) >> sf, then the
    /// A-limiters into IR1..3.
    ///
    /// With `far_color` set, the full sums are still evaluated to update the
    /// MAC overflow bits but only the last column product survives into the
    /// accumulators. Intentional bug-compatibility with the hardware's
    /// mishandling of the FC translation vector.
    fn mxv(&mut self, base: [i32; 3], mtx: &[[i16; 3]; 3], vec: [i16; 3], lm: u32, sf: u32, far_color: bool) {
        let mut bases = [0i64; 3];
        let mut sums = [0i64; 3];
        let mut lasts = [0i64; 3];
        for row in 0..3 {
            bases[row] = (base[row] as i64) << 12;
            let partial = mtx[row][0] as i64 * vec[0] as i64 + mtx[row][1] as i64 * vec[1] as i64;
            lasts[row] = mtx[row][2] as i64 * vec[2] as i64;
            sums[row] = partial + lasts[row];
        }

        if far_color {
            for row in 0..3 {
                self.check_mac(1, bases[row] + sums[row]);
            }
            sums = lasts;
            bases = [0; 3];
        }

        for row in 0..3 {
            self.mac[row + 1] = self.check_mac(row + 1, bases[row] + sums[row]) >> sf;
            self.ir[row + 1] = self.lim_a(row + 1, self.mac[row + 1] as i64, lm);
        }
    }

    /// Push a color built from MAC1..3 through the B-limiters into the FIFO
    fn push_rgbc(&mut self) {
        self.rgbc_fifo[0] = self.rgbc_fifo[1];
        self.rgbc_fifo[1] = self.rgbc_fifo[2];
        self.rgbc_fifo[2] = [
            self.lim_b(1, self.mac[1] as i64),
            self.lim_b(2, self.mac[2] as i64),
            self.lim_b(3, self.mac[3] as i64),
            self.rgbc[3],
        ];
    }

    // -- Command dispatch ----------------------------------------------------

    /// Execute a GTE command word (COP2 opcode with bit 25 set)
    pub fn execute(&mut self, opcode: u32) {
        let command = opcode & 0x3F;
        // Whether the IR limiter lower bound is zero (1) or -0x8000 (0)
        let lm = (opcode >> 10) & 1;
        // MVMVA translation vector / multiply vector / multiply matrix
        let tv = (opcode >> 13) & 3;
        let mv = (opcode >> 15) & 3;
        let mm = (opcode >> 17) & 3;
        // Scaling factor: 0 or 12-bit fraction
        let sf = ((opcode >> 19) & 1) * 12;

        self.flag = 0;

        trace!("GTE :: cmd {:02X} lm={} sf={}", command, lm, sf);

        match command {
            0x01 => self.op_rtps(lm, sf),
            0x06 => self.op_nclip(),
            0x0C => self.op_op(sf),
            0x10 => self.op_dpcs(sf),
            0x11 => self.op_intpl(sf),
            0x12 => self.op_mvmva(lm, tv, mv, mm, sf),
            0x13 => self.op_ncds(lm, sf),
            0x14 => self.op_cdp(lm, sf),
            0x16 => self.op_ncdt(lm, sf),
            0x1B => self.op_nccs(lm, sf),
            0x1C => self.op_cc(lm, sf),
            0x1E => self.op_ncs(lm, sf),
            0x20 => self.op_nct(lm, sf),
            0x28 => self.op_sqr(sf),
            0x29 => self.op_dcpl(sf),
            0x2A => self.op_dpct(sf),
            0x2D => self.op_avsz3(),
            0x2E => self.op_avsz4(),
            0x30 => self.op_rtpt(lm, sf),
            0x3D => self.op_gpf(sf),
            0x3E => self.op_gpl(sf),
            0x3F => self.op_ncct(lm, sf),
            _ => {
                warn!("unimplemented GTE command {:02X}, treating as NOP", command);
            }
        }

        // Fold the stage bits into the error summary
        if self.flag & FLAG_ERROR_MASK != 0 {
            self.flag |= 1 << 31;
        }
    }

    // -- Operations ----------------------------------------------------------

    /// Rotate, translate, perspective-project a single vertex
    fn rtp_vertex(&mut self, i: usize, lm: u32, sf: u32) -> i32 {
        let v = self.vx[i];
        let tr = self.tr;
        let rot = self.rot;
        self.mxv(tr, &rot, v, lm, sf, false);

        self.sz_fifo[0] = self.sz_fifo[1];
        self.sz_fifo[1] = self.sz_fifo[2];
        self.sz_fifo[2] = self.sz_fifo[3];
        self.sz_fifo[3] = self.lim_c(self.mac[3] as i64);

        let quot = self.divide(self.h as u32, self.sz_fifo[3] as u32) as i64;

        let sx = self.check_mac0(self.ofx as i64 + self.ir[1] as i64 * quot) >> 16;
        let sy = self.check_mac0(self.ofy as i64 + self.ir[2] as i64 * quot) >> 16;
        let p = self.check_mac0(self.dqb as i64 + self.dqa as i64 * quot);

        self.ir[0] = self.lim_e(p as i64);

        let pushed = (self.lim_d(1, sx as i64), self.lim_d(2, sy as i64));
        self.sxy_fifo[0] = self.sxy_fifo[1];
        self.sxy_fifo[1] = self.sxy_fifo[2];
        self.sxy_fifo[2] = pushed;
        self.sxy_fifo[3] = pushed;

        p
    }

    fn op_rtps(&mut self, lm: u32, sf: u32) {
        let p = self.rtp_vertex(0, lm, sf);
        self.mac[0] = p;
    }

    fn op_rtpt(&mut self, lm: u32, sf: u32) {
        for i in 0..3 {
            self.rtp_vertex(i, lm, sf);
            self.mac[0] = self.ir[0] as i32;
        }
    }

    /// Winding determinant of the three screen points
    fn op_nclip(&mut self) {
        let (sx0, sy0) = self.sxy_fifo[0];
        let (sx1, sy1) = self.sxy_fifo[1];
        let (sx2, sy2) = self.sxy_fifo[2];

        let a = sx0 as i64 * (sy1 as i64 - sy2 as i64);
        let b = sx1 as i64 * (sy2 as i64 - sy0 as i64);
        let c = sx2 as i64 * (sy0 as i64 - sy1 as i64);

        self.mac[0] = self.check_mac0(a + b + c);
    }

    /// Outer product of IR with the rotation matrix diagonal
    fn op_op(&mut self, sf: u32) {
        let d1 = self.rot[0][0] as i64;
        let d2 = self.rot[1][1] as i64;
        let d3 = self.rot[2][2] as i64;
        let (ir1, ir2, ir3) = (self.ir[1] as i64, self.ir[2] as i64, self.ir[3] as i64);

        self.mac[1] = self.check_mac(1, d2 * ir3 - d3 * ir2) >> sf;
        self.mac[2] = self.check_mac(1, d3 * ir1 - d1 * ir3) >> sf;
        self.mac[3] = self.check_mac(1, d1 * ir2 - d2 * ir1) >> sf;

        for ch in 1..4 {
            self.ir[ch] = self.lim_a(ch, self.mac[ch] as i64, 0);
        }
    }

    /// Depth cue a single color from RGBC toward the far color
    fn op_dpcs(&mut self, sf: u32) {
        let base = [
            (self.rgbc[0] as i64) << 12,
            (self.rgbc[1] as i64) << 12,
            (self.rgbc[2] as i64) << 12,
        ];
        self.depth_cue(base, sf);
    }

    /// Depth cue the three FIFO colors in sequence
    fn op_dpct(&mut self, sf: u32) {
        for _ in 0..3 {
            let base = [
                (self.rgbc_fifo[0][0] as i64) << 12,
                (self.rgbc_fifo[0][1] as i64) << 12,
                (self.rgbc_fifo[0][2] as i64) << 12,
            ];
            self.depth_cue(base, sf);
        }
    }

    /// Shared depth-cue tail: MAC = base + IR0 * limA(FC<<12 - base),
    /// signed IR limits, push through the B-limiters
    fn depth_cue(&mut self, base: [i64; 3], sf: u32) {
        let mut diff = [0i64; 3];
        for ch in 0..3 {
            let d = self.check_mac(ch + 1, ((self.fc[ch] as i64) << 12) - base[ch]) >> sf;
            diff[ch] = self.lim_a(ch + 1, d as i64, 0) as i64;
        }
        for ch in 0..3 {
            let mac = self.check_mac(ch + 1, base[ch] + self.ir[0] as i64 * diff[ch]) >> sf;
            self.mac[ch + 1] = mac;
            self.ir[ch + 1] = self.lim_a(ch + 1, mac as i64, 0);
        }
        self.push_rgbc();
    }

    /// Interpolate the IR vector toward the far color
    fn op_intpl(&mut self, sf: u32) {
        let ir = [self.ir[1] as i64, self.ir[2] as i64, self.ir[3] as i64];
        let mut diff = [0i64; 3];
        for ch in 0..3 {
            // No MAC bounds check on the difference term here
            let d = (((self.fc[ch] as i64) << 12) - (ir[ch] << 12)) >> sf;
            diff[ch] = self.lim_a(1, d, 0) as i64;
        }
        for ch in 0..3 {
            let mac = self.check_mac(ch + 1, (ir[ch] << 12) + self.ir[0] as i64 * diff[ch]) >> sf;
            self.mac[ch + 1] = mac;
            self.ir[ch + 1] = self.lim_a(ch + 1, mac as i64, 0);
        }
        self.push_rgbc();
    }

    /// Parameterized matrix-vector multiply
    fn op_mvmva(&mut self, lm: u32, tv: u32, mv: u32, mm: u32, sf: u32) {
        let matrix = match mm {
            0 => self.rot,
            1 => self.light,
            2 => self.lcol,
            // Selecting matrix 3 yields a garbage matrix assembled from
            // fixed constants, IR0, and two rotation entries. Hardware
            // accident, reproduced for bug-compatibility.
            _ => [
                [-0x60, 0x60, self.ir[0]],
                [self.rot[0][2]; 3],
                [self.rot[1][1]; 3],
            ],
        };

        let vector = match mv {
            0 => self.vx[0],
            1 => self.vx[1],
            2 => self.vx[2],
            _ => [self.ir[1], self.ir[2], self.ir[3]],
        };

        let (base, far_color) = match tv {
            0 => (self.tr, false),
            1 => (self.bg, false),
            2 => (self.fc, true),
            _ => ([0; 3], false),
        };

        self.mxv(base, &matrix, vector, lm, sf, far_color);
    }

    /// Light a normal, color it, then depth-cue against the far color
    fn ncd_vertex(&mut self, i: usize, lm: u32, sf: u32) {
        let v = self.vx[i];
        let light = self.light;
        self.mxv([0; 3], &light, v, lm, sf, false);

        let products = [self.ir[1], self.ir[2], self.ir[3]];
        let bg = self.bg;
        let lcol = self.lcol;
        self.mxv(bg, &lcol, products, lm, sf, false);

        let base = [
            (self.rgbc[0] as i64) << 4,
            (self.rgbc[1] as i64) << 4,
            (self.rgbc[2] as i64) << 4,
        ];
        let mut diff = [0i64; 3];
        for ch in 0..3 {
            let d = self
                .check_mac(ch + 1, ((self.fc[ch] as i64) << 12) - base[ch] * self.ir[ch + 1] as i64)
                >> sf;
            diff[ch] = self.lim_a(ch + 1, d as i64, 0) as i64;
        }
        for ch in 0..3 {
            let mac = self
                .check_mac(ch + 1, base[ch] * self.ir[ch + 1] as i64 + self.ir[0] as i64 * diff[ch])
                >> sf;
            self.mac[ch + 1] = mac;
        }
        for ch in 1..4 {
            self.ir[ch] = self.lim_a(ch, self.mac[ch] as i64, 1);
        }
        self.push_rgbc();
    }

    fn op_ncds(&mut self, lm: u32, sf: u32) {
        self.ncd_vertex(0, lm, sf);
    }

    fn op_ncdt(&mut self, lm: u32, sf: u32) {
        for i in 0..3 {
            self.ncd_vertex(i, lm, sf);
        }
    }

    /// The depth-cue tail of NCDS without the light-matrix pass. The flag
    /// assignments mirror NCDS verbatim, mismatch and all.
    fn op_cdp(&mut self, lm: u32, sf: u32) {
        let products = [self.ir[1], self.ir[2], self.ir[3]];
        let bg = self.bg;
        let lcol = self.lcol;
        self.mxv(bg, &lcol, products, lm, sf, false);

        let base = [
            (self.rgbc[0] as i64) << 4,
            (self.rgbc[1] as i64) << 4,
            (self.rgbc[2] as i64) << 4,
        ];
        let mut diff = [0i64; 3];
        for ch in 0..3 {
            let d = self
                .check_mac(ch + 1, ((self.fc[ch] as i64) << 12) - base[ch] * self.ir[ch + 1] as i64)
                >> sf;
            diff[ch] = self.lim_a(ch + 1, d as i64, 0) as i64;
        }
        for ch in 0..3 {
            let mac = self
                .check_mac(ch + 1, base[ch] * self.ir[ch + 1] as i64 + self.ir[0] as i64 * diff[ch])
                >> sf;
            self.mac[ch + 1] = mac;
        }
        for ch in 1..4 {
            self.ir[ch] = self.lim_a(ch, self.mac[ch] as i64, 1);
        }
        self.push_rgbc();
    }

    /// Depth cue a lit color already in IR
    fn op_dcpl(&mut self, sf: u32) {
        let base = [
            (self.rgbc[0] as i64) << 4,
            (self.rgbc[1] as i64) << 4,
            (self.rgbc[2] as i64) << 4,
        ];
        let mut diff = [0i64; 3];
        for ch in 0..3 {
            let d = self
                .check_mac(ch + 1, ((self.fc[ch] as i64) << 12) - base[ch] * self.ir[ch + 1] as i64)
                >> sf;
            diff[ch] = self.lim_a(ch + 1, d as i64, 0) as i64;
        }
        for ch in 0..3 {
            let mac = self
                .check_mac(ch + 1, base[ch] * self.ir[ch + 1] as i64 + self.ir[0] as i64 * diff[ch])
                >> sf;
            self.mac[ch + 1] = mac;
            self.ir[ch + 1] = self.lim_a(ch + 1, mac as i64, 0);
        }
        self.push_rgbc();
    }

    /// Light and color a normal, then scale by RGBC
    fn ncc_vertex(&mut self, i: usize, lm: u32, sf: u32) {
        let v = self.vx[i];
        let light = self.light;
        self.mxv([0; 3], &light, v, lm, sf, false);

        let products = [self.ir[1], self.ir[2], self.ir[3]];
        let bg = self.bg;
        let lcol = self.lcol;
        self.mxv(bg, &lcol, products, lm, sf, false);

        for ch in 0..3 {
            self.mac[ch + 1] =
                (((self.rgbc[ch] as i32) << 4) * self.ir[ch + 1] as i32) >> sf;
        }
        for ch in 1..4 {
            self.ir[ch] = self.lim_a(ch, self.mac[ch] as i64, 1);
        }
        self.push_rgbc();
    }

    fn op_nccs(&mut self, lm: u32, sf: u32) {
        self.ncc_vertex(0, lm, sf);
    }

    fn op_ncct(&mut self, lm: u32, sf: u32) {
        for i in 0..3 {
            self.ncc_vertex(i, lm, sf);
        }
    }

    /// Color-color without the light pass
    fn op_cc(&mut self, lm: u32, sf: u32) {
        let products = [self.ir[1], self.ir[2], self.ir[3]];
        let bg = self.bg;
        let lcol = self.lcol;
        self.mxv(bg, &lcol, products, lm, sf, false);

        for ch in 0..3 {
            self.mac[ch + 1] =
                (((self.rgbc[ch] as i32) << 4) * self.ir[ch + 1] as i32) >> sf;
        }
        for ch in 1..4 {
            self.ir[ch] = self.lim_a(ch, self.mac[ch] as i64, 1);
        }
        self.push_rgbc();
    }

    /// Light and color a normal without depth cue or RGBC scaling
    fn nc_vertex(&mut self, i: usize, lm: u32, sf: u32) {
        let v = self.vx[i];
        let light = self.light;
        self.mxv([0; 3], &light, v, lm, sf, false);

        let products = [self.ir[1], self.ir[2], self.ir[3]];
        let bg = self.bg;
        let lcol = self.lcol;
        self.mxv(bg, &lcol, products, lm, sf, false);

        self.push_rgbc();
    }

    fn op_ncs(&mut self, lm: u32, sf: u32) {
        self.nc_vertex(0, lm, sf);
    }

    fn op_nct(&mut self, lm: u32, sf: u32) {
        for i in 0..3 {
            self.nc_vertex(i, lm, sf);
        }
    }

    /// Component-wise square of IR
    fn op_sqr(&mut self, sf: u32) {
        for ch in 1..4 {
            self.mac[ch] = (self.ir[ch] as i32 * self.ir[ch] as i32) >> sf;
            self.ir[ch] = self.lim_a(ch, self.mac[ch] as i64, 1);
        }
    }

    /// Weighted average of the newest three screen Z values
    fn op_avsz3(&mut self) {
        let sum = self.sz_fifo[1] as i64 + self.sz_fifo[2] as i64 + self.sz_fifo[3] as i64;
        self.mac[0] = self.check_mac0(self.zsf3 as i64 * sum);
        self.otz = self.lim_c((self.mac[0] >> 12) as i64);
    }

    /// Weighted average of all four screen Z values
    fn op_avsz4(&mut self) {
        let sum = self.sz_fifo[0] as i64
            + self.sz_fifo[1] as i64
            + self.sz_fifo[2] as i64
            + self.sz_fifo[3] as i64;
        self.mac[0] = self.check_mac0(self.zsf4 as i64 * sum);
        self.otz = self.lim_c((self.mac[0] >> 12) as i64);
    }

    /// General-purpose interpolation: MAC = IR0 * IR
    fn op_gpf(&mut self, sf: u32) {
        for ch in 1..4 {
            let mac = self.check_mac(ch, self.ir[0] as i64 * self.ir[ch] as i64) >> sf;
            self.mac[ch] = mac;
            self.ir[ch] = self.lim_a(ch, mac as i64, 0);
        }
        self.push_rgbc();
    }

    /// General-purpose interpolation with base: MAC = (MAC << sf) + IR0 * IR
    fn op_gpl(&mut self, sf: u32) {
        for ch in 1..4 {
            let base = (self.mac[ch] as i64) << sf;
            let mac = self.check_mac(ch, base + self.ir[0] as i64 * self.ir[ch] as i64) >> sf;
            self.mac[ch] = mac;
            self.ir[ch] = self.lim_a(ch, mac as i64, 0);
        }
        self.push_rgbc();
    }

    // -- Register file access ------------------------------------------------

    /// Read a data register through the MFC2/SWC2 packing rules
    pub fn read_data(&self, num: u32) -> u32 {
        match num & 0x1F {
            0 => pack16(self.vx[0][0], self.vx[0][1]),
            1 => self.vx[0][2] as i32 as u32,
            2 => pack16(self.vx[1][0], self.vx[1][1]),
            3 => self.vx[1][2] as i32 as u32,
            4 => pack16(self.vx[2][0], self.vx[2][1]),
            5 => self.vx[2][2] as i32 as u32,
            6 => pack_rgbc(self.rgbc),
            7 => self.otz as u32,
            8 => self.ir[0] as i32 as u32,
            9 => self.ir[1] as i32 as u32,
            10 => self.ir[2] as i32 as u32,
            11 => self.ir[3] as i32 as u32,
            12 => pack16(self.sxy_fifo[0].0, self.sxy_fifo[0].1),
            13 => pack16(self.sxy_fifo[1].0, self.sxy_fifo[1].1),
            14 => pack16(self.sxy_fifo[2].0, self.sxy_fifo[2].1),
            15 => pack16(self.sxy_fifo[3].0, self.sxy_fifo[3].1),
            16 => self.sz_fifo[0] as u32,
            17 => self.sz_fifo[1] as u32,
            18 => self.sz_fifo[2] as u32,
            19 => self.sz_fifo[3] as u32,
            20 => pack_rgbc(self.rgbc_fifo[0]),
            21 => pack_rgbc(self.rgbc_fifo[1]),
            22 => pack_rgbc(self.rgbc_fifo[2]),
            23 => {
                debug!("read of reserved GTE data register 23");
                0
            }
            24 => self.mac[0] as u32,
            25 => self.mac[1] as u32,
            26 => self.mac[2] as u32,
            27 => self.mac[3] as u32,
            // IRGB/ORGB both read back IR1..3 packed as 5-5-5
            28 | 29 => {
                let r = ((self.ir[1] as i32) >> 7).clamp(0, 0x1F) as u32;
                let g = ((self.ir[2] as i32) >> 7).clamp(0, 0x1F) as u32;
                let b = ((self.ir[3] as i32) >> 7).clamp(0, 0x1F) as u32;
                r | (g << 5) | (b << 10)
            }
            30 => self.lzcs as u32,
            _ => self.lzcr,
        }
    }

    /// Write a data register through the MTC2/LWC2 packing rules
    pub fn write_data(&mut self, num: u32, value: u32) {
        match num & 0x1F {
            0 => {
                self.vx[0][0] = value as i16;
                self.vx[0][1] = (value >> 16) as i16;
            }
            1 => self.vx[0][2] = value as i16,
            2 => {
                self.vx[1][0] = value as i16;
                self.vx[1][1] = (value >> 16) as i16;
            }
            3 => self.vx[1][2] = value as i16,
            4 => {
                self.vx[2][0] = value as i16;
                self.vx[2][1] = (value >> 16) as i16;
            }
            5 => self.vx[2][2] = value as i16,
            6 => self.rgbc = value.to_le_bytes(),
            7 => self.otz = value as u16,
            8 => self.ir[0] = value as i16,
            9 => self.ir[1] = value as i16,
            10 => self.ir[2] = value as i16,
            11 => self.ir[3] = value as i16,
            12 => self.sxy_fifo[0] = (value as i16, (value >> 16) as i16),
            13 => self.sxy_fifo[1] = (value as i16, (value >> 16) as i16),
            14 => {
                // SXYP mirrors SXY2
                self.sxy_fifo[2] = (value as i16, (value >> 16) as i16);
                self.sxy_fifo[3] = self.sxy_fifo[2];
            }
            15 => {
                // Writing SXYP pushes the FIFO
                self.sxy_fifo[3] = (value as i16, (value >> 16) as i16);
                self.sxy_fifo[0] = self.sxy_fifo[1];
                self.sxy_fifo[1] = self.sxy_fifo[2];
                self.sxy_fifo[2] = self.sxy_fifo[3];
            }
            16 => self.sz_fifo[0] = value as u16,
            17 => self.sz_fifo[1] = value as u16,
            18 => self.sz_fifo[2] = value as u16,
            19 => self.sz_fifo[3] = value as u16,
            20 => self.rgbc_fifo[0] = value.to_le_bytes(),
            21 => self.rgbc_fifo[1] = value.to_le_bytes(),
            22 => self.rgbc_fifo[2] = value.to_le_bytes(),
            23 => debug!("write to reserved GTE data register 23 ignored"),
            24 => self.mac[0] = value as i32,
            25 => self.mac[1] = value as i32,
            26 => self.mac[2] = value as i32,
            27 => self.mac[3] = value as i32,
            28 => {
                // IRGB expands 5-5-5 into IR
                self.ir[0] = ((value & 0x1F) << 7) as i16;
                self.ir[1] = (((value >> 5) & 0x1F) << 7) as i16;
                self.ir[2] = (((value >> 10) & 0x1F) << 7) as i16;
            }
            29 => debug!("write to ORGB ignored"),
            30 => {
                self.lzcs = value as i32;
                self.lzcr = if self.lzcs > 0 {
                    Self::count_leading_zeros(value, 32)
                } else if self.lzcs < 0 {
                    Self::count_leading_zeros(!value, 32)
                } else {
                    32
                };
            }
            _ => debug!("write to LZCR ignored"),
        }
    }

    /// Read a control register through the CFC2 packing rules
    pub fn read_control(&self, num: u32) -> u32 {
        match num & 0x1F {
            0 => pack16(self.rot[0][0], self.rot[0][1]),
            1 => pack16(self.rot[0][2], self.rot[1][0]),
            2 => pack16(self.rot[1][1], self.rot[1][2]),
            3 => pack16(self.rot[2][0], self.rot[2][1]),
            4 => self.rot[2][2] as i32 as u32,
            5 => self.tr[0] as u32,
            6 => self.tr[1] as u32,
            7 => self.tr[2] as u32,
            8 => pack16(self.light[0][0], self.light[0][1]),
            9 => pack16(self.light[0][2], self.light[1][0]),
            10 => pack16(self.light[1][1], self.light[1][2]),
            11 => pack16(self.light[2][0], self.light[2][1]),
            12 => self.light[2][2] as i32 as u32,
            13 => self.bg[0] as u32,
            14 => self.bg[1] as u32,
            15 => self.bg[2] as u32,
            16 => pack16(self.lcol[0][0], self.lcol[0][1]),
            17 => pack16(self.lcol[0][2], self.lcol[1][0]),
            18 => pack16(self.lcol[1][1], self.lcol[1][2]),
            19 => pack16(self.lcol[2][0], self.lcol[2][1]),
            20 => self.lcol[2][2] as i32 as u32,
            21 => self.fc[0] as u32,
            22 => self.fc[1] as u32,
            23 => self.fc[2] as u32,
            24 => self.ofx as u32,
            25 => self.ofy as u32,
            26 => self.h as u32,
            27 => self.dqa as i32 as u32,
            28 => self.dqb as u32,
            29 => self.zsf3 as i32 as u32,
            30 => self.zsf4 as i32 as u32,
            _ => self.flag,
        }
    }

    /// Write a control register through the CTC2 packing rules
    pub fn write_control(&mut self, num: u32, value: u32) {
        let lo = value as i16;
        let hi = (value >> 16) as i16;
        match num & 0x1F {
            0 => {
                self.rot[0][0] = lo;
                self.rot[0][1] = hi;
            }
            1 => {
                self.rot[0][2] = lo;
                self.rot[1][0] = hi;
            }
            2 => {
                self.rot[1][1] = lo;
                self.rot[1][2] = hi;
            }
            3 => {
                self.rot[2][0] = lo;
                self.rot[2][1] = hi;
            }
            4 => self.rot[2][2] = lo,
            5 => self.tr[0] = value as i32,
            6 => self.tr[1] = value as i32,
            7 => self.tr[2] = value as i32,
            8 => {
                self.light[0][0] = lo;
                self.light[0][1] = hi;
            }
            9 => {
                self.light[0][2] = lo;
                self.light[1][0] = hi;
            }
            10 => {
                self.light[1][1] = lo;
                self.light[1][2] = hi;
            }
            11 => {
                self.light[2][0] = lo;
                self.light[2][1] = hi;
            }
            12 => self.light[2][2] = lo,
            13 => self.bg[0] = value as i32,
            14 => self.bg[1] = value as i32,
            15 => self.bg[2] = value as i32,
            16 => {
                self.lcol[0][0] = lo;
                self.lcol[0][1] = hi;
            }
            17 => {
                self.lcol[0][2] = lo;
                self.lcol[1][0] = hi;
            }
            18 => {
                self.lcol[1][1] = lo;
                self.lcol[1][2] = hi;
            }
            19 => {
                self.lcol[2][0] = lo;
                self.lcol[2][1] = hi;
            }
            20 => self.lcol[2][2] = lo,
            21 => self.fc[0] = value as i32,
            22 => self.fc[1] = value as i32,
            23 => self.fc[2] = value as i32,
            24 => self.ofx = value as i32,
            25 => self.ofy = value as i32,
            26 => self.h = value as u16,
            27 => self.dqa = value as i16,
            28 => self.dqb = value as i32,
            29 => self.zsf3 = value as i16,
            30 => self.zsf4 = value as i16,
            _ => self.flag = value,
        }
    }
}

impl Default for Gte {
    fn default() -> Self {
        Gte::new()
    }
}

#[inline]
fn pack16(lo: i16, hi: i16) -> u32 {
    (lo as u16 as u32) | ((hi as u16 as u32) << 16)
}

#[inline]
fn pack_rgbc(c: [u8; 4]) -> u32 {
    u32::from_le_bytes(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Identity rotation, sf=12 variant
    fn identity_gte() -> Gte {
        let mut gte = Gte::new();
        gte.write_control(0, 0x1000); // R11 = 1.0
        gte.write_control(2, 0x1000); // R22 = 1.0
        gte.write_control(4, 0x1000); // R33 = 1.0
        gte
    }

    #[test]
    fn rtps_identity_projection() {
        let mut gte = identity_gte();
        gte.write_control(26, 200); // H
        gte.write_data(0, 0x0032_0064); // V0 = (100, 50)
        gte.write_data(1, 400); // V0z
        gte.execute(0x0048_0001); // RTPS, sf=12

        assert_eq!(gte.read_data(19), 400); // SZ3
        // quot = 0x8000; SX = 100*0x8000 >> 16 = 50; SY = 25
        assert_eq!(gte.read_data(14), (25 << 16) | 50);
        assert_eq!(gte.flag & (1 << 31), 0);
    }

    #[test]
    fn division_saturates_past_near_plane() {
        let mut gte = Gte::new();
        let q = gte.divide(0xFFFF, 0x0001);
        assert_eq!(q, 0x1FFFF);
        assert!(gte.flag & (1 << 17) != 0);
    }

    #[test]
    fn division_matches_reference_points() {
        let mut gte = Gte::new();
        // H/SZ3 = 200/400 is exactly 0.5 in 1.16
        assert_eq!(gte.divide(200, 400), 0x8000);
        assert_eq!(gte.divide(100, 400), 0x4000);
        assert_eq!(gte.flag, 0);
    }

    #[test]
    fn limiter_flags_and_idempotence() {
        let mut gte = Gte::new();
        let clamped = gte.lim(0x12345, -0x8000, 0x7FFF, 24);
        assert_eq!(clamped, 0x7FFF);
        assert!(gte.flag & (1 << 24) != 0);

        gte.flag = 0;
        let again = gte.lim(clamped, -0x8000, 0x7FFF, 24);
        assert_eq!(again, clamped);
        assert_eq!(gte.flag, 0);

        // In-range values pass through untouched
        gte.flag = 0;
        assert_eq!(gte.lim(-0x8000, -0x8000, 0x7FFF, 24), -0x8000);
        assert_eq!(gte.flag, 0);
    }

    #[test]
    fn error_bit_is_or_of_stage_bits() {
        let mut gte = identity_gte();
        // Large vector saturates the D-limiters through RTPS
        gte.write_control(26, 0x7FFF);
        gte.write_data(0, 0x7FFF_7FFF);
        gte.write_data(1, 1);
        gte.execute(0x0048_0001);
        let stage = gte.flag & FLAG_ERROR_MASK;
        assert_eq!(gte.flag >> 31, (stage != 0) as u32);
    }

    #[test]
    fn nclip_winding() {
        let mut gte = Gte::new();
        gte.write_data(12, 0x0000_0000); // (0, 0)
        gte.write_data(13, 0x0000_0010); // (16, 0)
        gte.write_data(14, 0x0010_0000); // (0, 16)
        gte.execute(0x0000_0006);
        // 0*(0-16) + 16*(16-0) + 0*(0-0) = 256
        assert_eq!(gte.read_data(24), 256);
    }

    #[test]
    fn sxyp_write_pushes_fifo() {
        let mut gte = Gte::new();
        gte.write_data(12, 1);
        gte.write_data(13, 2);
        gte.write_data(14, 3);
        gte.write_data(15, 4);
        assert_eq!(gte.read_data(12), 2);
        assert_eq!(gte.read_data(13), 3);
        assert_eq!(gte.read_data(14), 4);
        assert_eq!(gte.read_data(15), 4);
    }

    #[test]
    fn lzcs_recomputes_lzcr() {
        let mut gte = Gte::new();
        gte.write_data(30, 0x0000_FFFF);
        assert_eq!(gte.read_data(31), 16);
        gte.write_data(30, 0xFFFF_0000);
        assert_eq!(gte.read_data(31), 16); // leading ones
        gte.write_data(30, 0);
        assert_eq!(gte.read_data(31), 32);
    }

    #[test]
    fn reserved_register_reads_zero() {
        let mut gte = Gte::new();
        gte.write_data(23, 0x1234_5678);
        assert_eq!(gte.read_data(23), 0);
        // ORGB and LZCR writes are dropped
        gte.write_data(29, 0xFFFF_FFFF);
        gte.write_data(30, 1);
        gte.write_data(31, 0xFFFF_FFFF);
        assert_eq!(gte.read_data(31), 31);
    }

    #[test]
    fn irgb_expands_into_ir() {
        let mut gte = Gte::new();
        gte.write_data(28, 0x7FFF);
        assert_eq!(gte.read_data(8), (0x1F << 7));
        assert_eq!(gte.read_data(9), (0x1F << 7));
        assert_eq!(gte.read_data(10), (0x1F << 7));
    }

    #[test]
    fn mvmva_garbage_matrix_rows() {
        let mut gte = Gte::new();
        gte.write_control(1, 0x0123); // ROT[0][2] = 0x123
        gte.write_control(2, 0x0000_0456); // ROT[1][1] = 0x456
        gte.write_data(8, 0x77); // IR0
        // mm=3, mv=0, tv=3 (none), sf=0, V0 = (1, 0, 0)
        gte.write_data(0, 1);
        gte.execute((3 << 17) | (3 << 13) | 0x12);
        assert_eq!(gte.mac[1], -0x60);
        assert_eq!(gte.mac[2], 0x123);
        assert_eq!(gte.mac[3], 0x456);
    }

    #[test]
    fn far_color_mvmva_keeps_last_column_only() {
        let mut gte = Gte::new();
        // ROT = all 0x1000; V0 = (1, 1, 1); FC translation selected
        for reg in [0u32, 1, 2, 3] {
            gte.write_control(reg, 0x1000_1000);
        }
        gte.write_control(4, 0x1000);
        gte.write_control(21, 0x100);
        gte.write_data(0, 0x0001_0001);
        gte.write_data(1, 1);
        // mm=0 (ROT), mv=0 (V0), tv=2 (FC), sf=0
        gte.execute((2 << 13) | 0x12);
        // Only the last column product survives: M13 * V2 = 0x1000
        assert_eq!(gte.mac[1], 0x1000);
        assert_eq!(gte.mac[2], 0x1000);
        assert_eq!(gte.mac[3], 0x1000);
    }

    #[test]
    fn avsz3_averages_fifo() {
        let mut gte = Gte::new();
        gte.write_data(17, 100);
        gte.write_data(18, 200);
        gte.write_data(19, 300);
        gte.write_control(29, 0x555); // ZSF3 ~ 1/3 in 4.12
        gte.execute(0x2D);
        // 0x555 * 600 >> 12 = 199
        assert_eq!(gte.read_data(7), 199);
    }
}
