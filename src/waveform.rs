//! Sine lookup tables for the parallel-line DAC.
//!
//! The DAC is driven by 8 GPIO lines that are not wired in bit order, so every 8-bit DAC code
//! is scattered into a GPIO bit pattern ahead of time. The tick handler then only needs a
//! single masked write per tick.

/// Number of ticks in one period of the excitation waveform
pub const TICKS_PER_PERIOD: usize = 16;

/// First half of the sine period, as unsigned 8-bit DAC codes centred on 128.
const HALF_SINE: [u8; TICKS_PER_PERIOD / 2] = [128, 177, 217, 244, 255, 244, 217, 177];

/// One full sine period. The second half mirrors [`HALF_SINE`] around the 128 midpoint.
pub const SINE_16: [u8; TICKS_PER_PERIOD] = mirror_half_sine(HALF_SINE);

/// GPIO line driven by each DAC bit, least significant bit first.
///
/// This encodes the physical wiring of the DAC resistor ladder, so it must not be reordered.
pub const DAC_LINES: [u8; 8] = [29, 6, 7, 0, 1, 2, 4, 3];

/// All GPIO lines owned by the DAC
pub const DAC_MASK: u32 = line_mask(DAC_LINES);

/// Expand a half period into a full period: `code[i + 8] = 256 - code[i]`
const fn mirror_half_sine(half: [u8; TICKS_PER_PERIOD / 2]) -> [u8; TICKS_PER_PERIOD] {
    let mut full = [0u8; TICKS_PER_PERIOD];
    let mut i = 0;
    while i < half.len() {
        full[i] = half[i];
        full[i + half.len()] = (256 - half[i] as u16) as u8;
        i += 1;
    }
    full
}

/// Combined mask of a set of GPIO lines
const fn line_mask(lines: [u8; 8]) -> u32 {
    let mut mask = 0;
    let mut bit = 0;
    while bit < lines.len() {
        mask |= 1 << lines[bit];
        bit += 1;
    }
    mask
}

/// Scattered GPIO pattern for every possible 8-bit DAC code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformTable {
    /// GPIO bit patterns indexed by DAC code
    codes: [u32; 256],
    /// Line assignment used to build `codes`
    lines: [u8; 8],
    /// Mask of all lines in `lines`
    mask: u32,
}

impl WaveformTable {
    /// Build the table for the board's [`DAC_LINES`] wiring.
    pub const fn new() -> Self {
        Self::with_lines(DAC_LINES)
    }

    /// Build the table for an arbitrary wiring, `lines[b]` being the GPIO driven by DAC bit `b`.
    ///
    /// Lines must be distinct and below 32.
    pub const fn with_lines(lines: [u8; 8]) -> Self {
        let mut codes = [0u32; 256];
        let mut code = 0;
        while code < codes.len() {
            let mut pattern = 0u32;
            let mut bit = 0;
            while bit < lines.len() {
                pattern |= (((code >> bit) & 1) as u32) << lines[bit];
                bit += 1;
            }
            codes[code] = pattern;
            code += 1;
        }
        Self {
            codes,
            lines,
            mask: line_mask(lines),
        }
    }

    /// GPIO pattern for a DAC code
    #[inline(always)]
    pub fn pattern(&self, code: u8) -> u32 {
        self.codes[code as usize]
    }

    /// GPIO pattern to output on excitation tick `tick`.
    ///
    /// The tick indexes the 16-point sine period, and the resulting code indexes the scatter
    /// table.
    #[inline(always)]
    pub fn pattern_for_tick(&self, tick: u32) -> u32 {
        self.pattern(SINE_16[tick as usize % TICKS_PER_PERIOD])
    }

    /// Mask of all GPIO lines this table writes
    #[inline(always)]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Recover the DAC code from a GPIO pattern. Lines outside the DAC are ignored.
    pub fn decode(&self, pattern: u32) -> u8 {
        self.lines
            .iter()
            .enumerate()
            .fold(0u8, |code, (bit, line)| {
                code | ((((pattern >> line) & 1) as u8) << bit)
            })
    }
}

impl Default for WaveformTable {
    fn default() -> Self {
        Self::new()
    }
}
