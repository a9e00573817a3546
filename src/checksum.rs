//! Adler-32 checksums.
//!
//! `adler32` gates MODIFY records: the checksum of the base bytes is stored
//! in the bundle and compared against the current content at apply time.
//! `RollingAdler` is the sliding-window form used by the block matcher.

const MOD_ADLER: u32 = 65521;

/// Largest n such that 255n(n+1)/2 + (n+1)(MOD_ADLER-1) fits in a u32.
const NMAX: usize = 5552;

/// Adler-32 of `data`, reduced every `NMAX` bytes so any input length is safe.
pub fn adler32(data: &[u8]) -> u32 {
    let (a, b) = sums(data);
    (b << 16) | a
}

fn sums(data: &[u8]) -> (u32, u32) {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }

    (a, b)
}

/// Adler-32 over a fixed-size window with O(1) slides.
pub struct RollingAdler {
    a: u32,
    b: u32,
    window_size: u32,
}

impl RollingAdler {
    /// Start a window covering `window`.
    pub fn new(window: &[u8]) -> Self {
        let (a, b) = sums(window);
        Self {
            a,
            b,
            window_size: window.len() as u32,
        }
    }

    /// Slide the window: drop `old_byte` from the front, append `new_byte`.
    pub fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32;
        let new = new_byte as u32;
        let window = self.window_size % MOD_ADLER;

        self.a = (self.a + MOD_ADLER - old + new) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a + MOD_ADLER - (old * window) % MOD_ADLER)
            % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
