//! XMAP-compatible mapping buffer layout.
//!
//! Every word is stored in a `u32` slot. Header words only ever hold 16-bit
//! values; spectrum bins use the full 32 bits.
//!
//! Buffer header (256 words):
//!
//! | word | content |
//! |---|---|
//! | 0, 1 | tag 0x55AA, 0xAA55 |
//! | 2 | header size (256) |
//! | 3 | mapping mode |
//! | 4 | run number |
//! | 5, 6 | buffer sequence number LSW, MSW |
//! | 7 | buffer id (0 = A, 1 = B) |
//! | 8 | pixels in buffer |
//! | 9, 10 | starting pixel LSW, MSW |
//! | 11 | module serial number |
//! | 12..19 | detector channel / element pairs for four channels |
//! | 20..23 | spectrum sizes for four channels |
//! | 24 | buffer errors (overruns) |
//! | 25, 26 | unix timestamp of the last update LSW, MSW |
//!
//! Pixel header (256 words):
//!
//! | word | content |
//! |---|---|
//! | 0, 1 | tag 0x33CC, 0xCC33 |
//! | 2 | header size (256) |
//! | 3 | mapping mode |
//! | 4, 5 | pixel number LSW, MSW |
//! | 6, 7 | total pixel block size LSW, MSW |
//! | 8..11 | spectrum sizes for four channels |
//! | 32..63 | per channel: realtime, livetime, triggers, output events (LSW, MSW each) |

use crate::stats::Stats;

pub const HEADER_WORDS: usize = 256;
pub const BUFFER_TAG: [u32; 2] = [0x55AA, 0xAA55];
pub const PIXEL_TAG: [u32; 2] = [0x33CC, 0xCC33];
pub const MAPPING_MODE_MCA: u32 = 1;
pub const MAX_CHANNELS: usize = 4;

const UNUSED_CHANNEL: u32 = 0xFFFF;

pub mod buffer {
    pub const RUN_NUMBER: usize = 4;
    pub const SEQUENCE: usize = 5;
    pub const BUFFER_ID: usize = 7;
    pub const PIXELS: usize = 8;
    pub const START_PIXEL: usize = 9;
    pub const SERIAL: usize = 11;
    pub const DET_CHANNELS: usize = 12;
    pub const CHANNEL_SIZES: usize = 20;
    pub const ERRORS: usize = 24;
    pub const TIMESTAMP: usize = 25;
}

pub mod pixel {
    pub const NUMBER: usize = 4;
    pub const BLOCK_SIZE: usize = 6;
    pub const CHANNEL_SIZES: usize = 8;
    pub const STATS: usize = 32;
    pub const STATS_PER_CHANNEL: usize = 8;
}

/// Write a 32-bit value as a LSW/MSW pair of 16-bit words.
pub fn put_pair(words: &mut [u32], at: usize, value: u32) {
    words[at] = value & 0xFFFF;
    words[at + 1] = value >> 16;
}

pub fn get_pair(words: &[u32], at: usize) -> u32 {
    (words[at] & 0xFFFF) | (words[at + 1] << 16)
}

/// Fixed fields of a buffer header.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferHeader {
    pub run_number: u16,
    pub sequence: u32,
    pub buffer_id: u16,
    pub start_pixel: u32,
    pub serial_number: u16,
    pub det_chan: u16,
    pub det_element: u16,
    pub channel_size: u16,
}

impl BufferHeader {
    pub fn write(&self, words: &mut [u32]) {
        words[..HEADER_WORDS].fill(0);
        words[0] = BUFFER_TAG[0];
        words[1] = BUFFER_TAG[1];
        words[2] = HEADER_WORDS as u32;
        words[3] = MAPPING_MODE_MCA;
        words[buffer::RUN_NUMBER] = self.run_number as u32;
        put_pair(words, buffer::SEQUENCE, self.sequence);
        words[buffer::BUFFER_ID] = self.buffer_id as u32;
        put_pair(words, buffer::START_PIXEL, self.start_pixel);
        words[buffer::SERIAL] = self.serial_number as u32;
        for slot in 0..MAX_CHANNELS {
            let at = buffer::DET_CHANNELS + 2 * slot;
            if slot == 0 {
                words[at] = self.det_chan as u32;
                words[at + 1] = self.det_element as u32;
            } else {
                words[at] = UNUSED_CHANNEL;
                words[at + 1] = UNUSED_CHANNEL;
            }
        }
        words[buffer::CHANNEL_SIZES] = self.channel_size as u32;
    }
}

/// Rewrite the fields of a buffer header that change with every pixel.
pub fn update_buffer_header(words: &mut [u32], pixels: u32, errors: u32, timestamp: u32) {
    words[buffer::PIXELS] = pixels & 0xFFFF;
    words[buffer::ERRORS] = errors.min(0xFFFF);
    put_pair(words, buffer::TIMESTAMP, timestamp);
}

/// Write one pixel header for a single-channel pixel.
pub fn write_pixel_header(words: &mut [u32], pixel: u32, num_bins: usize, stats: &Stats) {
    words[..HEADER_WORDS].fill(0);
    words[0] = PIXEL_TAG[0];
    words[1] = PIXEL_TAG[1];
    words[2] = HEADER_WORDS as u32;
    words[3] = MAPPING_MODE_MCA;
    put_pair(words, pixel::NUMBER, pixel);
    put_pair(words, pixel::BLOCK_SIZE, (HEADER_WORDS + num_bins) as u32);
    words[pixel::CHANNEL_SIZES] = num_bins as u32 & 0xFFFF;
    put_stats(words, pixel::STATS, stats);
}

/// Write realtime, livetime, triggers and output events as four LSW/MSW pairs.
pub fn put_stats(words: &mut [u32], at: usize, stats: &Stats) {
    put_pair(words, at, stats.realtime_ticks());
    put_pair(words, at + 2, stats.livetime_ticks());
    put_pair(words, at + 4, saturate(stats.triggers));
    put_pair(words, at + 6, saturate(stats.mca_events));
}

fn saturate(value: f64) -> u32 {
    value.round().clamp(0.0, u32::MAX as f64) as u32
}
