use super::xmap::{self, BufferHeader, HEADER_WORDS};
use crate::error::{PslError, Result};
use crate::sinc::HistogramData;
use crate::stats::Stats;
use log::{debug, warn};
use time::OffsetDateTime;

/// Largest number of pixels one mapping buffer holds.
pub const MAX_PIXELS_PER_BUFFER: u32 = 1024;

/// What moves the run on to the next pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelAdvance {
    User,
    Sync,
    Gate,
}

impl PixelAdvance {
    pub fn from_value(value: f64) -> Option<Self> {
        match value as i64 {
            0 => Some(Self::User),
            1 => Some(Self::Sync),
            2 => Some(Self::Gate),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Buffer {
    words: Vec<u32>,
    level: usize,
    pixels: u32,
}

impl Buffer {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len],
            level: 0,
            pixels: 0,
        }
    }

    fn clear(&mut self) {
        self.words.fill(0);
        self.level = 0;
        self.pixels = 0;
    }
}

/// A/B double buffer.
///
/// The consumer reads the active buffer; the producer fills the other one.
/// They swap when the active buffer has been drained and the next buffer holds
/// at least one pixel.
#[derive(Debug)]
pub struct MappingBuffers {
    buffers: [Buffer; 2],
    active: usize,
    pixels_per_buffer: u32,
    num_bins: usize,
    header: BufferHeader,
    total_pixels: u32,
    overruns: u32,
    sequence: u32,
}

fn buffer_id(index: usize) -> char {
    if index == 0 {
        'a'
    } else {
        'b'
    }
}

fn buffer_index(id: char) -> Result<usize> {
    match id.to_ascii_lowercase() {
        'a' => Ok(0),
        'b' => Ok(1),
        other => Err(PslError::BadArgument(format!("no mapping buffer '{other}'"))),
    }
}

impl MappingBuffers {
    pub fn new(pixels_per_buffer: u32, num_bins: usize, header: BufferHeader) -> Self {
        let len = HEADER_WORDS + pixels_per_buffer as usize * (HEADER_WORDS + num_bins);
        Self {
            buffers: [Buffer::new(len), Buffer::new(len)],
            active: 0,
            pixels_per_buffer,
            num_bins,
            header,
            total_pixels: 0,
            overruns: 0,
            sequence: 0,
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffers[0].words.len()
    }

    fn next(&self) -> usize {
        1 - self.active
    }

    pub fn next_is_full(&self) -> bool {
        self.buffers[self.next()].pixels >= self.pixels_per_buffer
    }

    /// Whether buffer `id` is active and holds pixels for the consumer.
    pub fn is_full(&self, id: char) -> Result<bool> {
        let index = buffer_index(id)?;
        Ok(index == self.active && self.buffers[index].level > 0)
    }

    pub fn read(&self, id: char) -> Result<Vec<u32>> {
        if !self.is_full(id)? {
            return Err(PslError::BufferNotActive(id));
        }
        Ok(self.buffers[self.active].words.clone())
    }

    /// The consumer has drained the active buffer.
    pub fn done(&mut self, id: Option<char>) -> Result<()> {
        if let Some(id) = id {
            if buffer_index(id)? != self.active {
                return Err(PslError::BufferNotActive(id));
            }
        }
        self.buffers[self.active].clear();
        self.swap_if_ready();
        Ok(())
    }

    pub fn current_pixel(&self) -> u32 {
        self.total_pixels
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    fn record_overrun(&mut self) {
        self.overruns += 1;
        let next = self.next();
        let buffer = &mut self.buffers[next];
        if buffer.level > 0 {
            buffer.words[xmap::buffer::ERRORS] = self.overruns.min(0xFFFF);
        }
    }

    fn swap_if_ready(&mut self) {
        let next = self.next();
        if self.buffers[self.active].level == 0 && self.buffers[next].level > 0 {
            debug!(
                "mapping buffer '{}' ready with {} pixels",
                buffer_id(next),
                self.buffers[next].pixels
            );
            self.active = next;
        }
    }

    fn write_pixel(&mut self, spectrum: &[u32], stats: &Stats) {
        let next = self.next();
        let pixel_words = HEADER_WORDS + self.num_bins;
        if self.buffers[next].level == 0 {
            let header = BufferHeader {
                sequence: self.sequence,
                buffer_id: next as u16,
                start_pixel: self.total_pixels,
                ..self.header
            };
            self.sequence = self.sequence.wrapping_add(1);
            let buffer = &mut self.buffers[next];
            header.write(&mut buffer.words);
            buffer.level = HEADER_WORDS;
        }

        let pixel = self.total_pixels;
        let buffer = &mut self.buffers[next];
        let at = buffer.level;
        xmap::write_pixel_header(&mut buffer.words[at..], pixel, self.num_bins, stats);
        buffer.words[at + HEADER_WORDS..at + pixel_words].copy_from_slice(spectrum);
        buffer.level += pixel_words;
        buffer.pixels += 1;
        self.total_pixels += 1;

        let timestamp = OffsetDateTime::now_utc().unix_timestamp() as u32;
        xmap::update_buffer_header(&mut buffer.words, buffer.pixels, self.overruns, timestamp);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Mm1Settings {
    pub pixel_advance: PixelAdvance,
    pub run_number: u16,
    pub num_map_pixels: u32,
    pub num_mca_channels: usize,
    pub pixels_per_buffer: u32,
    pub serial_number: u16,
    pub det_chan: u16,
    pub det_element: u16,
}

#[derive(Debug)]
pub struct Mm1 {
    pub pixel_advance: PixelAdvance,
    /// Pixels the user has advanced that are still unwritten; -1 means unbounded.
    pub pixel_advance_counter: i64,
    pub run_number: u16,
    pub num_map_pixels: u32,
    pub num_mca_channels: usize,
    pub pixels_per_buffer: u32,
    pub buffers: MappingBuffers,
}

impl Mm1 {
    pub fn open(settings: Mm1Settings) -> Self {
        let header = BufferHeader {
            run_number: settings.run_number,
            serial_number: settings.serial_number,
            det_chan: settings.det_chan,
            det_element: settings.det_element,
            channel_size: settings.num_mca_channels as u16,
            ..Default::default()
        };
        let counter = match settings.pixel_advance {
            PixelAdvance::User => 0,
            PixelAdvance::Sync | PixelAdvance::Gate => -1,
        };
        Self {
            pixel_advance: settings.pixel_advance,
            pixel_advance_counter: counter,
            run_number: settings.run_number,
            num_map_pixels: settings.num_map_pixels,
            num_mca_channels: settings.num_mca_channels,
            pixels_per_buffer: settings.pixels_per_buffer,
            buffers: MappingBuffers::new(
                settings.pixels_per_buffer,
                settings.num_mca_channels,
                header,
            ),
        }
    }

    pub fn all_pixels_received(&self) -> bool {
        self.num_map_pixels > 0 && self.buffers.current_pixel() >= self.num_map_pixels
    }

    pub fn pixel_next(&mut self) {
        if self.pixel_advance == PixelAdvance::User {
            self.pixel_advance_counter += 1;
        }
    }

    /// Write one received histogram as a pixel.
    pub fn update(&mut self, data: &HistogramData, stats: &Stats) -> Result<()> {
        if data.accepted.len() != self.num_mca_channels {
            return Err(PslError::Protocol(format!(
                "mapping histogram has {} bins, expected {}",
                data.accepted.len(),
                self.num_mca_channels
            )));
        }
        if self.all_pixels_received() {
            return Ok(());
        }
        if self.pixel_advance == PixelAdvance::User && self.pixel_advance_counter == 0 {
            debug!("histogram dropped while waiting for a user pixel advance");
            return Ok(());
        }
        if self.buffers.next_is_full() {
            self.buffers.record_overrun();
            warn!(
                "mapping buffer overrun at pixel {}",
                self.buffers.current_pixel()
            );
            return Ok(());
        }
        if self.pixel_advance_counter > 0 {
            self.pixel_advance_counter -= 1;
        }
        self.buffers.write_pixel(&data.accepted, stats);
        self.buffers.swap_if_ready();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::xmap::get_pair;
    use crate::sinc::HistogramStats;

    const BINS: usize = 8;

    fn open(advance: PixelAdvance, pixels: u32, per_buffer: u32) -> Mm1 {
        Mm1::open(Mm1Settings {
            pixel_advance: advance,
            run_number: 7,
            num_map_pixels: pixels,
            num_mca_channels: BINS,
            pixels_per_buffer: per_buffer,
            serial_number: 1,
            det_chan: 0,
            det_element: 0,
        })
    }

    fn histogram(value: u32) -> (HistogramData, Stats) {
        let raw = HistogramStats {
            time_elapsed: 0.01,
            pulses_accepted: 100,
            input_count_rate: 10_000.0,
            ..Default::default()
        };
        (
            HistogramData {
                accepted: vec![value; BINS],
                rejected: vec![],
                stats: raw.clone(),
            },
            Stats::from_histogram(&raw),
        )
    }

    fn feed(mm1: &mut Mm1, count: u32) {
        for i in 0..count {
            let (data, stats) = histogram(i);
            mm1.update(&data, &stats).unwrap();
        }
    }

    #[test]
    fn user_advance_writes_min_of_advances_and_frames() {
        let mut mm1 = open(PixelAdvance::User, 0, 16);
        for _ in 0..3 {
            mm1.pixel_next();
        }
        feed(&mut mm1, 5);
        assert_eq!(mm1.buffers.current_pixel(), 3);
        assert_eq!(mm1.pixel_advance_counter, 0);

        let mut mm1 = open(PixelAdvance::User, 0, 16);
        for _ in 0..6 {
            mm1.pixel_next();
        }
        feed(&mut mm1, 4);
        assert_eq!(mm1.buffers.current_pixel(), 4);
        assert_eq!(mm1.pixel_advance_counter, 2);
    }

    #[test]
    fn gate_and_sync_write_every_frame() {
        for advance in [PixelAdvance::Gate, PixelAdvance::Sync] {
            let mut mm1 = open(advance, 0, 16);
            feed(&mut mm1, 10);
            assert_eq!(mm1.buffers.current_pixel(), 10);
            assert_eq!(mm1.pixel_advance_counter, -1);
        }
    }

    #[test]
    fn stops_writing_at_num_map_pixels() {
        let mut mm1 = open(PixelAdvance::Gate, 5, 16);
        feed(&mut mm1, 9);
        assert_eq!(mm1.buffers.current_pixel(), 5);
        assert!(mm1.all_pixels_received());
    }

    #[test]
    fn first_pixel_swaps_into_active() {
        let mut mm1 = open(PixelAdvance::Gate, 0, 4);
        assert!(!mm1.buffers.is_full('a').unwrap());
        feed(&mut mm1, 1);
        // A was empty, so B (where the pixel went) became active.
        assert!(mm1.buffers.is_full('b').unwrap());
        assert!(!mm1.buffers.is_full('a').unwrap());
        assert!(matches!(
            mm1.buffers.read('a'),
            Err(PslError::BufferNotActive('a'))
        ));
        let words = mm1.buffers.read('b').unwrap();
        assert_eq!(words.len(), HEADER_WORDS + 4 * (HEADER_WORDS + BINS));
        assert_eq!(&words[..4], &[0x55AA, 0xAA55, 256, 1]);
        assert_eq!(words[xmap::buffer::RUN_NUMBER], 7);
        assert_eq!(words[xmap::buffer::BUFFER_ID], 1);
        assert_eq!(words[xmap::buffer::PIXELS], 1);
        assert_eq!(&words[HEADER_WORDS..HEADER_WORDS + 2], &[0x33CC, 0xCC33]);
    }

    #[test]
    fn overrun_when_next_is_full() {
        let mut mm1 = open(PixelAdvance::Gate, 0, 2);
        // Pixel 0 goes to B and swaps; pixels 1 and 2 fill A; pixel 3 overruns.
        feed(&mut mm1, 4);
        assert_eq!(mm1.buffers.current_pixel(), 3);
        assert_eq!(mm1.buffers.overruns(), 1);

        mm1.buffers.done(Some('b')).unwrap();
        assert!(mm1.buffers.is_full('a').unwrap());
        let words = mm1.buffers.read('a').unwrap();
        assert_eq!(words[xmap::buffer::PIXELS], 2);
        assert_eq!(get_pair(&words, xmap::buffer::START_PIXEL), 1);
        assert_eq!(words[xmap::buffer::ERRORS], 1);
        let second = HEADER_WORDS + (HEADER_WORDS + BINS);
        assert_eq!(get_pair(&words, second + xmap::pixel::NUMBER), 2);
        assert_eq!(words[second + HEADER_WORDS], 2);
    }

    #[test]
    fn done_on_wrong_buffer_is_rejected() {
        let mut mm1 = open(PixelAdvance::Gate, 0, 2);
        feed(&mut mm1, 1);
        assert!(matches!(
            mm1.buffers.done(Some('a')),
            Err(PslError::BufferNotActive('a'))
        ));
        assert!(mm1.buffers.done(Some('x')).is_err());
    }

    #[test]
    fn wrong_length_is_an_error() {
        let mut mm1 = open(PixelAdvance::Gate, 0, 2);
        let (mut data, stats) = histogram(1);
        data.accepted.pop();
        assert!(mm1.update(&data, &stats).is_err());
        assert_eq!(mm1.buffers.current_pixel(), 0);
    }
}
