//! Image frames and sensor geometry.

use serde::{Deserialize, Serialize};

/// A single 16-bit image frame.
///
/// Pixels are stored row-major, `width * height` samples. A frame handed to
/// [`crate::pipeline::Pipeline::on_frame`] is borrowed for the duration of the call
/// only; stages that need to keep it must copy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    pixels: Vec<u16>,
}

impl Frame {
    /// Create a frame from row-major 16-bit pixel data.
    ///
    /// The pixel buffer is truncated or zero-padded to `width * height`.
    pub fn from_u16(width: u32, height: u32, mut pixels: Vec<u16>) -> Self {
        pixels.resize(width as usize * height as usize, 0);
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Create a black frame.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self::from_u16(width, height, Vec::new())
    }

    /// Create a frame only if `pixels` holds exactly `width * height` samples.
    pub fn try_from_pixels(width: u32, height: u32, pixels: Vec<u16>) -> Option<Self> {
        (pixels.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Pixel value at (x, y), `None` outside the frame.
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(self.index(x, y)).copied()
    }

    /// Mutable pixel access, used by simulators and tests to paint frames.
    pub fn set(&mut self, x: u32, y: u32, value: u16) {
        if x < self.width && y < self.height {
            let idx = self.index(x, y);
            self.pixels[idx] = value;
        }
    }

    /// One image row.
    pub fn row(&self, y: u32) -> &[u16] {
        let start = self.index(0, y);
        &self.pixels[start..start + self.width as usize]
    }

    /// All pixels, row-major.
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// `(width, height)`
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.pixels.iter().map(|&v| v as u64).sum();
        sum as f64 / self.pixels.len() as f64
    }
}

/// Region of interest as half-open pixel ranges `[start, end)` on the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Horizontal range
    pub x: (u32, u32),
    /// Vertical range
    pub y: (u32, u32),
}

impl Roi {
    /// Create a region of interest from horizontal and vertical ranges.
    pub fn new(x: (u32, u32), y: (u32, u32)) -> Self {
        Self { x, y }
    }

    /// The full sensor.
    pub fn full(sensor_width: u32, sensor_height: u32) -> Self {
        Self {
            x: (0, sensor_width),
            y: (0, sensor_height),
        }
    }

    /// Width in pixels (0 for inverted ranges).
    pub fn width(&self) -> u32 {
        self.x.1.saturating_sub(self.x.0)
    }

    /// Height in pixels (0 for inverted ranges).
    pub fn height(&self) -> u32 {
        self.y.1.saturating_sub(self.y.0)
    }

    /// Whether the region is non-empty and lies within the sensor.
    pub fn fits(&self, sensor_width: u32, sensor_height: u32) -> bool {
        self.x.0 < self.x.1
            && self.x.1 <= sensor_width
            && self.y.0 < self.y.1
            && self.y.1 <= sensor_height
    }
}
