/// Bytes per pixel of every frame moving through the pipeline (BGR24).
pub const CHANNELS: usize = 3;

/// A decoded image in packed BGR24 layout, row-major with no padding.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Frame {
        debug_assert_eq!(data.len(), width as usize * height as usize * CHANNELS);
        Frame {
            width,
            height,
            data,
        }
    }

    /// Solid black frame, used to fill seconds without input.
    pub fn blank(width: u32, height: u32) -> Frame {
        Frame::filled(width, height, [0, 0, 0])
    }

    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Frame {
            width,
            height,
            data,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        self.data[idx..idx + CHANNELS].copy_from_slice(&bgr);
    }
}

/// A frame tagged with the wall-clock second it was captured in.
#[derive(Clone, Debug)]
pub struct TimedFrame {
    pub frame: Frame,
    pub time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_frame_is_black_and_sized() {
        let frame = Frame::blank(4, 2);
        assert_eq!(frame.data.len(), 4 * 2 * CHANNELS);
        assert!(frame.data.iter().all(|b| *b == 0));
        assert_eq!(frame.size(), (4, 2));
    }

    #[test]
    fn put_pixel_ignores_out_of_bounds() {
        let mut frame = Frame::blank(2, 2);
        frame.put_pixel(1, 1, [1, 2, 3]);
        frame.put_pixel(5, 5, [9, 9, 9]);
        assert_eq!(frame.pixel(1, 1), Some([1, 2, 3]));
        assert_eq!(frame.pixel(5, 5), None);
    }
}
