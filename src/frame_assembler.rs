use crate::slip;

/// Reassembles complete SLIP frames from the arbitrary byte chunks the uart
///  delivers. A frame starts and ends with `0xC0`; anything seen before a
///  start boundary is line noise and silently discarded, and a partial frame
///  at the end of a chunk is carried over to the next one.
///
/// Two boundary bytes in a row are treated as the end of one frame touching
///  the start of the next, so back-to-back frames survive without losing
///  sync. This relies on the escape codec guaranteeing that `0xC0` never
///  appears inside a frame.
pub struct FrameAssembler {
    buffer: Vec<u8>,
    boundary_found: bool,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler {
            buffer: Vec::new(),
            boundary_found: false,
        }
    }

    /// Feeds a chunk of bytes, returning every frame completed by it, in
    ///  arrival order and including both delimiters.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut complete = Vec::new();

        for &b in chunk {
            self.buffer.push(b);

            if b != slip::END {
                continue;
            }

            if !self.boundary_found {
                // start of frame - bytes before it are irrelevant
                self.buffer.clear();
                self.buffer.push(slip::END);
                self.boundary_found = true;
            } else if self.buffer.len() == 2 {
                // two boundary bytes in a row: the second starts a new frame
                self.buffer.clear();
                self.buffer.push(slip::END);
            } else {
                complete.push(std::mem::take(&mut self.buffer));
                self.boundary_found = false;
            }
        }

        complete
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        FrameAssembler::new()
    }
}
