//! Per-stream bookkeeping and the multi-subchannel capture fan-out.
//!
//! The hardware has one DMA engine per direction. Playback is always a
//! single stream; capture may be multiplexed onto up to
//! [`crate::MAX_CAP_SUBCHN_COUNT`] independently paced subchannels, each with
//! its own ring buffer and fragment size, fed by the fan-out copier from the
//! shared hardware ping-pong buffer.

use crate::{osal::MemoryBuffer, Direction, EventSink};

/// Playback stream context.
#[derive(Debug, Default)]
pub struct PlaybackStream {
    /// Client ring buffer registered with the DMA engine.
    pub buf: Option<MemoryBuffer>,
    pub frag_size: usize,
    pub acquired: bool,
    pub go: bool,
    /// Index of the next fragment the PCM log tap will mirror.
    pub completed_frag: usize,
}

impl PlaybackStream {
    /// Byte offset of the next completed fragment, for the PCM log tap.
    /// Wraps with the ring.
    pub fn next_log_offset(&mut self) -> usize {
        let size = self.buf.map(|b| b.size).unwrap_or(0);
        if size == 0 || self.frag_size == 0 {
            return 0;
        }
        if self.completed_frag * self.frag_size >= size {
            self.completed_frag = 0;
        }
        let offset = self.completed_frag * self.frag_size;
        self.completed_frag += 1;
        offset
    }
}

/// One capture subchannel context.
#[derive(Debug, Default)]
pub struct CaptureStream {
    /// Client ring buffer. In multi-subchannel mode this is private to the
    /// subchannel and filled by [`Self::deliver_chunk`]; in single-subchannel
    /// mode it is the DMA target itself.
    pub buf: Option<MemoryBuffer>,
    pub frag_size: usize,
    /// Write position inside the ring, always in `[0, buf.size)`.
    pub offset: usize,
    pub acquired: bool,
    pub go: bool,
    pub completed_frag: usize,
}

impl CaptureStream {
    pub fn next_log_offset(&mut self) -> usize {
        let size = self.buf.map(|b| b.size).unwrap_or(0);
        if size == 0 || self.frag_size == 0 {
            return 0;
        }
        if self.completed_frag * self.frag_size >= size {
            self.completed_frag = 0;
        }
        let offset = self.completed_frag * self.frag_size;
        self.completed_frag += 1;
        offset
    }

    /// Copy one filled half of the shared DMA buffer into this subchannel's
    /// ring, notifying `sink` once per fragment boundary crossed.
    ///
    /// Subchannels whose fragment size exceeds the delivered chunk are
    /// skipped; a later chunk stream with matching geometry will serve them.
    /// Copies are capped at fragment boundaries so the notification count is
    /// exact even when the chunk is not a multiple of the fragment size or
    /// the ring offset is mid-fragment.
    pub fn deliver_chunk(&mut self, src: &[u8], sink: &dyn EventSink, subchn: usize) {
        if !self.acquired || !self.go || src.is_empty() {
            return;
        }
        let buf = match self.buf {
            Some(b) => b,
            None => return,
        };
        if self.frag_size == 0 || self.frag_size > src.len() {
            return;
        }

        // Single writer: DMA never touches the subchannel rings, only the
        // shared buffer `src` points into.
        let dst = unsafe { buf.as_mut_slice() };
        let mut transferred = 0;
        while transferred < src.len() {
            let to_boundary = self.frag_size - (self.offset % self.frag_size);
            let to_end = buf.size - self.offset;
            let step = to_boundary
                .min(to_end)
                .min(src.len() - transferred);

            dst[self.offset..self.offset + step]
                .copy_from_slice(&src[transferred..transferred + step]);
            self.offset = (self.offset + step) % buf.size;
            transferred += step;

            if self.offset % self.frag_size == 0 {
                sink.fragment_done(Direction::Capture, subchn, self.frag_size);
            }
        }
    }
}

/// Number of capture subchannels currently held by a client.
pub fn num_open_capture(streams: &[CaptureStream]) -> usize {
    streams.iter().filter(|s| s.acquired).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventSink;
    use core::ptr::NonNull;

    extern crate std;
    use std::{boxed::Box, vec, vec::Vec};

    struct RecordingSink {
        events: spin::Mutex<Vec<(Direction, usize, usize)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                events: spin::Mutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.events.lock().len()
        }
    }

    impl EventSink for RecordingSink {
        fn fragment_done(&self, direction: Direction, subchn: usize, bytes: usize) {
            self.events.lock().push((direction, subchn, bytes));
        }
    }

    fn ring(size: usize) -> (CaptureStream, &'static mut [u8]) {
        let backing = Box::leak(vec![0u8; size].into_boxed_slice());
        let buf = MemoryBuffer {
            virt_addr: NonNull::new(backing.as_mut_ptr()).unwrap(),
            phys_addr: 0x9000_0000,
            size,
        };
        let strm = CaptureStream {
            buf: Some(buf),
            acquired: true,
            go: true,
            ..Default::default()
        };
        let view = unsafe { core::slice::from_raw_parts_mut(buf.virt_addr.as_ptr(), size) };
        (strm, view)
    }

    #[test]
    fn chunk_twice_the_fragment_completes_twice() {
        let (mut strm, _) = ring(4096);
        strm.frag_size = 512;
        let sink = RecordingSink::new();
        let chunk = vec![0xAAu8; 1024];

        strm.deliver_chunk(&chunk, &sink, 0);

        assert_eq!(sink.count(), 2);
        assert_eq!(strm.offset, 1024);
        for (dir, subchn, bytes) in sink.events.lock().iter() {
            assert_eq!(*dir, Direction::Capture);
            assert_eq!(*subchn, 0);
            assert_eq!(*bytes, 512);
        }
    }

    #[test]
    fn offset_wraps_modulo_ring_size() {
        let (mut strm, _) = ring(2048);
        strm.frag_size = 512;
        strm.offset = 1536;
        let sink = RecordingSink::new();
        let chunk = vec![0x55u8; 1024];

        strm.deliver_chunk(&chunk, &sink, 1);

        assert_eq!(strm.offset, 512);
        assert_eq!(sink.count(), 2);
    }

    #[test]
    fn non_divisor_fragment_still_completes_per_boundary() {
        let (mut strm, _) = ring(3600);
        // 1024-byte chunks against a 600-byte fragment: boundaries at
        // 600, 1200, 1800, ... so the first chunk crosses one, the second
        // crosses two.
        strm.frag_size = 600;
        let sink = RecordingSink::new();
        let chunk = vec![1u8; 1024];

        strm.deliver_chunk(&chunk, &sink, 0);
        assert_eq!(sink.count(), 1);
        assert_eq!(strm.offset, 1024);

        strm.deliver_chunk(&chunk, &sink, 0);
        assert_eq!(sink.count(), 3);
        assert_eq!(strm.offset, 2048);
    }

    #[test]
    fn oversized_fragment_skips_chunk() {
        let (mut strm, view) = ring(4096);
        strm.frag_size = 2048;
        let sink = RecordingSink::new();
        let chunk = vec![0xFFu8; 1024];

        strm.deliver_chunk(&chunk, &sink, 0);

        assert_eq!(sink.count(), 0);
        assert_eq!(strm.offset, 0);
        assert!(view.iter().all(|&b| b == 0));
    }

    #[test]
    fn stopped_subchannel_receives_nothing() {
        let (mut strm, view) = ring(4096);
        strm.frag_size = 512;
        strm.go = false;
        let sink = RecordingSink::new();

        strm.deliver_chunk(&[2u8; 1024], &sink, 0);

        assert_eq!(sink.count(), 0);
        assert!(view.iter().all(|&b| b == 0));
    }

    #[test]
    fn copied_bytes_land_at_ring_offset() {
        let (mut strm, view) = ring(2048);
        strm.frag_size = 512;
        strm.offset = 256;
        let sink = RecordingSink::new();
        let chunk: Vec<u8> = (0..512).map(|i| i as u8).collect();

        strm.deliver_chunk(&chunk, &sink, 0);

        assert_eq!(&view[256..768], &chunk[..]);
        assert_eq!(strm.offset, 768);
        // Mid-fragment start: one boundary crossed at 512.
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn log_offset_walks_and_wraps() {
        let (mut strm, _) = ring(2048);
        strm.frag_size = 512;
        assert_eq!(strm.next_log_offset(), 0);
        assert_eq!(strm.next_log_offset(), 512);
        assert_eq!(strm.next_log_offset(), 1024);
        assert_eq!(strm.next_log_offset(), 1536);
        assert_eq!(strm.next_log_offset(), 0);
    }

    #[test]
    fn open_count_tracks_acquired_flags() {
        let mut streams = [
            CaptureStream::default(),
            CaptureStream::default(),
            CaptureStream::default(),
        ];
        assert_eq!(num_open_capture(&streams), 0);
        streams[0].acquired = true;
        streams[2].acquired = true;
        assert_eq!(num_open_capture(&streams), 2);
    }
}
