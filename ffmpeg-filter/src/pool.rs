//! Reusable encoder-input frames for the video writer input.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ffmpeg_next::{format::Pixel, frame};
use parking_lot::Mutex;

struct PoolInner {
    available: VecDeque<frame::Video>,
    format: Pixel,
    width: u32,
    height: u32,
    max_size: usize,
    total_allocated: usize,
}

/// Pool of frames matching the encoder's pixel format and size. Cloning the
/// pool hands out another handle to the same frames.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<Mutex<PoolInner>>,
}

impl FramePool {
    pub fn new(format: Pixel, width: u32, height: u32, max_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                available: VecDeque::with_capacity(max_size),
                format,
                width,
                height,
                max_size,
                total_allocated: 0,
            })),
        }
    }

    /// Takes a free frame, allocating one when the pool is empty. The frame is
    /// made writable first, since the encoder may still hold a reference to
    /// its buffers.
    pub fn acquire(&self) -> anyhow::Result<PooledFrame> {
        let recycled = {
            let mut inner = self.inner.lock();
            let frame = inner.available.pop_front();
            if frame.is_none() {
                inner.total_allocated += 1;
            }
            frame
        };

        let frame = match recycled {
            Some(mut frame) => {
                let ret = unsafe { ffmpeg_next::ffi::av_frame_make_writable(frame.as_mut_ptr()) };
                if ret < 0 {
                    anyhow::bail!("pooled frame not writable: {}", ffmpeg_next::Error::from(ret));
                }
                frame
            }
            None => {
                let inner = self.inner.lock();
                frame::Video::new(inner.format, inner.width, inner.height)
            }
        };

        Ok(PooledFrame {
            frame,
            pool: self.clone(),
        })
    }

    fn release(&self, frame: frame::Video) {
        let mut inner = self.inner.lock();
        if inner.available.len() < inner.max_size
            && frame.format() == inner.format
            && frame.width() == inner.width
            && frame.height() == inner.height
        {
            inner.available.push_back(frame);
        }
    }

    pub fn available(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn total_allocated(&self) -> usize {
        self.inner.lock().total_allocated
    }
}

/// A frame on loan from a [`FramePool`]; goes back to the pool on drop.
pub struct PooledFrame {
    frame: frame::Video,
    pool: FramePool,
}

impl Deref for PooledFrame {
    type Target = frame::Video;

    fn deref(&self) -> &frame::Video {
        &self.frame
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut frame::Video {
        &mut self.frame
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        let frame = std::mem::replace(&mut self.frame, frame::Video::empty());
        self.pool.release(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_frames_are_reused() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let pool = FramePool::new(Pixel::YUV420P, 64, 48, 4);

        let first = pool.acquire()?;
        assert_eq!((first.width(), first.height()), (64, 48));
        drop(first);
        assert_eq!(pool.available(), 1);

        let _again = pool.acquire()?;
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.total_allocated(), 1);
        Ok(())
    }

    #[test]
    fn test_pool_keeps_at_most_max_size() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let pool = FramePool::new(Pixel::YUV420P, 16, 16, 2);

        let frames = (0..5).map(|_| pool.acquire()).collect::<anyhow::Result<Vec<_>>>()?;
        assert_eq!(pool.total_allocated(), 5);
        drop(frames);
        assert_eq!(pool.available(), 2);
        Ok(())
    }
}
