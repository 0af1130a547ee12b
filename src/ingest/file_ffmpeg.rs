//! Local file decoding using FFmpeg.
//!
//! Frames are decoded in-memory, converted to RGB24, and handed out in
//! presentation order. At end of input the decoder is flushed before the
//! source reports end of stream.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::collections::VecDeque;

use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    pending: VecDeque<RgbImage>,
    frames_decoded: u64,
    eof_sent: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", path))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            path: path.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            pending: VecDeque::new(),
            frames_decoded: 0,
            eof_sent: false,
        })
    }

    pub(crate) fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(image) = self.pending.pop_front() {
                self.frames_decoded += 1;
                return Ok(Some(Frame::new(image, self.frames_decoded)));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let packet = self
                .input
                .packets()
                .find(|(stream, _)| stream.index() == self.stream_index)
                .map(|(_, packet)| packet);
            match packet {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                    log::debug!("FileSource: {} reached end of input", self.path);
                }
            }
            self.receive_frames()?;
        }
    }

    fn receive_frames(&mut self) -> Result<()> {
        let mut decoded = ffmpeg::frame::Video::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let mut rgb_frame = ffmpeg::frame::Video::empty();
            self.scaler
                .run(&decoded, &mut rgb_frame)
                .context("scale frame to RGB")?;
            self.pending.push_back(frame_to_image(&rgb_frame)?);
        }
        Ok(())
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("ffmpeg frame buffer does not match {}x{}", width, height))
}
