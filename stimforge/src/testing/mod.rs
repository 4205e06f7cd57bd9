//! Test fixtures: scripted service fakes and image builders.

mod fakes;
mod fixtures;
mod images;

pub use fakes::{
    FakeImages, FakeVideo, FakeVlm, ImageScript, Probe, VideoScript, VlmScript, FRAME_HEIGHT,
    FRAME_ROI, FRAME_WIDTH,
};
pub use fixtures::{descriptions, source_pair, stage_context_with_vlm, Harness};
pub use images::{drift_png, encode_png, gradient_png, mask_png, paint_roi, solid_png};
