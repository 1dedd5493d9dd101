pub mod capture;
#[cfg(feature = "device")]
pub mod device;
pub mod meter;
pub mod output;
pub mod pcm;
pub mod pipeline;
pub mod schedule;

pub use output::{AudioOutput, ClockOutput};
pub use pipeline::{AudioPipeline, FrameSink, PipelineCallbacks};
pub use schedule::PlaybackSchedule;
