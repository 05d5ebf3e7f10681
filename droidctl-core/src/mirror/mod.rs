//! Screen mirroring.
//!
//! - **resolution**: display size parsing and video size negotiation
//! - **agent**: pushing and launching the on-device streaming agent
//! - **decoder** / **surface**: platform seams for decoding and rendering
//! - **pipeline**: read loop feeding the decoder
//! - **input**: touch injection onto the control stream
//! - **controller**: the session lifecycle tying it all together

pub mod agent;
pub mod controller;
pub mod decoder;
pub mod input;
pub mod pipeline;
pub mod resolution;
pub mod surface;

pub use agent::{AgentOptions, AgentSource, LaunchParams};
pub use controller::{MirrorController, MirrorOptions, MirrorStatus};
pub use decoder::{OutputBuffer, VideoDecoder, VideoFormat};
pub use input::{ControlSink, InputInjector};
pub use pipeline::{DecodePipeline, FrameStats, PipelineEnd, PipelineOptions, VideoSource};
pub use resolution::{DisplaySize, Negotiated, QualityPreset, VideoSize};
pub use surface::RenderSurface;
