pub mod assets;
pub mod compressor;
pub mod forwarder;
pub mod frame;
pub mod graph;
pub mod level;
pub mod recorder;
pub mod resample;
pub mod ring;
pub mod source;

pub use assets::{AssetPlayback, AssetPlayer};
pub use forwarder::SinkForwarder;
pub use frame::{AudioFrame, FABRIC_SAMPLE_RATE, FRAME_MS, TELEPHONY_SAMPLE_RATE};
pub use graph::{AudioGraphError, MixerConfig, MixerGraph};
pub use recorder::MasterRecorder;
pub use ring::{feed_pair, FeedConsumer, FeedProducer};
pub use source::{CaptureHandle, SourceId, SourceKind};
