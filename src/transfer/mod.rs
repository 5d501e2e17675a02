//! Transfer layer: encoding, chunking, and delivery of audio frames from
//! the capture context to the service context.

pub mod pcm;
pub mod sender;
pub mod transport;

pub use pcm::{encode_i16, encode_sample};
pub use sender::{ChunkSender, SpeakerTransferStats, TransferStats};
pub use transport::{ChannelTransport, MockTransport, Transport};
