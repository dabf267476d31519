//! LoRa messaging protocol: message model, codec, delivery engine

pub mod ack;
pub mod codec;
pub mod engine;
pub mod error;
pub mod message;
pub mod packet;
pub mod stats;

pub use ack::{DeliveryLog, DeliveryState, PendingAcks};
pub use codec::{normalize_key, Frame, MessageCodec};
pub use engine::{LoRaEngine, MessageHandler, MessageSender, ReceivedMessage};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    Alert, CommandPayload, Envelope, Extra, FenceTransition, GpsState, Heartbeat, Message,
    MessageIdGenerator, MessageType, Payload, PositionReport, ResponsePayload, StatusReport,
};
pub use packet::{decode_minimal, encode_minimal, MinimalPacket, MINIMAL_PACKET_LEN};
pub use stats::Statistics;
