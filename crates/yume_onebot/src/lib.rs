pub mod client;
pub mod event;
pub mod outbound;

pub use client::{connect, split_segments, EventReader, PrivateSender, WsSink};
pub use event::{Inbound, MessageEvent, OneBotEvent, OneBotResponse, SendMessageAction};
pub use outbound::{
    FrameKind, FrameSink, OutboundError, OutboundWriter, PendingWrite, TransportError,
    ENQUEUE_TIMEOUT, QUEUE_CAPACITY,
};
