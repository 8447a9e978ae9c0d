// samplink public library surface.
//
// A lightweight bidirectional UDP messaging protocol between two asymmetric
// roles: a Peer (client) that negotiates a session and streams SampleUp
// messages, and a Controller (server) that allocates sessions, tracks peers,
// and streams SampleDown messages.

pub mod config;

pub mod bits;

pub mod fixed;

pub mod wire;

pub mod logging;

pub mod metrics;

pub mod transport;

pub mod peer;

pub mod controller;

pub use config::{Config, ConfigError, ControllerSettings, PeerSettings, TransportSettings};

pub use bits::{BitReader, BitWriter, CodecError, MAX_FIELD_BITS, MIN_FIELD_BITS};

pub use fixed::{from_fixed, to_fixed};

pub use wire::{
    decode_datagram, CommandType, Header, Message, MessageType, NegotiationRequest,
    NegotiationResponse, SampleDown, SampleUp, StatusType, WireError, HEADER_LEN,
    NEGOTIATION_PAYLOAD_LEN, SAMPLE_PAYLOAD_LEN, SIGNED_VALUE_LIMIT,
};

pub use logging::{hex_dump, LevelFilter, LogLevel, LogSink, TracingSink};

pub use metrics::{Metrics, MetricsError};

pub use transport::{
    DatagramHandler, Transport, TransportError, TransportOptions, DEFAULT_SEND_QUEUE_CAPACITY,
};

pub use peer::{Peer, PeerEvent, MISS_LIMIT};

pub use controller::{
    Controller, ControllerBuilder, ControllerEvent, NegotiationDecision, NegotiationHook,
    PeerRecord, SWEEP_PERIOD,
};
