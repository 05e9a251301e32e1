pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod media;
pub mod negotiator;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::WebRtcPeerFactory;
pub use media::{MediaDevices, SampleMediaDevices, SampleTrack};
pub use negotiator::Negotiator;
pub use state::{FlagsUpdate, NegotiationFlags};
pub use transport::{
    DataChannel, DataChannelEvent, Dispatcher, HandlersUpdate, LocalTrack, PeerFactory,
    PeerHandlers, PeerTransport,
};
pub use types::{
    IceCandidate, IceServer, MediaKind, PeerConfig, PeerState, ServerConfig, SessionDescription,
    SignalingState, TrackInfo, TransportStats,
};
