//! WebRTC data channel transport
//!
//! Connections are negotiated through an external [`RtcSignaller`]; the
//! peer with the lexicographically smaller id always sends the offer.

pub mod endpoint;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod peer;
pub mod signaller;
pub mod transport;

pub use endpoint::{RtcConnection, WebRtcEndpoint};
pub use peer::{NativeRtcPeerFactory, RtcPeer, RtcPeerFactory, RtcPeerParams, DATA_CHANNEL_LABEL};
pub use signaller::{
    AnswerOptions, ConnectOptions, ErrorOptions, IceCandidateOptions, Listener, OfferOptions,
    RtcSignaller,
};
pub use transport::WebRtcTransport;
