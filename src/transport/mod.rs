//! Transport multiplexer: UDP, TCP, TLS and WebSocket behind one
//! open/get/send/release interface.
pub mod channel;
pub mod connection;
pub mod flow_token;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod tls;
pub mod transport_layer;
pub mod udp;
pub mod websocket;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};
pub use flow_token::{decode_flow_token, encode_flow_token};
pub use sip_addr::{Protocol, SipAddr};
pub use transport_layer::{ConnectionErrorSender, ConnectionRef, Flow, TransportLayer, ViaStamp};
