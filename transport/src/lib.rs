//! An encrypted, length-framed message transport with two RPC disciplines on top of it: a
//!  client side that correlates responses to requests by id, and a server side that dispatches
//!  requests to concurrently running workers.
//!
//! ## Layers
//!
//! * [codec] turns typed values into bytes and back. It has no state and does no I/O. Payload
//!    types are declared with [wire_struct], [wire_enum] and [wire_union] and need no changes to
//!    the codec itself.
//! * [framed_message] is the unit of exchange: a correlation id plus an opaque payload.
//! * [reactor] owns one encrypted stream exclusively, running the handshake and then an event
//!    loop that alternates between draining the outbound queue and assembling inbound frames.
//! * [client] turns fire-and-forget sends into request / response calls.
//! * [server_connection] queues inbound requests for workers, and [server] is the accept loop
//!    that spawns a worker per request.
//!
//! ## Wire format
//!
//! The stream is TLS over TCP. Inside the encrypted session, frames follow each other without
//!  padding or interleaving - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  correlation id (u64)
//! 8:  payload length (u64) - number of bytes following the header
//! 16: payload
//! ```
//!
//! The id is chosen by the sender of a request and echoed verbatim in the reply. It is scoped to
//!  one connection and carries no meaning beyond correlation: replies may arrive in any order.
//!
//! ## Payload encoding
//!
//! Payloads are codec encoded values:
//!
//! ```ascii
//! integer (wider than 1 byte):  8 bytes BE, sign extended for signed types
//! u8 / i8 / bool:               1 byte, no conversion
//! enum:                         ordinal, encoded as an integer
//! pair:                         first, then second
//! sequence / string:            count (integer), 'b', elements, 'e'
//! sum type:                     1-based variant index (integer), then the active alternative
//!                                (index 0 means 'no value' for Option)
//! struct:                       fields in declaration order
//! ```

pub mod codec;
pub mod wire_macros;
pub mod framed_message;
pub mod error;
pub mod config;
pub mod tls;
pub mod reactor;
pub mod client;
pub mod server_connection;
pub mod server;

pub use bytes;
