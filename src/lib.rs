//! A remote filesystem on top of the `transport` crate: a server exporting a local directory to
//!  authenticated users, and a typed client for it.
//!
//! Every request of a connection is handled independently. The first request must be a
//!  [messages::LoginReq]; afterwards every request that reads or modifies a path is checked
//!  against the server's [acl::Authorizer].

pub mod messages;
pub mod acl;
pub mod fs_server;
pub mod fs_client;
