//! Server lifecycle actions against a ConoHa-compatible OpenStack API.

pub mod conoha;

pub use conoha::{ConohaClient, RebootType, ServerHost, UnknownRebootType};
