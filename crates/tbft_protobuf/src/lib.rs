//! Message types exchanged by TBFT consensus nodes.
//!
//! [`protobuf`] holds the prost wire definitions, [`consensus`] the domain types used by the
//! engine, and [`converters`] the conversions between the two.

pub mod codec;
pub mod consensus;
pub mod converters;
pub mod protobuf;
