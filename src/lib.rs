// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = include_str!("../README.md")]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(unreachable_pub)]
#![warn(unsafe_code)]
#![warn(clippy::pedantic)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(rustdoc::broken_intra_doc_links)]
// Repetitions of module/type names occur frequently when using many
// modules for keeping the size of the source files handy. Often
// types have the same name as their parent module.
#![allow(clippy::module_name_repetitions)]
// Repeating the type name in `..Default::default()` expressions
// is not needed since the context is obvious.
#![allow(clippy::default_trait_access)]

pub mod codec;
pub use self::codec::{
    decode, encode, try_decode, InvalidArgument, MalformedMessage, MidiEvent, MidiEventKind,
    RawMidiMessage, MAX_CHANNEL, MAX_U14, MAX_U7, PITCH_BEND_CENTER,
};

pub mod device;
pub use self::device::{
    ConnectionState, Device, DeviceId, DeviceKind, Generation, NativeDeviceId,
};

mod inbound;
pub use self::inbound::{EventSource, InboundEvent, InboundStats, MidiEventSink};

pub mod session;
pub use self::session::{
    ConnectError, DisconnectError, MidiSession, PollSummary, ReconnectReport, SendError,
    SessionConfig,
};

pub mod transport;
pub use self::transport::{MidiTransport, TransportDevice, TransportError};

#[cfg(feature = "midir")]
pub use self::transport::midir::{MidirPort, MidirTransport, MidirTransportConfig};
