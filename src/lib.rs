//! Choose-your-own-adventure viewer for generated story segments.
//!
//! A generation run writes markdown segment files into a session directory;
//! this crate parses them into a [`SegmentCollection`], renders segment
//! bodies as HTML, resolves clicked choices to segments and tracks the
//! reader's path through the story with a [`Navigator`].

pub mod collection;
pub mod formatter;
pub mod navigation;
pub mod resolver;
pub mod segment;
pub mod session;
pub mod views;

#[cfg(feature = "web")]
pub mod generator;
#[cfg(feature = "web")]
pub mod web;

pub use collection::{ENTRY_IDENTITY, RawSegment, SegmentCollection, SegmentKey};
pub use formatter::format;
pub use navigation::Navigator;
pub use resolver::{Resolution, resolve, resolve_key};
pub use segment::{Choice, Segment, parse, parse_source};
pub use session::{Session, SessionError, SessionStore};
