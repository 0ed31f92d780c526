//! Indexed archive reader (§4.G).
//!
//! Parses a key/index file, resolves member archive paths on disk,
//! dereferences `(name, type)` resources by offset, and transparently
//! decompresses compressed archives to an on-disk cache. Everything
//! downstream of this crate consumes [`ResourceReader::read`] or
//! [`ResourceReader::size_of`]; nothing else touches the archive bytes.

pub mod archive;
pub mod compressed;
pub mod keyindex;
pub mod locator;
pub mod reader;
pub mod types;

pub use keyindex::KeyIndex;
pub use locator::Locator;
pub use reader::ResourceReader;
pub use types::ResourceInfo;
